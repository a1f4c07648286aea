//! Client configuration module
//!
//! Option groups for the REST pipeline, the gateway sockets, shard selection
//! and reconnect backoff. Every field has a default; `from_env` layers
//! `ARRAKIS_<GROUP>__<FIELD>` variables over those defaults.

use crate::error::GatewayError;
use crate::gateway::codec::Encoding;
use crate::gateway::compression::Compression;
use crate::gateway::protocol::Intents;
use serde::Deserialize;
use serde_json::Value;
use std::env;
use std::time::Duration;

/// Floor for the delay after a 5xx response, in seconds
pub const MIN_REQUEST_ERROR_DELAY: u64 = 15;

/// Client configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Bot token, sent as `Authorization: Bot <token>`
    pub token: Option<String>,
    pub http: HttpOptions,
    pub ws: WsOptions,
    pub shards: ShardOptions,
    pub backoff: BackoffConfig,
}

/// REST pipeline options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpOptions {
    pub api_base: String,
    pub api_version: u8,
    /// Seconds to wait after a 5xx before retrying (doubled after the first retry)
    pub request_error_delay: u64,
    /// Retries on 5xx/transport failure before the request fails
    pub request_max_retries: u32,
    /// Times one request may be requeued after a 429 before it fails
    pub request_max_ratelimit_retries: u32,
    /// Seconds added to every reset time and waited after each request
    pub rest_time_offset: f64,
    /// Per-attempt HTTP timeout in seconds
    pub request_timeout: u64,
    pub user_agent: String,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            api_base: "https://discord.com/api".to_string(),
            api_version: 10,
            request_error_delay: 30,
            request_max_retries: 3,
            request_max_ratelimit_retries: 10,
            rest_time_offset: 0.0,
            request_timeout: 15,
            user_agent: format!(
                "DiscordBot ({}, {})",
                env!("CARGO_PKG_REPOSITORY"),
                env!("CARGO_PKG_VERSION")
            ),
        }
    }
}

impl HttpOptions {
    /// Versioned API root, e.g. `https://discord.com/api/v10`
    pub fn api_url(&self) -> String {
        format!("{}/v{}", self.api_base.trim_end_matches('/'), self.api_version)
    }

    pub fn error_delay(&self) -> Duration {
        Duration::from_secs(self.request_error_delay)
    }

    pub fn time_offset(&self) -> Duration {
        Duration::try_from_secs_f64(self.rest_time_offset).unwrap_or(Duration::ZERO)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

/// Gateway socket options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WsOptions {
    /// Gateway URL override; discovered over REST when absent
    pub gateway_url: Option<String>,
    pub encoding: Encoding,
    pub compression: Compression,
    /// Member count after which a guild counts as large (50..=250)
    pub large_threshold: u16,
    /// Initial presence sent with identify
    pub presence: Option<Value>,
    /// Raw intent bits
    pub intents: u64,
    /// Dispatch names that advance the sequence but are not forwarded
    pub disabled_events: Vec<String>,
    /// Capacity of the bounded event channel
    pub event_buffer: usize,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            gateway_url: None,
            encoding: Encoding::default(),
            compression: Compression::default(),
            large_threshold: 250,
            presence: None,
            intents: Intents::default().bits(),
            disabled_events: Vec::new(),
            event_buffer: 1024,
        }
    }
}

impl WsOptions {
    pub fn intents(&self) -> Intents {
        Intents::from_bits_truncate(self.intents)
    }
}

/// Shard selection options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShardOptions {
    pub shard_count: Option<u32>,
    pub min_shard_id: Option<u32>,
    pub max_shard_id: Option<u32>,
    /// Spacing between two identify calls, in milliseconds
    pub identify_interval_ms: u64,
}

impl Default for ShardOptions {
    fn default() -> Self {
        Self {
            shard_count: None,
            min_shard_id: None,
            max_shard_id: None,
            identify_interval_ms: 5_000,
        }
    }
}

impl ShardOptions {
    /// Explicit `(first, last, total)` range when every bound is configured
    pub fn explicit_range(&self) -> Option<(u32, u32, u32)> {
        match (self.min_shard_id, self.max_shard_id, self.shard_count) {
            (Some(min), Some(max), Some(count)) => Some((min, max, count)),
            _ => None,
        }
    }

    pub fn identify_interval(&self) -> Duration {
        Duration::from_millis(self.identify_interval_ms)
    }
}

/// Reconnect backoff configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,
    /// Full jitter: a random delay between 0 and the computed value
    pub jitter: bool,
    /// Consecutive failed connects before the shard gives up
    pub max_connect_attempts: u32,
    pub connect_timeout_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: true,
            max_connect_attempts: 10,
            connect_timeout_ms: 30_000,
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        if self.jitter {
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl ClientOptions {
    /// Load configuration from environment variables
    ///
    /// `.env` is honoured. `DISCORD_TOKEN` (or `DISCORD_BOT_TOKEN`) fills the
    /// token when `ARRAKIS_TOKEN` is not set.
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();

        let source = config::Environment::with_prefix("ARRAKIS")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("ws.disabled_events");

        let mut options: Self = config::Config::builder()
            .add_source(source)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatewayError::Config(format!("invalid ARRAKIS_* configuration: {e}")))?;

        if options.token.is_none() {
            options.token = env::var("DISCORD_TOKEN")
                .or_else(|_| env::var("DISCORD_BOT_TOKEN"))
                .ok();
        }

        options.validate()?;
        Ok(options)
    }

    /// Check floors and ranges
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.http.request_error_delay < MIN_REQUEST_ERROR_DELAY {
            return Err(GatewayError::Config(format!(
                "http.request_error_delay must be at least {MIN_REQUEST_ERROR_DELAY} seconds, got {}",
                self.http.request_error_delay
            )));
        }
        if !self.http.rest_time_offset.is_finite() || self.http.rest_time_offset < 0.0 {
            return Err(GatewayError::Config(
                "http.rest_time_offset must be a non-negative number".to_string(),
            ));
        }
        if !(50..=250).contains(&self.ws.large_threshold) {
            return Err(GatewayError::Config(format!(
                "ws.large_threshold must be between 50 and 250, got {}",
                self.ws.large_threshold
            )));
        }
        if self.ws.event_buffer == 0 {
            return Err(GatewayError::Config("ws.event_buffer must be positive".to_string()));
        }
        if let Some(ref presence) = self.ws.presence {
            if !presence.is_object() {
                return Err(GatewayError::Config("ws.presence must be an object".to_string()));
            }
        }

        match (self.shards.min_shard_id, self.shards.max_shard_id, self.shards.shard_count) {
            (_, _, Some(0)) => {
                return Err(GatewayError::Config("shards.shard_count must be positive".to_string()))
            }
            (Some(min), Some(max), Some(count)) if min > max || max >= count => {
                return Err(GatewayError::Config(format!(
                    "shard range {min}..={max} does not fit shard_count {count}"
                )))
            }
            _ => {}
        }

        if self.backoff.max_delay_ms < self.backoff.initial_delay_ms {
            return Err(GatewayError::Config(
                "backoff.max_delay_ms must be >= backoff.initial_delay_ms".to_string(),
            ));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(GatewayError::Config("backoff.multiplier must be >= 1.0".to_string()));
        }
        if self.backoff.max_connect_attempts == 0 {
            return Err(GatewayError::Config(
                "backoff.max_connect_attempts must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Token for authenticated calls, failing when none is configured
    pub fn require_token(&self) -> Result<&str, GatewayError> {
        self.token.as_deref().filter(|t| !t.is_empty()).ok_or_else(|| {
            GatewayError::Config("DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string())
        })
    }
}

/// Process-level settings read by the binary
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Health/metrics HTTP port
    pub http_port: u16,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, GatewayError> {
        let http_port = env::var("HTTP_PORT")
            .or_else(|_| env::var("METRICS_PORT"))
            .unwrap_or_else(|_| "9090".to_string())
            .parse()
            .map_err(|e| GatewayError::Config(format!("HTTP_PORT must be a valid port number: {e}")))?;

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            http_port,
            log_level,
        })
    }
}
