//! Domain error types for the gateway client
//!
//! Structured thiserror types for the three failure domains: the wire codec,
//! the gateway session, and the REST pipeline.
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All library code returns one of the enums below.

use thiserror::Error;

/// Wire codec errors
///
/// A codec error drops the offending frame; it does not kill the connection.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Frame could not be decoded
    #[error("{encoding} decoder was unable to decode the data: {reason}")]
    Decode {
        encoding: &'static str,
        reason: String,
    },

    /// Message could not be encoded
    #[error("{encoding} encoder was unable to encode the data: {reason}")]
    Encode {
        encoding: &'static str,
        reason: String,
    },

    /// Encoding or compression cannot run in this environment
    #[error("{name} is not supported: {reason}")]
    Unsupported { name: &'static str, reason: String },

    /// Compressed stream could not be inflated
    #[error("{compression} stream decompression failed: {reason}")]
    Decompress {
        compression: &'static str,
        reason: String,
    },
}

impl CodecError {
    pub(crate) fn decode(encoding: &'static str, reason: impl Into<String>) -> Self {
        Self::Decode {
            encoding,
            reason: reason.into(),
        }
    }

    pub(crate) fn encode(encoding: &'static str, reason: impl Into<String>) -> Self {
        Self::Encode {
            encoding,
            reason: reason.into(),
        }
    }
}

/// Gateway session errors
///
/// Every variant carries structured context fields for diagnostics.
///
/// Example log output:
/// ```text
/// GatewayError::FatalSession { shard_id: 3, code: 4004, reason: "Authentication failed" }
/// → "shard 3 session closed with fatal code 4004: Authentication failed"
/// ```
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Transport could not be established after the configured attempts
    #[error("shard {shard_id} connection failed after {attempts} attempts: {last_error}")]
    Connection {
        shard_id: u32,
        attempts: u32,
        last_error: String,
    },

    /// Provider closed the session with a code that must not be retried
    #[error("shard {shard_id} session closed with fatal code {code}: {reason}")]
    FatalSession {
        shard_id: u32,
        code: u16,
        reason: String,
    },

    /// Frame codec failure
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// WebSocket protocol error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Configuration error (option missing or out of range)
    #[error("configuration error: {0}")]
    Config(String),

    /// Not enough identify budget left to start every shard
    #[error("remaining identify limit is not sufficient ({remaining} left, {required} shards)")]
    IdentifyLimitExhausted { remaining: u64, required: u64 },

    /// Gateway discovery over REST failed
    #[error(transparent)]
    Rest(#[from] RestError),

    /// Manager or connection is shutting down
    #[error("gateway is shutting down")]
    ShuttingDown,
}

impl GatewayError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `gateway_errors_total`.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::FatalSession { .. } => "fatal_session",
            Self::Codec(_) => "codec",
            Self::WebSocket(_) => "websocket",
            Self::Config(_) => "config",
            Self::IdentifyLimitExhausted { .. } => "identify_limit",
            Self::Rest(_) => "rest",
            Self::ShuttingDown => "shutting_down",
        }
    }

    /// Whether the failure ends the shard for good.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FatalSession { .. } | Self::Config(_) | Self::IdentifyLimitExhausted { .. }
        )
    }
}

/// REST pipeline errors surfaced to callers
///
/// Rate limits and transient faults are recovered inside the dispatcher;
/// a caller only sees one of these once retries are exhausted.
#[derive(Error, Debug)]
pub enum RestError {
    /// 5xx after the retry bound was hit
    #[error("upstream server error {status}: {body}")]
    UpstreamServer { status: u16, body: String },

    /// Still rate limited after the 429 retry bound was hit
    #[error("rate limited after {attempts} attempts (retry after {retry_after:?}, global: {global})")]
    RateLimited {
        attempts: u32,
        retry_after: std::time::Duration,
        global: bool,
    },

    /// 4xx other than 429, never retried
    #[error("upstream client error {status}: {body}")]
    UpstreamClient { status: u16, body: String },

    /// Network failure after the retry bound was hit
    #[error("http transport failed: {0}")]
    Transport(String),

    /// Request exceeded the configured timeout on its last attempt
    #[error("http request timed out")]
    Timeout,

    /// Request was dropped from its bucket before it settled
    #[error("request was cancelled before completion")]
    Cancelled,

    /// Successful response carried an undecodable body
    #[error("response body could not be decoded")]
    Decode(#[from] serde_json::Error),

    /// Request could not be built
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RestError {
    /// Returns a static label string suitable for Prometheus metrics.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::UpstreamServer { .. } => "upstream_server",
            Self::UpstreamClient { .. } => "upstream_client",
            Self::RateLimited { .. } => "rate_limited",
            Self::Transport(_) => "transport",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Decode(_) => "decode",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }

    /// HTTP status of the failed response, when there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::UpstreamServer { status, .. } | Self::UpstreamClient { status, .. } => {
                Some(*status)
            }
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}
