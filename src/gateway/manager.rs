//! Shard manager
//!
//! Resolves the shard range, starts one [`GatewayConnection`] per shard and
//! aggregates their state. Shards are started one after another: the next
//! shard is only spawned once the previous one reported READY, and every
//! identify additionally passes through the shared [`IdentifyGate`].

use crate::config::ClientOptions;
use crate::error::GatewayError;
use crate::gateway::connection::{ConnectionSettings, GatewayConnection, ShardCommand, ShardEvent};
use crate::gateway::identify::IdentifyGate;
use crate::gateway::protocol::{GatewayPayload, IdentifyParams};
use crate::gateway::session::ShardStatus;
use crate::gateway::state::ShardRegistry;
use crate::metrics::GatewayMetrics;
use crate::rest::RestDispatcher;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Commands queued per shard before the connection loop picks them up
const COMMAND_BUFFER: usize = 32;

/// Pluggable gateway manager
#[async_trait]
pub trait GatewayManager: Send + Sync {
    /// Start every shard; resolves once all of them are ready
    async fn connect(&self) -> Result<(), GatewayError>;

    /// Most connected status across shards
    fn status(&self) -> ShardStatus;

    /// Mean of the latest heartbeat round trip of every shard
    fn ping(&self) -> Option<Duration>;

    /// Send a presence update to one shard, or to all of them
    async fn update_presence(&self, shard_id: Option<u32>, presence: Value) -> Result<(), GatewayError>;

    /// Close every shard for good
    async fn destroy(&self);
}

/// `GET /gateway/bot` response
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayBotInfo {
    pub url: String,
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartLimit {
    #[serde(default)]
    pub total: u64,
    pub remaining: u64,
    /// Milliseconds until the limit resets
    #[serde(default)]
    pub reset_after: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

fn default_max_concurrency() -> u32 {
    1
}

/// Which shards this process runs, and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlan {
    pub gateway_url: String,
    pub shard_ids: Vec<u32>,
    pub shard_count: u32,
}

struct ShardHandle {
    commands: mpsc::Sender<ShardCommand>,
    task: JoinHandle<Result<(), GatewayError>>,
}

/// Default [`GatewayManager`]: one connection task per shard
pub struct ShardManager {
    options: ClientOptions,
    token: String,
    rest: RestDispatcher,
    gate: Arc<IdentifyGate>,
    registry: ShardRegistry,
    metrics: GatewayMetrics,
    events: mpsc::Sender<ShardEvent>,
    shards: Mutex<BTreeMap<u32, ShardHandle>>,
}

impl ShardManager {
    pub fn new(
        options: ClientOptions,
        token: String,
        rest: RestDispatcher,
        metrics: GatewayMetrics,
        events: mpsc::Sender<ShardEvent>,
    ) -> Self {
        let gate = Arc::new(IdentifyGate::new(options.shards.identify_interval()));
        Self {
            options,
            token,
            rest,
            gate,
            registry: ShardRegistry::new(),
            metrics,
            events,
            shards: Mutex::new(BTreeMap::new()),
        }
    }

    /// Publish shard state into an existing registry
    pub fn with_registry(mut self, registry: ShardRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Shared shard state (for health checks)
    pub fn registry(&self) -> ShardRegistry {
        self.registry.clone()
    }

    /// Ids of the running shards
    pub fn shard_ids(&self) -> Vec<u32> {
        self.shards.lock().keys().copied().collect()
    }

    /// Resolve the shard range, asking the provider when it is not configured
    pub async fn plan(&self) -> Result<ShardPlan, GatewayError> {
        let shards = &self.options.shards;

        if let (Some((min, max, count)), Some(url)) =
            (shards.explicit_range(), self.options.ws.gateway_url.as_ref())
        {
            return Ok(ShardPlan {
                gateway_url: url.clone(),
                shard_ids: (min..=max).collect(),
                shard_count: count,
            });
        }

        let raw = self.rest.get("/gateway/bot").await?;
        let info: GatewayBotInfo = serde_json::from_value(raw)
            .map_err(|e| GatewayError::Config(format!("unexpected /gateway/bot response: {e}")))?;

        let (shard_ids, shard_count) = match (shards.explicit_range(), shards.shard_count) {
            (Some((min, max, count)), _) => ((min..=max).collect::<Vec<_>>(), count),
            (None, Some(count)) => ((0..count).collect(), count),
            (None, None) => ((0..info.shards.max(1)).collect(), info.shards.max(1)),
        };

        let required = shard_ids.len() as u64;
        if info.session_start_limit.remaining < required {
            return Err(GatewayError::IdentifyLimitExhausted {
                remaining: info.session_start_limit.remaining,
                required,
            });
        }

        info!(
            recommended_shards = info.shards,
            shard_count,
            identify_remaining = info.session_start_limit.remaining,
            max_concurrency = info.session_start_limit.max_concurrency,
            "Gateway discovered"
        );

        Ok(ShardPlan {
            gateway_url: self.options.ws.gateway_url.clone().unwrap_or(info.url),
            shard_ids,
            shard_count,
        })
    }

    fn settings(&self, gateway_url: String) -> ConnectionSettings {
        let ws = &self.options.ws;
        ConnectionSettings {
            gateway_url,
            api_version: self.options.http.api_version,
            encoding: ws.encoding,
            compression: ws.compression,
            identify: IdentifyParams {
                token: self.token.clone(),
                intents: ws.intents(),
                large_threshold: ws.large_threshold,
                presence: ws.presence.clone(),
                payload_compression: false,
            },
            backoff: self.options.backoff.clone(),
            disabled_events: Arc::new(ws.disabled_events.iter().cloned().collect()),
        }
    }

    /// Spawn one shard and wait for its first READY
    async fn start_shard(
        &self,
        shard_id: u32,
        shard_count: u32,
        settings: ConnectionSettings,
    ) -> Result<(), GatewayError> {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();

        let connection = GatewayConnection::new(
            shard_id,
            shard_count,
            settings,
            Arc::clone(&self.gate),
            self.registry.clone(),
            self.metrics.clone(),
            self.events.clone(),
            commands_rx,
        )?
        .with_ready_signal(ready_tx);

        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let result = connection.run().await;
            if let Err(ref e) = result {
                error!(shard_id, error = %e, "Shard task failed");
                // Nobody is listening once the client is gone.
                let _ = events.send(ShardEvent::terminated(shard_id, e)).await;
            }
            result
        });
        self.shards.lock().insert(
            shard_id,
            ShardHandle {
                commands: commands_tx,
                task,
            },
        );

        if ready_rx.await.is_ok() {
            return Ok(());
        }

        // The connection ended before READY; surface its error.
        let handle = self.shards.lock().remove(&shard_id);
        match handle {
            Some(handle) => match handle.task.await {
                Ok(Err(e)) => Err(e),
                Ok(Ok(())) => Err(GatewayError::ShuttingDown),
                Err(e) => Err(GatewayError::Connection {
                    shard_id,
                    attempts: 0,
                    last_error: e.to_string(),
                }),
            },
            None => Err(GatewayError::ShuttingDown),
        }
    }

    fn senders(&self, shard_id: Option<u32>) -> Vec<(u32, mpsc::Sender<ShardCommand>)> {
        let shards = self.shards.lock();
        shards
            .iter()
            .filter(|(id, _)| shard_id.map_or(true, |wanted| **id == wanted))
            .map(|(id, handle)| (*id, handle.commands.clone()))
            .collect()
    }

    async fn command(
        &self,
        shard_id: Option<u32>,
        make: impl Fn() -> ShardCommand,
    ) -> Result<(), GatewayError> {
        let targets = self.senders(shard_id);
        if let (Some(id), true) = (shard_id, targets.is_empty()) {
            return Err(GatewayError::Config(format!("shard {id} is not running")));
        }
        for (_, commands) in targets {
            commands
                .send(make())
                .await
                .map_err(|_| GatewayError::ShuttingDown)?;
        }
        Ok(())
    }

    /// Send a raw payload on one shard
    pub async fn send(&self, shard_id: u32, payload: GatewayPayload) -> Result<(), GatewayError> {
        self.command(Some(shard_id), || ShardCommand::Send(payload.clone()))
            .await
    }

    /// Drop a shard's socket and resume its session
    pub async fn reconnect(&self, shard_id: u32) -> Result<(), GatewayError> {
        self.command(Some(shard_id), || ShardCommand::Reconnect).await
    }
}

#[async_trait]
impl GatewayManager for ShardManager {
    async fn connect(&self) -> Result<(), GatewayError> {
        let plan = self.plan().await?;
        info!(
            shard_ids = ?plan.shard_ids,
            shard_count = plan.shard_count,
            gateway_url = %plan.gateway_url,
            "Starting shards"
        );

        let settings = self.settings(plan.gateway_url);
        for shard_id in plan.shard_ids {
            if let Err(e) = self.start_shard(shard_id, plan.shard_count, settings.clone()).await {
                warn!(shard_id, error = %e, "Shard failed to start, stopping the others");
                self.destroy().await;
                return Err(e);
            }
        }

        info!(shards = self.registry.shard_count(), "All shards ready");
        Ok(())
    }

    fn status(&self) -> ShardStatus {
        self.registry.aggregate_status()
    }

    fn ping(&self) -> Option<Duration> {
        self.registry.average_ping()
    }

    async fn update_presence(&self, shard_id: Option<u32>, presence: Value) -> Result<(), GatewayError> {
        if !presence.is_object() {
            return Err(GatewayError::Config("presence must be an object".to_string()));
        }
        self.command(shard_id, || ShardCommand::UpdatePresence(presence.clone()))
            .await
    }

    async fn destroy(&self) {
        let shards = std::mem::take(&mut *self.shards.lock());
        if shards.is_empty() {
            return;
        }

        for handle in shards.values() {
            // A shard that already stopped has dropped its receiver.
            let _ = handle.commands.send(ShardCommand::Destroy).await;
        }
        for (shard_id, handle) in shards {
            match handle.task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(shard_id, error = %e, "Shard stopped with an error"),
                Err(e) => warn!(shard_id, error = %e, "Shard task panicked"),
            }
        }
        info!("All shards destroyed");
    }
}
