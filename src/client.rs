//! Client composition root
//!
//! Wires the REST dispatcher and the shard manager together from one set of
//! options. The event stream is handed out on login.

use crate::config::ClientOptions;
use crate::error::{GatewayError, RestError};
use crate::gateway::connection::ShardEvent;
use crate::gateway::manager::{GatewayManager, ShardManager};
use crate::gateway::session::ShardStatus;
use crate::gateway::state::ShardRegistry;
use crate::metrics::GatewayMetrics;
use crate::rest::bucket::{BucketFactory, RequestOptions};
use crate::rest::dispatcher::RestDispatcher;
use crate::rest::transport::HttpTransport;
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Builder for [`Client`]
pub struct ClientBuilder {
    options: ClientOptions,
    transport: Option<Arc<dyn HttpTransport>>,
    bucket_factory: Option<BucketFactory>,
    metrics: GatewayMetrics,
}

impl ClientBuilder {
    /// Replace the reqwest transport used for REST calls
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use a custom rate bucket implementation
    pub fn bucket_factory(mut self, factory: BucketFactory) -> Self {
        self.bucket_factory = Some(factory);
        self
    }

    pub fn metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> Result<Client, GatewayError> {
        self.options.validate()?;

        let mut rest = RestDispatcher::builder(self.options.http.clone())
            .token(self.options.token.clone())
            .metrics(self.metrics.clone());
        if let Some(transport) = self.transport {
            rest = rest.transport(transport);
        }
        if let Some(factory) = self.bucket_factory {
            rest = rest.bucket_factory(factory);
        }

        Ok(Client {
            options: self.options,
            rest: rest.build()?,
            metrics: self.metrics,
            registry: ShardRegistry::new(),
            manager: Mutex::new(None),
        })
    }
}

/// Gateway plus REST client
pub struct Client {
    options: ClientOptions,
    rest: RestDispatcher,
    metrics: GatewayMetrics,
    registry: ShardRegistry,
    manager: Mutex<Option<Arc<dyn GatewayManager>>>,
}

impl Client {
    pub fn builder(options: ClientOptions) -> ClientBuilder {
        ClientBuilder {
            options,
            transport: None,
            bucket_factory: None,
            metrics: GatewayMetrics::detached(),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn rest(&self) -> &RestDispatcher {
        &self.rest
    }

    /// Shared shard state (for health checks)
    pub fn registry(&self) -> ShardRegistry {
        self.registry.clone()
    }

    /// Queue a REST request
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<Value, RestError> {
        self.rest.request(method, path, options).await
    }

    /// Start every shard and return the event stream
    ///
    /// Resolves once every shard reported READY. Dispatches of one shard
    /// arrive in the order the shard received them. A shard that stops for
    /// good after login sends [`ShardEvent::Terminated`] as its last event.
    pub async fn login(&self) -> Result<mpsc::Receiver<ShardEvent>, GatewayError> {
        let token = self.options.require_token()?.to_string();
        let (events_tx, events_rx) = mpsc::channel(self.options.ws.event_buffer);

        let manager: Arc<dyn GatewayManager> = Arc::new(
            ShardManager::new(
                self.options.clone(),
                token,
                self.rest.clone(),
                self.metrics.clone(),
                events_tx,
            )
            .with_registry(self.registry.clone()),
        );

        {
            let mut slot = self.manager.lock();
            if slot.is_some() {
                return Err(GatewayError::Config("client is already logged in".to_string()));
            }
            *slot = Some(Arc::clone(&manager));
        }

        if let Err(e) = manager.connect().await {
            self.manager.lock().take();
            return Err(e);
        }

        info!(status = %manager.status(), "Client logged in");
        Ok(events_rx)
    }

    fn manager(&self) -> Option<Arc<dyn GatewayManager>> {
        self.manager.lock().clone()
    }

    /// Aggregate shard status
    pub fn status(&self) -> ShardStatus {
        match self.manager() {
            Some(manager) => manager.status(),
            None => self.registry.aggregate_status(),
        }
    }

    /// Average heartbeat round trip, `None` before the first ACK
    pub fn ping(&self) -> Option<Duration> {
        match self.manager() {
            Some(manager) => manager.ping(),
            None => self.registry.average_ping(),
        }
    }

    /// Send a presence update to one shard or to every shard
    pub async fn update_presence(&self, shard_id: Option<u32>, presence: Value) -> Result<(), GatewayError> {
        match self.manager() {
            Some(manager) => manager.update_presence(shard_id, presence).await,
            None => Err(GatewayError::Config("client is not logged in".to_string())),
        }
    }

    /// Cancel queued REST requests and close every shard
    pub async fn destroy(&self) {
        self.rest.clear();
        let manager = self.manager.lock().take();
        if let Some(manager) = manager {
            manager.destroy().await;
        }
        info!("Client destroyed");
    }
}
