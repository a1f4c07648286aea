//! Prometheus metrics module
//!
//! Recording goes through the `metrics` facade, so library code can record
//! unconditionally. Only the binary installs the Prometheus recorder; without
//! it every call is a no-op and `render` returns an empty string.

use crate::error::GatewayError;
use crate::gateway::session::ShardStatus;
use ::metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;

/// Gateway metrics collector
#[derive(Clone, Default)]
pub struct GatewayMetrics {
    handle: Option<Arc<PrometheusHandle>>,
}

impl GatewayMetrics {
    /// Install the global Prometheus recorder
    ///
    /// Fails when a recorder is already installed in this process.
    pub fn install() -> Result<Self, GatewayError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| GatewayError::Config(format!("failed to install Prometheus recorder: {e}")))?;

        Self::register_metrics();

        Ok(Self {
            handle: Some(Arc::new(handle)),
        })
    }

    /// Collector that records into whatever recorder is installed, if any
    pub fn detached() -> Self {
        Self::default()
    }

    /// Register metric descriptions
    fn register_metrics() {
        // Gateway
        describe_counter!(
            "gateway_events_received_total",
            Unit::Count,
            "Dispatch events received from the gateway"
        );
        describe_histogram!(
            "gateway_heartbeat_latency_seconds",
            Unit::Seconds,
            "Heartbeat round-trip time"
        );
        describe_counter!(
            "gateway_reconnects_total",
            Unit::Count,
            "Shard reconnects, labelled by whether the session was resumed"
        );
        describe_counter!(
            "gateway_errors_total",
            Unit::Count,
            "Total gateway and REST errors"
        );
        describe_gauge!(
            "gateway_shard_status",
            Unit::Count,
            "Shard status rank (0=idle .. 6=connected)"
        );

        // REST
        describe_counter!(
            "rest_requests_total",
            Unit::Count,
            "REST attempts by bucket and response status"
        );
        describe_counter!(
            "rest_ratelimit_hits_total",
            Unit::Count,
            "429 responses by bucket"
        );
        describe_counter!(
            "rest_retries_total",
            Unit::Count,
            "REST retries after server or transport errors"
        );
    }

    /// Record a dispatch received on a shard
    pub fn record_event(&self, shard_id: u32, event_type: &str) {
        counter!(
            "gateway_events_received_total",
            "shard_id" => shard_id.to_string(),
            "event_type" => event_type.to_ascii_lowercase()
        )
        .increment(1);
    }

    pub fn record_heartbeat_latency(&self, shard_id: u32, latency: Duration) {
        histogram!(
            "gateway_heartbeat_latency_seconds",
            "shard_id" => shard_id.to_string()
        )
        .record(latency.as_secs_f64());
    }

    pub fn record_reconnect(&self, shard_id: u32, resume: bool) {
        counter!(
            "gateway_reconnects_total",
            "shard_id" => shard_id.to_string(),
            "resume" => if resume { "true" } else { "false" }
        )
        .increment(1);
    }

    /// Record an error by its `error_type_label`
    pub fn record_error(&self, error_type: &'static str) {
        counter!("gateway_errors_total", "error_type" => error_type).increment(1);
    }

    pub fn set_shard_status(&self, shard_id: u32, status: ShardStatus) {
        gauge!(
            "gateway_shard_status",
            "shard_id" => shard_id.to_string()
        )
        .set(f64::from(status.rank()));
    }

    pub fn record_rest_request(&self, bucket: &str, status: u16) {
        counter!(
            "rest_requests_total",
            "bucket" => bucket.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
    }

    pub fn record_ratelimit_hit(&self, bucket: &str, global: bool) {
        counter!(
            "rest_ratelimit_hits_total",
            "bucket" => bucket.to_string(),
            "global" => if global { "true" } else { "false" }
        )
        .increment(1);
    }

    pub fn record_rest_retry(&self, bucket: &str) {
        counter!("rest_retries_total", "bucket" => bucket.to_string()).increment(1);
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for GatewayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayMetrics")
            .field("installed", &self.handle.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_metrics_record_without_recorder() {
        let metrics = GatewayMetrics::detached();
        metrics.record_event(0, "MESSAGE_CREATE");
        metrics.record_error("codec");
        metrics.record_rest_request("GET /channels/1", 200);
        metrics.set_shard_status(0, ShardStatus::Connected);
        assert_eq!(metrics.render(), "");
    }
}
