//! Arrakis gateway client
//!
//! Sharded gateway sessions and a rate-limited REST pipeline for the
//! Discord API:
//! - One WebSocket per shard with identify/resume, heartbeats and
//!   JSON or ETF frames behind zlib-stream compression
//! - Identify calls serialized across shards
//! - Per-route rate buckets, the global limit and bounded retries for REST
//! - Health endpoints and Prometheus metrics for the service binary

pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod rest;

pub use client::{Client, ClientBuilder};
pub use config::ClientOptions;
pub use error::{CodecError, GatewayError, RestError};
pub use gateway::{ShardEvent, ShardStatus};
pub use rest::{RequestOptions, RestDispatcher};
