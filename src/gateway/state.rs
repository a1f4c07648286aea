//! Shard state tracking
//!
//! Non-owning view of every shard, keyed by shard id. Each connection
//! publishes a snapshot of its session after every state change; the manager
//! and the health endpoints compute aggregates from these on demand.

use crate::gateway::session::{ShardSession, ShardStatus};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Point-in-time copy of one shard's session
#[derive(Debug, Clone)]
pub struct ShardSnapshot {
    pub shard_id: u32,
    pub status: ShardStatus,
    pub latency: Option<Duration>,
    pub seq: Option<u64>,
    pub resumable: bool,
    pub last_heartbeat_ack: Option<Instant>,
    pub connected_at: Option<Instant>,
    pub events_received: u64,
}

impl ShardSnapshot {
    fn new(shard_id: u32) -> Self {
        Self {
            shard_id,
            status: ShardStatus::Disconnected,
            latency: None,
            seq: None,
            resumable: false,
            last_heartbeat_ack: None,
            connected_at: None,
            events_received: 0,
        }
    }
}

/// Serializable per-shard summary for the readiness endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ShardSummary {
    pub shard_id: u32,
    pub status: ShardStatus,
    pub ping_ms: Option<f64>,
    pub events_received: u64,
}

#[derive(Debug)]
struct Entry {
    snapshot: ShardSnapshot,
    events_received: AtomicU64,
}

/// Shared state across all shards of a manager
#[derive(Debug, Clone, Default)]
pub struct ShardRegistry {
    shards: Arc<DashMap<u32, Entry>>,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a shard before its connection starts
    pub fn register(&self, shard_id: u32) {
        self.shards.entry(shard_id).or_insert_with(|| Entry {
            snapshot: ShardSnapshot::new(shard_id),
            events_received: AtomicU64::new(0),
        });
    }

    /// Copy the session's current state
    pub fn publish(&self, session: &ShardSession) {
        let shard_id = session.shard_id();
        let mut entry = self.shards.entry(shard_id).or_insert_with(|| Entry {
            snapshot: ShardSnapshot::new(shard_id),
            events_received: AtomicU64::new(0),
        });

        let snapshot = &mut entry.snapshot;
        if session.status().is_connected() && !snapshot.status.is_connected() {
            snapshot.connected_at = Some(Instant::now());
        } else if !session.status().is_connected() {
            snapshot.connected_at = None;
        }
        snapshot.status = session.status();
        snapshot.latency = session.latest_latency();
        snapshot.seq = session.seq();
        snapshot.resumable = session.is_resumable();
        snapshot.last_heartbeat_ack = session.last_heartbeat_ack();
    }

    /// Increment event received counter
    pub fn record_event(&self, shard_id: u32) {
        if let Some(entry) = self.shards.get(&shard_id) {
            entry.events_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get(&self, shard_id: u32) -> Option<ShardSnapshot> {
        self.shards.get(&shard_id).map(|e| {
            let mut snapshot = e.snapshot.clone();
            snapshot.events_received = e.events_received.load(Ordering::Relaxed);
            snapshot
        })
    }

    pub fn status(&self, shard_id: u32) -> Option<ShardStatus> {
        self.shards.get(&shard_id).map(|e| e.snapshot.status)
    }

    /// All snapshots, ordered by shard id
    pub fn snapshots(&self) -> Vec<ShardSnapshot> {
        let mut all: Vec<ShardSnapshot> = self
            .shards
            .iter()
            .map(|e| {
                let mut snapshot = e.snapshot.clone();
                snapshot.events_received = e.events_received.load(Ordering::Relaxed);
                snapshot
            })
            .collect();
        all.sort_by_key(|s| s.shard_id);
        all
    }

    pub fn summaries(&self) -> Vec<ShardSummary> {
        self.snapshots()
            .into_iter()
            .map(|s| ShardSummary {
                shard_id: s.shard_id,
                status: s.status,
                ping_ms: s.latency.map(|d| d.as_secs_f64() * 1000.0),
                events_received: s.events_received,
            })
            .collect()
    }

    /// Best status found across shards; `Disconnected` with no shards
    pub fn aggregate_status(&self) -> ShardStatus {
        self.shards
            .iter()
            .map(|e| e.snapshot.status)
            .max_by_key(|s| s.rank())
            .unwrap_or(ShardStatus::Disconnected)
    }

    /// Mean of each shard's most recent latency sample; `None` without samples
    pub fn average_ping(&self) -> Option<Duration> {
        let samples: Vec<Duration> = self
            .shards
            .iter()
            .filter_map(|e| e.snapshot.latency)
            .collect();
        if samples.is_empty() {
            return None;
        }
        let total: Duration = samples.iter().sum();
        Some(total / samples.len() as u32)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Get count of connected shards
    pub fn ready_shards(&self) -> usize {
        self.shards
            .iter()
            .filter(|e| e.snapshot.status.is_connected())
            .count()
    }

    pub fn total_events_received(&self) -> u64 {
        self.shards
            .iter()
            .map(|e| e.events_received.load(Ordering::Relaxed))
            .sum()
    }

    /// Every tracked shard is connected
    pub fn is_ready(&self) -> bool {
        !self.shards.is_empty() && self.ready_shards() == self.shard_count()
    }
}
