//! Identify serialization
//!
//! The provider enforces a global identify quota shared by every shard.
//! All identifies, including re-identifies after a dropped session, pass
//! through one gate: permits are handed out in request order, one at a time,
//! with at least `interval` between two identifies.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

/// Serializes identify calls across shards
#[derive(Debug)]
pub struct IdentifyGate {
    interval: Duration,
    last_identify: Arc<Mutex<Option<Instant>>>,
}

/// Exclusive right to send one identify
///
/// Held until the frame is written. Dropping it without calling
/// [`IdentifyPermit::complete`] releases the gate without consuming a slot.
#[derive(Debug)]
pub struct IdentifyPermit {
    shard_id: u32,
    guard: OwnedMutexGuard<Option<Instant>>,
}

impl IdentifyGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_identify: Arc::new(Mutex::new(None)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the gate, then for the spacing since the previous identify
    pub async fn acquire(self: Arc<Self>, shard_id: u32) -> IdentifyPermit {
        let guard = Arc::clone(&self.last_identify).lock_owned().await;

        if let Some(last) = *guard {
            let ready_at = last + self.interval;
            if ready_at > Instant::now() {
                debug!(
                    shard_id,
                    wait_ms = ready_at.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "Waiting for identify slot"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }

        IdentifyPermit { shard_id, guard }
    }
}

impl IdentifyPermit {
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    /// Record that the identify went out now and release the gate
    pub fn complete(mut self) {
        *self.guard = Some(Instant::now());
    }
}
