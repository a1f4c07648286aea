//! Per-route rate bucket
//!
//! A bucket tracks the provider's advertised budget for one route signature
//! and holds the FIFO queue of requests waiting for it. It does no I/O; the
//! dispatcher drives it.

use crate::error::RestError;
use reqwest::Method;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Binary attachment sent as a multipart file part
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub data: Vec<u8>,
    pub content_type: Option<String>,
}

/// Caller-provided request options
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// JSON body; sent as `payload_json` when attachments are present
    pub body: Option<Value>,
    pub files: Vec<Attachment>,
    pub query: Vec<(String, String)>,
    pub audit_log_reason: Option<String>,
    /// Skip the `Authorization` header
    pub no_auth: bool,
    /// Wait for the global limit before executing
    pub counts_against_global: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            body: None,
            files: Vec::new(),
            query: Vec::new(),
            audit_log_reason: None,
            no_auth: false,
            counts_against_global: true,
        }
    }
}

impl RequestOptions {
    pub fn json(body: Value) -> Self {
        Self {
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.audit_log_reason = Some(reason.into());
        self
    }

    pub fn with_file(mut self, file: Attachment) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Outcome channel for a queued request
pub type Responder = oneshot::Sender<Result<Value, RestError>>;

/// A request owned by its bucket until executed
#[derive(Debug)]
pub struct PendingRequest {
    pub id: Uuid,
    pub method: Method,
    pub path: String,
    pub options: RequestOptions,
    /// Retries consumed after server or transport errors
    pub retries: u32,
    /// Requeues consumed after 429 responses
    pub ratelimit_retries: u32,
    responder: Responder,
}

impl PendingRequest {
    pub fn new(
        method: Method,
        path: impl Into<String>,
        options: RequestOptions,
    ) -> (Self, oneshot::Receiver<Result<Value, RestError>>) {
        let (responder, rx) = oneshot::channel();
        let request = Self {
            id: Uuid::new_v4(),
            method,
            path: path.into(),
            options,
            retries: 0,
            ratelimit_retries: 0,
            responder,
        };
        (request, rx)
    }

    /// The caller stopped waiting for this request
    pub fn is_cancelled(&self) -> bool {
        self.responder.is_closed()
    }

    /// Settle the caller's future
    pub fn settle(self, result: Result<Value, RestError>) {
        // A caller that went away has nothing left to notify.
        let _ = self.responder.send(result);
    }
}

/// Result of a bucket state query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketMeta {
    pub limited: bool,
    pub reset_at: Option<Instant>,
}

/// Rate-limit state plus request queue for one route
pub trait RateBucket: Send {
    fn endpoint(&self) -> &str;

    /// Queued requests, including cancelled ones not yet purged
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append to the tail
    fn push(&mut self, request: PendingRequest);

    /// Reinsert at the head and give back the slot it will consume again
    fn unshift(&mut self, request: PendingRequest);

    /// Pop the next live request and consume one slot
    fn shift(&mut self) -> Option<PendingRequest>;

    /// Next live request, dropping cancelled ones from the head
    fn peek(&mut self) -> Option<&PendingRequest>;

    /// Current limit state; an elapsed reset refills the budget first
    fn meta(&mut self, now: Instant) -> BucketMeta;

    /// Apply observed headers; all `None` refunds one slot
    fn handle_ratelimit(
        &mut self,
        limit: Option<u32>,
        remaining: Option<i64>,
        reset_at: Option<Instant>,
        now: Instant,
    );

    /// Zero the budget and drop every queued request unsettled
    fn clear(&mut self);

    fn is_busy(&self) -> bool;

    fn set_busy(&mut self, busy: bool);
}

/// Factory for custom bucket implementations, keyed by route signature
pub type BucketFactory = std::sync::Arc<dyn Fn(&str) -> Box<dyn RateBucket> + Send + Sync>;

/// In-memory bucket
///
/// `limit == 0` means no limit has been observed. `remaining == None` stands
/// for an unbounded budget and absorbs increments and decrements.
#[derive(Debug)]
pub struct MemoryBucket {
    endpoint: String,
    limit: u32,
    remaining: Option<i64>,
    reset_at: Option<Instant>,
    queue: VecDeque<PendingRequest>,
    busy: bool,
}

impl MemoryBucket {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            limit: 0,
            remaining: None,
            reset_at: None,
            queue: VecDeque::new(),
            busy: false,
        }
    }

    pub fn limit(&self) -> Option<u32> {
        (self.limit != 0).then_some(self.limit)
    }

    /// `None` when unbounded
    pub fn remaining(&self) -> Option<i64> {
        self.remaining
    }

    pub fn reset_at(&self) -> Option<Instant> {
        self.reset_at
    }

    fn purge_cancelled(&mut self) {
        while self.queue.front().is_some_and(PendingRequest::is_cancelled) {
            if let Some(request) = self.queue.pop_front() {
                debug!(endpoint = %self.endpoint, request_id = %request.id, "Dropping cancelled request");
            }
        }
    }
}

impl RateBucket for MemoryBucket {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn push(&mut self, request: PendingRequest) {
        self.queue.push_back(request);
    }

    fn unshift(&mut self, request: PendingRequest) {
        self.queue.push_front(request);
        if let Some(ref mut remaining) = self.remaining {
            *remaining += 1;
        }
    }

    fn shift(&mut self) -> Option<PendingRequest> {
        self.purge_cancelled();
        let request = self.queue.pop_front()?;
        if let Some(ref mut remaining) = self.remaining {
            *remaining -= 1;
        }
        Some(request)
    }

    fn peek(&mut self) -> Option<&PendingRequest> {
        self.purge_cancelled();
        self.queue.front()
    }

    fn meta(&mut self, now: Instant) -> BucketMeta {
        if let Some(reset_at) = self.reset_at {
            if now >= reset_at {
                self.reset_at = None;
                self.remaining = self.limit().map(i64::from);
                return BucketMeta {
                    limited: false,
                    reset_at: None,
                };
            }
        }

        let limited = self.limit != 0 && self.remaining.is_some_and(|r| r <= 0);
        BucketMeta {
            limited,
            reset_at: self.reset_at,
        }
    }

    fn handle_ratelimit(
        &mut self,
        limit: Option<u32>,
        remaining: Option<i64>,
        reset_at: Option<Instant>,
        now: Instant,
    ) {
        if limit.is_none() && remaining.is_none() && reset_at.is_none() {
            if let Some(ref mut r) = self.remaining {
                *r += 1;
            }
            return;
        }

        if let Some(limit) = limit {
            self.limit = limit;
        }
        if remaining.is_some() {
            self.remaining = remaining;
        }
        if reset_at.is_some() {
            self.reset_at = reset_at;
        }

        if let (Some(0), Some(reset_at)) = (self.remaining, self.reset_at) {
            if reset_at > now {
                let wait: Duration = reset_at - now;
                debug!(
                    endpoint = %self.endpoint,
                    wait_ms = wait.as_millis() as u64,
                    "Ratelimit encountered, continuing after reset"
                );
            }
        }
    }

    fn clear(&mut self) {
        self.remaining = Some(0);
        self.queue.clear();
    }

    fn is_busy(&self) -> bool {
        self.busy
    }

    fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str) -> (PendingRequest, oneshot::Receiver<Result<Value, RestError>>) {
        PendingRequest::new(Method::GET, path, RequestOptions::default())
    }

    #[test]
    fn test_new_bucket_is_unbounded() {
        let mut bucket = MemoryBucket::new("GET /gateway/bot");
        let (r, _rx) = request("/gateway/bot");
        bucket.push(r);
        assert!(bucket.shift().is_some());
        assert_eq!(bucket.remaining(), None);
        assert!(!bucket.meta(Instant::now()).limited);
        assert!(bucket.shift().is_none());
    }

    #[test]
    fn test_fifo_and_unshift() {
        let mut bucket = MemoryBucket::new("GET /channels/1");
        let now = Instant::now();
        bucket.handle_ratelimit(Some(5), Some(5), None, now);

        let mut receivers = Vec::new();
        for i in 0..3 {
            let (r, rx) = request(&format!("/channels/1/{i}"));
            bucket.push(r);
            receivers.push(rx);
        }

        let first = bucket.shift().unwrap();
        assert_eq!(first.path, "/channels/1/0");
        assert_eq!(bucket.remaining(), Some(4));

        bucket.unshift(first);
        assert_eq!(bucket.remaining(), Some(5));
        assert_eq!(bucket.shift().unwrap().path, "/channels/1/0");
        assert_eq!(bucket.shift().unwrap().path, "/channels/1/1");
        assert_eq!(bucket.remaining(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_limited_until_reset_then_refilled() {
        let mut bucket = MemoryBucket::new("POST /channels/1/messages");
        let start = Instant::now();
        let reset = start + Duration::from_secs(2);
        bucket.handle_ratelimit(Some(5), Some(0), Some(reset), start);

        let meta = bucket.meta(start);
        assert!(meta.limited);
        assert_eq!(meta.reset_at, Some(reset));

        tokio::time::advance(Duration::from_millis(1999)).await;
        assert!(bucket.meta(Instant::now()).limited);

        tokio::time::advance(Duration::from_millis(1)).await;
        let meta = bucket.meta(Instant::now());
        assert!(!meta.limited);
        assert_eq!(meta.reset_at, None);
        assert_eq!(bucket.remaining(), Some(5));
    }

    #[test]
    fn test_absent_headers_refund_a_slot() {
        let mut bucket = MemoryBucket::new("GET /users/@me");
        let now = Instant::now();
        bucket.handle_ratelimit(Some(2), Some(1), None, now);
        let (r, _rx) = request("/users/@me");
        bucket.push(r);
        bucket.shift();
        assert_eq!(bucket.remaining(), Some(0));

        bucket.handle_ratelimit(None, None, None, now);
        assert_eq!(bucket.remaining(), Some(1));
    }

    #[test]
    fn test_partial_headers_keep_other_fields() {
        let mut bucket = MemoryBucket::new("GET /guilds/1");
        let now = Instant::now();
        let reset = now + Duration::from_secs(10);
        bucket.handle_ratelimit(Some(10), Some(3), Some(reset), now);
        bucket.handle_ratelimit(None, Some(2), None, now);
        assert_eq!(bucket.limit(), Some(10));
        assert_eq!(bucket.remaining(), Some(2));
        assert_eq!(bucket.reset_at(), Some(reset));
    }

    #[test]
    fn test_cancelled_requests_are_skipped_without_consuming() {
        let mut bucket = MemoryBucket::new("GET /channels/1");
        bucket.handle_ratelimit(Some(5), Some(5), None, Instant::now());

        let (cancelled, rx) = request("/cancelled");
        bucket.push(cancelled);
        drop(rx);
        let (live, _rx) = request("/live");
        bucket.push(live);

        assert_eq!(bucket.peek().unwrap().path, "/live");
        assert_eq!(bucket.shift().unwrap().path, "/live");
        assert_eq!(bucket.remaining(), Some(4));
        assert!(bucket.is_empty());
    }

    #[tokio::test]
    async fn test_clear_cancels_pending_futures() {
        let mut bucket = MemoryBucket::new("GET /channels/1");
        let (r, rx) = request("/channels/1");
        bucket.push(r);
        bucket.clear();

        assert_eq!(bucket.remaining(), Some(0));
        assert!(bucket.is_empty());
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_zero_remaining_without_limit_is_not_limited() {
        let mut bucket = MemoryBucket::new("GET /x");
        bucket.clear();
        assert!(!bucket.meta(Instant::now()).limited);
    }

    #[test]
    fn test_busy_flag() {
        let mut bucket = MemoryBucket::new("GET /x");
        assert!(!bucket.is_busy());
        bucket.set_busy(true);
        assert!(bucket.is_busy());
    }
}
