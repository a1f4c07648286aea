//! REST dispatcher
//!
//! One bucket per route signature, one drain task per busy bucket. A drain
//! task owns its bucket's busy flag for the whole cycle and exits once the
//! queue is empty, so requests on a route run strictly one after another in
//! submission order.

use crate::config::HttpOptions;
use crate::error::RestError;
use crate::metrics::GatewayMetrics;
use crate::rest::bucket::{
    BucketFactory, MemoryBucket, PendingRequest, RateBucket, RequestOptions,
};
use crate::rest::ratelimit::{deadline, retry_after, GlobalLimitState, RateLimitHeaders};
use crate::rest::route::bucket_key;
use crate::rest::transport::{HttpRequest, HttpResponse, HttpTransport, RequestBody, ReqwestTransport};
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

pub const HEADER_AUDIT_LOG_REASON: &str = "x-audit-log-reason";

type SharedBucket = Arc<Mutex<Box<dyn RateBucket>>>;

/// How a response is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    RateLimited,
    ServerError,
    ClientError,
}

impl ResponseClass {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Success,
            429 => Self::RateLimited,
            500..=599 => Self::ServerError,
            _ => Self::ClientError,
        }
    }
}

/// Next step of a drain cycle, decided under the bucket lock
enum DrainStep {
    Wait(Instant),
    Run(PendingRequest),
    Done,
}

/// Builder for [`RestDispatcher`]
pub struct RestDispatcherBuilder {
    options: HttpOptions,
    token: Option<String>,
    transport: Option<Arc<dyn HttpTransport>>,
    factory: Option<BucketFactory>,
    metrics: GatewayMetrics,
}

impl RestDispatcherBuilder {
    pub fn token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    /// Replace the reqwest transport
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use a custom bucket implementation
    pub fn bucket_factory(mut self, factory: BucketFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> Result<RestDispatcher, RestError> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(
                self.options.timeout(),
                &self.options.user_agent,
            )?),
        };
        let factory: BucketFactory = match self.factory {
            Some(factory) => factory,
            None => Arc::new(memory_bucket),
        };

        Ok(RestDispatcher {
            inner: Arc::new(Inner {
                api_url: self.options.api_url(),
                token: self.token,
                transport,
                factory,
                buckets: DashMap::new(),
                global: GlobalLimitState::new(),
                error_delay: self.options.error_delay(),
                max_retries: self.options.request_max_retries,
                max_ratelimit_retries: self.options.request_max_ratelimit_retries,
                time_offset: self.options.time_offset(),
                metrics: self.metrics,
            }),
        })
    }
}

fn memory_bucket(endpoint: &str) -> Box<dyn RateBucket> {
    Box::new(MemoryBucket::new(endpoint))
}

struct Inner {
    api_url: String,
    token: Option<String>,
    transport: Arc<dyn HttpTransport>,
    factory: BucketFactory,
    buckets: DashMap<String, SharedBucket>,
    global: GlobalLimitState,
    error_delay: Duration,
    max_retries: u32,
    max_ratelimit_retries: u32,
    time_offset: Duration,
    metrics: GatewayMetrics,
}

/// Rate-limited REST request pipeline
#[derive(Clone)]
pub struct RestDispatcher {
    inner: Arc<Inner>,
}

impl RestDispatcher {
    pub fn builder(options: HttpOptions) -> RestDispatcherBuilder {
        RestDispatcherBuilder {
            options,
            token: None,
            transport: None,
            factory: None,
            metrics: GatewayMetrics::detached(),
        }
    }

    /// Queue a request and wait for it to settle
    ///
    /// Dropping the returned future cancels the request if it has not been
    /// sent yet.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<Value, RestError> {
        let key = bucket_key(&method, path);
        let (request, rx) = PendingRequest::new(method, path, options);
        debug!(bucket = %key, request_id = %request.id, "Queueing request");

        let bucket = self.bucket(&key);
        let start_drain = {
            let mut guard = bucket.lock();
            guard.push(request);
            if guard.is_busy() {
                false
            } else {
                guard.set_busy(true);
                true
            }
        };

        if start_drain {
            spawn_drain(Arc::clone(&self.inner), key, bucket);
        }

        rx.await.map_err(|_| RestError::Cancelled)?
    }

    pub async fn get(&self, path: &str) -> Result<Value, RestError> {
        self.request(Method::GET, path, RequestOptions::default()).await
    }

    fn bucket(&self, key: &str) -> SharedBucket {
        if let Some(bucket) = self.inner.buckets.get(key) {
            return Arc::clone(&bucket);
        }
        let entry = self
            .inner
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new((self.inner.factory)(key))));
        Arc::clone(&entry)
    }

    /// Number of known route buckets
    pub fn bucket_count(&self) -> usize {
        self.inner.buckets.len()
    }

    /// Whether the global limit is active right now
    pub fn is_globally_limited(&self) -> bool {
        self.inner.global.is_limited(Instant::now())
    }

    /// Drop every queued request; their futures settle as `Cancelled`
    pub fn clear(&self) {
        let mut dropped = 0;
        for entry in self.inner.buckets.iter() {
            let mut bucket = entry.value().lock();
            dropped += bucket.len();
            bucket.clear();
        }
        info!(buckets = self.inner.buckets.len(), dropped, "REST buckets cleared");
    }
}

/// Run `drain` for a bucket and release the bucket if the drain dies
fn spawn_drain(inner: Arc<Inner>, key: String, bucket: SharedBucket) {
    tokio::spawn(async move {
        let task = tokio::spawn(drain(Arc::clone(&inner), key.clone(), Arc::clone(&bucket)));
        if let Err(e) = task.await {
            error!(bucket = %key, error = %e, "Bucket drain task failed, cancelling queued requests");
            inner.metrics.record_error("drain_failed");
            let mut guard = bucket.lock();
            guard.clear();
            guard.set_busy(false);
        }
    });
}

async fn drain(inner: Arc<Inner>, key: String, bucket: SharedBucket) {
    loop {
        let step = {
            let mut guard = bucket.lock();
            let now = Instant::now();

            match guard.peek().map(|r| r.options.counts_against_global) {
                None => {
                    guard.set_busy(false);
                    DrainStep::Done
                }
                Some(counts_global) => {
                    let global_wait = if counts_global {
                        inner.global.limited_until(now)
                    } else {
                        None
                    };
                    let meta = guard.meta(now);

                    match (global_wait, meta.limited, meta.reset_at) {
                        (Some(until), _, _) => DrainStep::Wait(until),
                        (None, true, Some(reset_at)) => DrainStep::Wait(reset_at),
                        _ => match guard.shift() {
                            Some(request) => DrainStep::Run(request),
                            None => {
                                guard.set_busy(false);
                                DrainStep::Done
                            }
                        },
                    }
                }
            }
        };

        match step {
            DrainStep::Done => return,
            DrainStep::Wait(until) => {
                debug!(
                    bucket = %key,
                    wait_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "Bucket limited, waiting for reset"
                );
                tokio::time::sleep_until(until).await;
            }
            DrainStep::Run(request) => {
                execute(&inner, &key, &bucket, request).await;
                if !inner.time_offset.is_zero() {
                    tokio::time::sleep(inner.time_offset).await;
                }
            }
        }
    }
}

async fn execute(inner: &Inner, key: &str, bucket: &SharedBucket, mut request: PendingRequest) {
    let http_request = match build_request(inner, &request) {
        Ok(r) => r,
        Err(e) => {
            request.settle(Err(e));
            return;
        }
    };

    match inner.transport.execute(http_request).await {
        Ok(response) => {
            let now = Instant::now();
            let headers = RateLimitHeaders::parse(&response.headers, now, inner.time_offset);
            bucket
                .lock()
                .handle_ratelimit(headers.limit, headers.remaining, headers.reset_at, now);
            inner.metrics.record_rest_request(key, response.status);

            match ResponseClass::from_status(response.status) {
                ResponseClass::Success => request.settle(decode_body(&response)),
                ResponseClass::RateLimited => {
                    let (wait, global) = retry_after(&response.headers, &response.body);
                    inner.metrics.record_ratelimit_hit(key, global);
                    if global {
                        inner.global.set(deadline(now, wait));
                    }

                    if request.ratelimit_retries >= inner.max_ratelimit_retries {
                        let error = RestError::RateLimited {
                            attempts: request.ratelimit_retries + 1,
                            retry_after: wait,
                            global,
                        };
                        warn!(bucket = %key, request_id = %request.id, error = %error, "Giving up on rate limited request");
                        inner.metrics.record_error(error.error_type_label());
                        request.settle(Err(error));
                        return;
                    }

                    request.ratelimit_retries += 1;
                    warn!(
                        bucket = %key,
                        request_id = %request.id,
                        retry_after_ms = wait.as_millis() as u64,
                        global,
                        "Rate limited, requeueing"
                    );
                    bucket.lock().unshift(request);
                    tokio::time::sleep(wait).await;
                }
                ResponseClass::ServerError => {
                    let error = RestError::UpstreamServer {
                        status: response.status,
                        body: String::from_utf8_lossy(&response.body).into_owned(),
                    };
                    retry_or_fail(inner, key, bucket, request, error).await;
                }
                ResponseClass::ClientError => {
                    let error = RestError::UpstreamClient {
                        status: response.status,
                        body: String::from_utf8_lossy(&response.body).into_owned(),
                    };
                    inner.metrics.record_error(error.error_type_label());
                    request.settle(Err(error));
                }
            }
        }
        Err(error) => {
            retry_or_fail(inner, key, bucket, request, error).await;
        }
    }
}

/// Delay before retry number `retry` (1-based)
pub fn retry_delay(base: Duration, retry: u32) -> Duration {
    if retry <= 1 {
        base
    } else {
        base * 2
    }
}

async fn retry_or_fail(
    inner: &Inner,
    key: &str,
    bucket: &SharedBucket,
    mut request: PendingRequest,
    error: RestError,
) {
    if request.retries >= inner.max_retries {
        warn!(
            bucket = %key,
            request_id = %request.id,
            retries = request.retries,
            error = %error,
            "Request failed after retries"
        );
        inner.metrics.record_error(error.error_type_label());
        request.settle(Err(error));
        return;
    }

    request.retries += 1;
    let delay = retry_delay(inner.error_delay, request.retries);
    inner.metrics.record_rest_retry(key);
    warn!(
        bucket = %key,
        request_id = %request.id,
        retry = request.retries,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "Request failed, retrying"
    );
    bucket.lock().unshift(request);
    tokio::time::sleep(delay).await;
}

fn decode_body(response: &HttpResponse) -> Result<Value, RestError> {
    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&response.body)?)
}

/// Percent-encode an audit-log reason for the header
pub fn encode_reason(reason: &str) -> String {
    url::form_urlencoded::byte_serialize(reason.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

fn build_request(inner: &Inner, request: &PendingRequest) -> Result<HttpRequest, RestError> {
    let mut url = Url::parse(&format!("{}{}", inner.api_url, request.path))
        .map_err(|e| RestError::InvalidRequest(format!("invalid path '{}': {e}", request.path)))?;
    if !request.options.query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (name, value) in &request.options.query {
            pairs.append_pair(name, value);
        }
    }

    let mut headers = HeaderMap::new();
    if !request.options.no_auth {
        if let Some(ref token) = inner.token {
            let value = HeaderValue::from_str(&format!("Bot {token}"))
                .map_err(|_| RestError::InvalidRequest("token is not a valid header value".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
    }
    if let Some(ref reason) = request.options.audit_log_reason {
        let value = HeaderValue::from_str(&encode_reason(reason))
            .map_err(|_| RestError::InvalidRequest("invalid audit log reason".to_string()))?;
        headers.insert(HEADER_AUDIT_LOG_REASON, value);
    }

    let body = if !request.options.files.is_empty() {
        RequestBody::Multipart {
            payload_json: request.options.body.clone(),
            files: request.options.files.clone(),
        }
    } else if let Some(ref body) = request.options.body {
        RequestBody::Json(body.clone())
    } else {
        RequestBody::Empty
    };

    Ok(HttpRequest {
        method: request.method.clone(),
        url: url.into(),
        headers,
        body,
    })
}
