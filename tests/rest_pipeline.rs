//! REST pipeline through the public client API

use arrakis_gateway_client::rest::{
    BucketFactory, BucketMeta, HttpRequest, HttpResponse, HttpTransport, MemoryBucket,
    PendingRequest, RateBucket, RequestOptions,
};
use arrakis_gateway_client::{Client, ClientOptions, RestError};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

/// Answers every request with the per-route budget exhausted for `reset_after`
struct ThrottledTransport {
    reset_after: &'static str,
    calls: Mutex<Vec<(Instant, String)>>,
}

#[async_trait]
impl HttpTransport for ThrottledTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, RestError> {
        self.calls.lock().push((Instant::now(), request.url.clone()));
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-limit", HeaderValue::from_static("1"));
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert(
            "x-ratelimit-reset-after",
            HeaderValue::from_static(self.reset_after),
        );
        Ok(HttpResponse {
            status: 200,
            headers,
            body: br#"{"ok":true}"#.to_vec(),
        })
    }
}

fn client(transport: Arc<ThrottledTransport>) -> Client {
    let mut options = ClientOptions::default();
    options.token = Some("test-token".to_string());
    Client::builder(options).transport(transport).build().unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_bucket_budget_paces_requests() {
    let transport = Arc::new(ThrottledTransport {
        reset_after: "2",
        calls: Mutex::new(Vec::new()),
    });
    let client = client(Arc::clone(&transport));

    let (a, b, c) = tokio::join!(
        client.request(Method::GET, "/channels/1/messages", RequestOptions::default()),
        client.request(Method::GET, "/channels/1/messages", RequestOptions::default()),
        client.request(Method::GET, "/channels/1/messages", RequestOptions::default()),
    );
    assert_eq!(assert_ok!(a), json!({"ok": true}));
    assert_ok!(b);
    assert_ok!(c);

    let calls = transport.calls.lock().clone();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[1].0 - calls[0].0, Duration::from_secs(2));
    assert_eq!(calls[2].0 - calls[1].0, Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_other_routes_are_not_blocked_by_a_limited_bucket() {
    let transport = Arc::new(ThrottledTransport {
        reset_after: "60",
        calls: Mutex::new(Vec::new()),
    });
    let client = client(Arc::clone(&transport));
    let start = Instant::now();

    assert_ok!(client.rest().get("/channels/1").await);
    assert_ok!(client.rest().get("/channels/2").await);
    assert_ok!(client.rest().get("/guilds/1").await);
    assert!(Instant::now() - start < Duration::from_secs(1));
    assert_eq!(client.rest().bucket_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_cancels_queued_requests() {
    let transport = Arc::new(ThrottledTransport {
        reset_after: "30",
        calls: Mutex::new(Vec::new()),
    });
    let client = Arc::new(client(Arc::clone(&transport)));
    assert_ok!(client.rest().get("/channels/1/messages").await);

    let queued: Vec<_> = (0..3)
        .map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.rest().get("/channels/1/messages").await })
        })
        .collect();
    tokio::time::sleep(Duration::from_secs(1)).await;

    client.destroy().await;
    for handle in queued {
        let err = assert_err!(handle.await.unwrap());
        assert!(matches!(err, RestError::Cancelled));
    }
    assert_eq!(transport.calls.lock().len(), 1);
}

/// Memory bucket that counts how many requests it released
struct CountingBucket {
    inner: MemoryBucket,
    shifted: Arc<AtomicUsize>,
}

impl RateBucket for CountingBucket {
    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn push(&mut self, request: PendingRequest) {
        self.inner.push(request)
    }

    fn unshift(&mut self, request: PendingRequest) {
        self.inner.unshift(request)
    }

    fn shift(&mut self) -> Option<PendingRequest> {
        let request = self.inner.shift();
        if request.is_some() {
            self.shifted.fetch_add(1, Ordering::SeqCst);
        }
        request
    }

    fn peek(&mut self) -> Option<&PendingRequest> {
        self.inner.peek()
    }

    fn meta(&mut self, now: Instant) -> BucketMeta {
        self.inner.meta(now)
    }

    fn handle_ratelimit(
        &mut self,
        limit: Option<u32>,
        remaining: Option<i64>,
        reset_at: Option<Instant>,
        now: Instant,
    ) {
        self.inner.handle_ratelimit(limit, remaining, reset_at, now)
    }

    fn clear(&mut self) {
        self.inner.clear()
    }

    fn is_busy(&self) -> bool {
        self.inner.is_busy()
    }

    fn set_busy(&mut self, busy: bool) {
        self.inner.set_busy(busy)
    }
}

#[tokio::test(start_paused = true)]
async fn test_custom_bucket_factory_is_used() {
    let transport = Arc::new(ThrottledTransport {
        reset_after: "1",
        calls: Mutex::new(Vec::new()),
    });
    let shifted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&shifted);
    let factory: BucketFactory = Arc::new(move |endpoint: &str| {
        Box::new(CountingBucket {
            inner: MemoryBucket::new(endpoint),
            shifted: Arc::clone(&counter),
        }) as Box<dyn RateBucket>
    });

    let mut options = ClientOptions::default();
    options.token = Some("test-token".to_string());
    let client = Client::builder(options)
        .transport(transport)
        .bucket_factory(factory)
        .build()
        .unwrap();

    let body = RequestOptions::json(json!({"content": "hi"}));
    assert_ok!(client.request(Method::POST, "/channels/1/messages", body.clone()).await);
    assert_ok!(client.request(Method::POST, "/channels/1/messages", body).await);
    assert_eq!(shifted.load(Ordering::SeqCst), 2);
}
