//! Rate-limited REST pipeline
//!
//! Requests are queued per route bucket and executed one at a time per
//! bucket, honoring the advertised per-route budget and the global limit.

pub mod bucket;
pub mod dispatcher;
pub mod ratelimit;
pub mod route;
pub mod transport;

pub use bucket::{Attachment, BucketFactory, BucketMeta, MemoryBucket, PendingRequest, RateBucket, RequestOptions};
pub use dispatcher::{RestDispatcher, RestDispatcherBuilder};
pub use ratelimit::{GlobalLimitState, RateLimitHeaders};
pub use route::bucket_key;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
