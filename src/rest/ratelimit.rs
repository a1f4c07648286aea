//! Rate-limit header parsing and the global limit
//!
//! Reset times are converted to monotonic instants on arrival, so every
//! later comparison runs on the runtime clock.

use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const HEADER_GLOBAL: &str = "x-ratelimit-global";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Fallback wait when a 429 carries no usable retry-after
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Longest wait honoured from any rate-limit header or body
pub const MAX_RATELIMIT_WAIT: Duration = Duration::from_secs(60 * 60);

/// Rate-limit fields observed on one response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<i64>,
    pub reset_at: Option<Instant>,
    pub global: bool,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn seconds(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value)
        .ok()
        .map(|d| d.min(MAX_RATELIMIT_WAIT))
}

/// `now + wait`, with the wait capped at [`MAX_RATELIMIT_WAIT`]
pub fn deadline(now: Instant, wait: Duration) -> Instant {
    let wait = wait.min(MAX_RATELIMIT_WAIT);
    now.checked_add(wait).unwrap_or(now)
}

impl RateLimitHeaders {
    /// Parse the headers; `offset` is added to the reset time
    pub fn parse(headers: &HeaderMap, now: Instant, offset: Duration) -> Self {
        let limit = header(headers, HEADER_LIMIT).and_then(|v| v.parse().ok());
        let remaining = header(headers, HEADER_REMAINING).and_then(|v| v.parse().ok());

        let reset_after = header(headers, HEADER_RESET_AFTER)
            .and_then(|v| v.parse::<f64>().ok())
            .and_then(seconds)
            .or_else(|| {
                let epoch = header(headers, HEADER_RESET)?.parse::<f64>().ok()?;
                let wall = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs_f64();
                Some(seconds(epoch - wall).unwrap_or(Duration::ZERO))
            });

        Self {
            limit,
            remaining,
            reset_at: reset_after.map(|d| deadline(now, d.saturating_add(offset))),
            global: header(headers, HEADER_GLOBAL).is_some_and(|v| v.eq_ignore_ascii_case("true")),
        }
    }
}

/// How long a 429 asks us to wait, and whether it applies globally
///
/// The JSON body wins over headers; both are in seconds.
pub fn retry_after(headers: &HeaderMap, body: &[u8]) -> (Duration, bool) {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    let body_wait = parsed
        .as_ref()
        .and_then(|v| v.get("retry_after"))
        .and_then(Value::as_f64)
        .and_then(seconds);
    let body_global = parsed
        .as_ref()
        .and_then(|v| v.get("global"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let header_wait = header(headers, HEADER_RETRY_AFTER)
        .and_then(|v| v.parse::<f64>().ok())
        .and_then(seconds);
    let header_global =
        header(headers, HEADER_GLOBAL).is_some_and(|v| v.eq_ignore_ascii_case("true"));

    (
        body_wait.or(header_wait).unwrap_or(DEFAULT_RETRY_AFTER),
        body_global || header_global,
    )
}

/// Process-wide global limit shared by every bucket
#[derive(Debug, Default)]
pub struct GlobalLimitState {
    reset_at: Mutex<Option<Instant>>,
}

impl GlobalLimitState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit everything until `until`; a later deadline wins
    pub fn set(&self, until: Instant) {
        let mut reset_at = self.reset_at.lock();
        if reset_at.map_or(true, |current| until > current) {
            *reset_at = Some(until);
        }
    }

    /// Reset time while limited; clears itself once elapsed
    pub fn limited_until(&self, now: Instant) -> Option<Instant> {
        let mut reset_at = self.reset_at.lock();
        match *reset_at {
            Some(until) if now < until => Some(until),
            Some(_) => {
                *reset_at = None;
                None
            }
            None => None,
        }
    }

    pub fn is_limited(&self, now: Instant) -> bool {
        self.limited_until(now).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_parse_bucket_headers() {
        let now = Instant::now();
        let parsed = RateLimitHeaders::parse(
            &headers(&[
                (HEADER_LIMIT, "5"),
                (HEADER_REMAINING, "0"),
                (HEADER_RESET_AFTER, "1.5"),
            ]),
            now,
            Duration::ZERO,
        );
        assert_eq!(parsed.limit, Some(5));
        assert_eq!(parsed.remaining, Some(0));
        assert_eq!(parsed.reset_at, Some(now + Duration::from_millis(1500)));
        assert!(!parsed.global);
    }

    #[test]
    fn test_offset_is_added_to_reset() {
        let now = Instant::now();
        let parsed = RateLimitHeaders::parse(
            &headers(&[(HEADER_RESET_AFTER, "2")]),
            now,
            Duration::from_millis(250),
        );
        assert_eq!(parsed.reset_at, Some(now + Duration::from_millis(2250)));
    }

    #[test]
    fn test_epoch_reset_fallback() {
        let now = Instant::now();
        let wall = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs_f64();
        let parsed = RateLimitHeaders::parse(
            &headers(&[(HEADER_RESET, &format!("{:.3}", wall + 30.0))]),
            now,
            Duration::ZERO,
        );
        let reset = parsed.reset_at.unwrap();
        assert!(reset > now + Duration::from_secs(28));
        assert!(reset <= now + Duration::from_secs(31));

        let past = RateLimitHeaders::parse(
            &headers(&[(HEADER_RESET, "1000.0")]),
            now,
            Duration::ZERO,
        );
        assert_eq!(past.reset_at, Some(now));
    }

    #[test]
    fn test_missing_headers_are_empty() {
        let parsed = RateLimitHeaders::parse(&HeaderMap::new(), Instant::now(), Duration::ZERO);
        assert_eq!(parsed, RateLimitHeaders::default());
    }

    #[test]
    fn test_oversized_waits_are_capped() {
        let now = Instant::now();
        let parsed = RateLimitHeaders::parse(
            &headers(&[(HEADER_REMAINING, "0"), (HEADER_RESET_AFTER, "1e19")]),
            now,
            Duration::from_millis(250),
        );
        assert_eq!(parsed.reset_at, Some(now + MAX_RATELIMIT_WAIT));

        let (wait, _) = retry_after(&HeaderMap::new(), br#"{"retry_after":1e19}"#);
        assert_eq!(wait, MAX_RATELIMIT_WAIT);
        assert_eq!(deadline(now, Duration::MAX), now + MAX_RATELIMIT_WAIT);
    }

    #[test]
    fn test_retry_after_sources() {
        let (wait, global) = retry_after(
            &headers(&[(HEADER_RETRY_AFTER, "3")]),
            br#"{"message":"You are being rate limited.","retry_after":2.0,"global":true}"#,
        );
        assert_eq!(wait, Duration::from_secs(2));
        assert!(global);

        let (wait, global) = retry_after(
            &headers(&[(HEADER_RETRY_AFTER, "2.0"), (HEADER_GLOBAL, "true")]),
            b"",
        );
        assert_eq!(wait, Duration::from_secs(2));
        assert!(global);

        let (wait, global) = retry_after(&HeaderMap::new(), b"not json");
        assert_eq!(wait, DEFAULT_RETRY_AFTER);
        assert!(!global);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_limit_clears_itself() {
        let global = GlobalLimitState::new();
        let start = Instant::now();
        assert!(!global.is_limited(start));

        global.set(start + Duration::from_secs(5));
        global.set(start + Duration::from_secs(1));
        assert_eq!(global.limited_until(start), Some(start + Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(global.limited_until(Instant::now()), None);
        assert!(!global.is_limited(Instant::now()));
    }
}
