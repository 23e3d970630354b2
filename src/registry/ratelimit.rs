//! Rate limit handling for registries that publish their quota, DockerHub in particular.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use http::header::HeaderMap;
use http::{Request, Response};
use hyper::Body;

use crate::error::Result;
use crate::registry::http::Modifier;

/// Below this many remaining requests the guard waits for the window to reset.
pub const DEFAULT_REMAINING_THRESHOLD: u64 = 8;

/// Parses `Retry-After`, given either in seconds or as an HTTP date.
pub fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    let value = headers.get(name)?.to_str().ok()?;
    // DockerHub sends `100;w=21600`
    value.split(';').next()?.trim().parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    remaining: u64,
    reset_at: Option<DateTime<Utc>>,
}

/// Watches `x-ratelimit-remaining` / `x-ratelimit-reset` and holds back the next
/// request until the window resets once the remaining budget runs low.
pub struct RateLimitGuard {
    threshold: u64,
    window: Mutex<Option<Window>>,
}

impl Default for RateLimitGuard {
    fn default() -> Self {
        RateLimitGuard::new(DEFAULT_REMAINING_THRESHOLD)
    }
}

impl RateLimitGuard {
    pub fn new(threshold: u64) -> RateLimitGuard {
        RateLimitGuard {
            threshold,
            window: Mutex::new(None),
        }
    }

    fn window(&self) -> std::sync::MutexGuard<'_, Option<Window>> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// How long the next request has to wait, consuming the recorded window.
    pub fn pending_wait(&self, now: DateTime<Utc>) -> Option<Duration> {
        let mut window = self.window();
        let w = (*window)?;
        if w.remaining >= self.threshold {
            return None;
        }
        *window = None;
        let reset_at = w.reset_at?;
        (reset_at - now).to_std().ok().filter(|d| !d.is_zero())
    }

    pub fn record(&self, headers: &HeaderMap) {
        if let Some(remaining) = header_u64(headers, "x-ratelimit-remaining") {
            let reset_at = header_u64(headers, "x-ratelimit-reset")
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
            *self.window() = Some(Window {
                remaining,
                reset_at,
            });
        }
    }
}

#[async_trait::async_trait]
impl Modifier for RateLimitGuard {
    async fn modify(&self, request: &mut Request<Body>) -> Result<()> {
        if let Some(wait) = self.pending_wait(Utc::now()) {
            tracing::warn!(
                "rate limit almost exhausted, waiting {:?} before {} {}",
                wait,
                request.method(),
                request.uri()
            );
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }

    fn observe(&self, response: &Response<Body>) {
        self.record(response.headers());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_seconds_and_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, "60".parse().unwrap());
        assert_eq!(retry_after(&headers, now), Some(Duration::from_secs(60)));

        headers.insert(
            http::header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(retry_after(&headers, now), Some(Duration::from_secs(60)));

        headers.insert(http::header::RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(retry_after(&headers, now), None);
    }

    #[test]
    fn test_guard_waits_until_reset_when_low() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let guard = RateLimitGuard::default();
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", "2;w=21600".parse().unwrap());
        headers.insert(
            "x-ratelimit-reset",
            (now.timestamp() + 30).to_string().parse().unwrap(),
        );
        guard.record(&headers);
        assert_eq!(guard.pending_wait(now), Some(Duration::from_secs(30)));
        // the wait is only served once per observed window
        assert_eq!(guard.pending_wait(now), None);
    }

    #[test]
    fn test_guard_ignores_healthy_budget() {
        let now = Utc::now();
        let guard = RateLimitGuard::default();
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", "150".parse().unwrap());
        headers.insert(
            "x-ratelimit-reset",
            (now.timestamp() + 30).to_string().parse().unwrap(),
        );
        guard.record(&headers);
        assert_eq!(guard.pending_wait(now), None);
    }
}
