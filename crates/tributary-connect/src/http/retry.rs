//! Retry policy for vendor and intake calls
//!
//! Retries connection errors, timeouts, 429 and {500, 502, 503, 504}.
//! The wait before the next attempt comes from, in order:
//!
//! 1. `Retry-After` (delta-seconds or HTTP-date)
//! 2. `X-RateLimit-Reset` / `X-Rate-Limit-Reset` (Unix timestamp)
//! 3. full-jitter exponential backoff: `rand(0, min(cap, base * 2^(attempt-1)))`

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;

const RATE_LIMIT_RESET_HEADERS: [&str; 2] = ["x-ratelimit-reset", "x-rate-limit-reset"];

/// Bounded retry policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Backoff base
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = cap;
        self
    }

    /// Whether a response status should be retried
    pub fn is_retriable_status(status: u16) -> bool {
        matches!(status, 429 | 500 | 502 | 503 | 504)
    }

    /// Upper bound of the jittered wait after `attempt` (1-based) failed
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u64 << exponent;
        let base_ms = self.base_delay.as_millis() as u64;
        Duration::from_millis(base_ms.saturating_mul(factor)).min(self.max_delay)
    }

    /// Full-jitter backoff after `attempt` (1-based) failed
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

/// Delay the server asked for, if any.
///
/// Returns `Some(Duration::ZERO)` when the advertised instant already passed.
pub fn server_advised_delay(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    if let Some(value) = headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()) {
        if let Some(delay) = parse_retry_after(value, now) {
            return Some(delay);
        }
    }

    RATE_LIMIT_RESET_HEADERS.iter().find_map(|name| {
        let value = headers.get(*name)?.to_str().ok()?;
        parse_rate_limit_reset(value, now)
    })
}

/// `Retry-After: <delta-seconds>` or `Retry-After: <HTTP-date>`
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some(until(at, now))
}

/// `X-RateLimit-Reset: <unix seconds>`, possibly fractional
pub fn parse_rate_limit_reset(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let reset = value.trim().parse::<f64>().ok()?;
    if !reset.is_finite() {
        return None;
    }
    let millis = (reset * 1000.0) as i64;
    let at = DateTime::<Utc>::from_timestamp_millis(millis)?;
    Some(until(at, now))
}

fn until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_retriable_statuses() {
        for status in [429, 500, 502, 503, 504] {
            assert!(RetryPolicy::is_retriable_status(status), "{}", status);
        }
        for status in [400, 401, 403, 404, 409, 501, 505] {
            assert!(!RetryPolicy::is_retriable_status(status), "{}", status);
        }
    }

    #[test]
    fn test_backoff_ceiling_doubles_then_caps() {
        let policy = RetryPolicy::new(5)
            .with_backoff(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(policy.backoff_ceiling(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_ceiling(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_ceiling(4), Duration::from_millis(800));
        assert_eq!(policy.backoff_ceiling(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff_ceiling(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_jitter_within_ceiling() {
        let policy = RetryPolicy::default();
        for attempt in 1..8 {
            let delay = policy.backoff(attempt);
            assert!(delay <= policy.backoff_ceiling(attempt));
        }
    }

    #[test]
    fn test_retry_after_seconds() {
        assert_eq!(parse_retry_after("7", now()), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after(" 0 ", now()), Some(Duration::ZERO));
    }

    #[test]
    fn test_retry_after_http_date() {
        let delay = parse_retry_after("Fri, 01 Mar 2024 12:00:30 GMT", now());
        assert_eq!(delay, Some(Duration::from_secs(30)));

        // Already passed
        let delay = parse_retry_after("Fri, 01 Mar 2024 11:59:00 GMT", now());
        assert_eq!(delay, Some(Duration::ZERO));

        assert_eq!(parse_retry_after("soon", now()), None);
    }

    #[test]
    fn test_rate_limit_reset_headers() {
        let reset = now().timestamp() + 12;
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Rate-Limit-Reset",
            HeaderValue::from_str(&reset.to_string()).unwrap(),
        );
        assert_eq!(
            server_advised_delay(&headers, now()),
            Some(Duration::from_secs(12))
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            "X-RateLimit-Reset",
            HeaderValue::from_str(&(now().timestamp() - 100).to_string()).unwrap(),
        );
        assert_eq!(server_advised_delay(&headers, now()), Some(Duration::ZERO));
    }

    #[test]
    fn test_retry_after_takes_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        headers.insert(
            "X-RateLimit-Reset",
            HeaderValue::from_str(&(now().timestamp() + 60).to_string()).unwrap(),
        );
        assert_eq!(
            server_advised_delay(&headers, now()),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_no_advice() {
        assert_eq!(server_advised_delay(&HeaderMap::new(), now()), None);
    }
}
