//! Client-side rate limiting for vendor API calls
//!
//! Token bucket per destination host, configured as `N per second` or
//! `N per minute`. The HTTP client acquires one token before every send.
//! A host bucket can also be deferred until a server-advertised instant
//! (Retry-After), which makes every worker talking to that host back off,
//! not just the one that received the 429.
//!
//! Features:
//! - Fractional refill (e.g. 30 per minute)
//! - Burst equal to one period's worth of requests
//! - Shared registry so clones of a client share buckets

use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Period a rate limit is expressed over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RatePeriod {
    Second,
    Minute,
}

impl RatePeriod {
    fn as_duration(self) -> Duration {
        match self {
            Self::Second => Duration::from_secs(1),
            Self::Minute => Duration::from_secs(60),
        }
    }
}

/// Rate limit configuration: `requests` per `per`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RateLimitConfig {
    /// Maximum requests per period (0 = unlimited)
    pub requests: u32,
    /// Period the limit applies to
    #[serde(default = "default_period")]
    pub per: RatePeriod,
}

fn default_period() -> RatePeriod {
    RatePeriod::Second
}

impl RateLimitConfig {
    pub fn per_second(requests: u32) -> Self {
        Self {
            requests,
            per: RatePeriod::Second,
        }
    }

    pub fn per_minute(requests: u32) -> Self {
        Self {
            requests,
            per: RatePeriod::Minute,
        }
    }

    pub fn unlimited() -> Self {
        Self::per_second(0)
    }

    pub fn is_enabled(&self) -> bool {
        self.requests > 0
    }

    /// Tokens added per second
    fn refill_rate(&self) -> f64 {
        self.requests as f64 / self.per.as_duration().as_secs_f64()
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    deferred_until: Option<Instant>,
}

/// Token bucket for one destination host
#[derive(Debug)]
pub struct TokenBucketRateLimiter {
    config: RateLimitConfig,
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
    /// Total acquisitions that had to wait
    requests_throttled: AtomicU64,
    /// Total time spent waiting (nanoseconds)
    total_wait_ns: AtomicU64,
}

impl TokenBucketRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = config.requests as f64;
        Self {
            config,
            capacity,
            refill_rate: config.refill_rate(),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
                deferred_until: None,
            }),
            requests_throttled: AtomicU64::new(0),
            total_wait_ns: AtomicU64::new(0),
        }
    }

    /// Wait until one token is available and take it.
    ///
    /// Returns the time spent waiting.
    pub async fn acquire(&self) -> Duration {
        let start = Instant::now();

        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();

                match state.deferred_until {
                    Some(until) if until > now => until - now,
                    _ => {
                        state.deferred_until = None;
                        if !self.config.is_enabled() {
                            Duration::ZERO
                        } else {
                            self.refill(&mut state, now);
                            if state.tokens >= 1.0 {
                                state.tokens -= 1.0;
                                Duration::ZERO
                            } else {
                                let missing = 1.0 - state.tokens;
                                Duration::from_secs_f64(missing / self.refill_rate)
                                    .max(Duration::from_millis(1))
                            }
                        }
                    }
                }
            };

            if wait.is_zero() {
                break;
            }
            tokio::time::sleep(wait).await;
        }

        let waited = start.elapsed();
        if !waited.is_zero() {
            self.requests_throttled.fetch_add(1, Ordering::Relaxed);
            self.total_wait_ns
                .fetch_add(waited.as_nanos() as u64, Ordering::Relaxed);
            debug!("Rate limiter: waited {:?} for a token", waited);
        }
        waited
    }

    /// Take a token if one is available right now
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        if matches!(state.deferred_until, Some(until) if until > now) {
            return false;
        }
        if !self.config.is_enabled() {
            return true;
        }
        self.refill(&mut state, now);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Block all acquisitions until `delay` from now has elapsed.
    ///
    /// A later deadline wins over an earlier one.
    pub fn defer(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut state = self.state.lock();
        if state.deferred_until.map_or(true, |current| until > current) {
            state.deferred_until = Some(until);
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }

    /// Currently available tokens, rounded down
    pub fn available_tokens(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens as u64
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            requests_throttled: self.requests_throttled.load(Ordering::Relaxed),
            total_wait_ms: self.total_wait_ns.load(Ordering::Relaxed) / 1_000_000,
            config: self.config,
        }
    }
}

/// Rate limiter statistics
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    /// Acquisitions that had to wait
    pub requests_throttled: u64,
    /// Total time spent waiting in milliseconds
    pub total_wait_ms: u64,
    pub config: RateLimitConfig,
}

impl std::fmt::Display for RateLimiterStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.config.is_enabled() {
            write!(
                f,
                "RateLimiter({}/{:?}, {} throttled, {}ms waited)",
                self.config.requests, self.config.per, self.requests_throttled, self.total_wait_ms
            )
        } else {
            write!(f, "RateLimiter(unlimited)")
        }
    }
}

/// Per-host buckets sharing one configuration
#[derive(Debug, Clone, Default)]
pub struct RateLimiterRegistry {
    config: RateLimitConfig,
    buckets: Arc<Mutex<HashMap<String, Arc<TokenBucketRateLimiter>>>>,
}

impl RateLimiterRegistry {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Arc::default(),
        }
    }

    /// Bucket for `host`, created on first use
    pub fn for_host(&self, host: &str) -> Arc<TokenBucketRateLimiter> {
        let mut buckets = self.buckets.lock();
        buckets
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(TokenBucketRateLimiter::new(self.config)))
            .clone()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.buckets.lock().keys().cloned().collect()
    }
}
