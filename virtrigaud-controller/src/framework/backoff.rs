//! Rate limiting for requeues: per-key exponential backoff plus a global
//! token bucket that stops hot loops and thundering-herd retries.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default per-key backoff base.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);
/// Default per-key backoff cap.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);
/// Default global sustained rate (items per second).
pub const DEFAULT_GLOBAL_QPS: f64 = 10.0;
/// Default global burst.
pub const DEFAULT_GLOBAL_BURST: f64 = 100.0;

/// Combined per-key exponential backoff and global token bucket.
pub struct RateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
    bucket: Mutex<TokenBucket>,
}

struct TokenBucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// Reserve one token, returning how long the caller must wait for it.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_limits(
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
            DEFAULT_GLOBAL_QPS,
            DEFAULT_GLOBAL_BURST,
        )
    }

    pub fn with_limits(base: Duration, max: Duration, qps: f64, burst: f64) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
            bucket: Mutex::new(TokenBucket {
                qps,
                burst,
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    /// Delay before the key may be retried. Each call counts as a failure.
    pub fn when(&self, key: &str) -> Duration {
        let attempts = {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            let entry = failures.entry(key.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        // base * 2^(attempts-1), capped.
        let exp = self
            .base
            .checked_mul(1u32 << (attempts - 1).min(20))
            .unwrap_or(self.max)
            .min(self.max);

        let global = self
            .bucket
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reserve();

        exp.max(global)
    }

    /// Number of failures recorded for a key.
    pub fn retries(&self, key: &str) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Clear the failure history for a key after a successful sync.
    pub fn forget(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let limiter = RateLimiter::with_limits(
            Duration::from_millis(100),
            Duration::from_secs(1),
            1_000_000.0,
            1_000_000.0,
        );

        assert_eq!(limiter.when("vm/a"), Duration::from_millis(100));
        assert_eq!(limiter.when("vm/a"), Duration::from_millis(200));
        assert_eq!(limiter.when("vm/a"), Duration::from_millis(400));
        assert_eq!(limiter.when("vm/a"), Duration::from_millis(800));
        // Capped.
        assert_eq!(limiter.when("vm/a"), Duration::from_secs(1));
        assert_eq!(limiter.when("vm/a"), Duration::from_secs(1));

        // Keys are independent.
        assert_eq!(limiter.when("vm/b"), Duration::from_millis(100));

        limiter.forget("vm/a");
        assert_eq!(limiter.when("vm/a"), Duration::from_millis(100));
    }

    #[test]
    fn test_global_bucket_throttles_after_burst() {
        let limiter = RateLimiter::with_limits(
            Duration::ZERO,
            Duration::from_secs(300),
            10.0,
            2.0,
        );

        // Burst allows the first reservations through; distinct keys keep
        // the per-key term at the base (zero here).
        assert_eq!(limiter.when("a"), Duration::ZERO);
        assert_eq!(limiter.when("b"), Duration::ZERO);
        // Bucket exhausted: delays appear and grow with the deficit.
        let third = limiter.when("c");
        let fourth = limiter.when("d");
        assert!(third > Duration::ZERO);
        assert!(fourth > third);
    }
}
