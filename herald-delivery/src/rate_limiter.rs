//! Per-submitter admission rate limiting using a token bucket.
//!
//! Each submitter key owns a bucket of `capacity` tokens over a fixed
//! window. The first observation at or past the window boundary refills
//! the bucket completely and restarts the window; there is no continuous
//! drip. Decisions are advisory to the admission layer only; the worker
//! loop never consults the limiter.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use herald_common::tracing;
use serde::{Deserialize, Serialize};

/// Key used when the admission caller supplies no submitter identity.
pub const ANONYMOUS_KEY: &str = "anonymous";

/// Configuration for admission rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens granted per window.
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Window length in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            window_ms: default_window_ms(),
        }
    }
}

const fn default_capacity() -> u32 {
    100
}

const fn default_window_ms() -> u64 {
    60_000
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// One token consumed; the request may proceed.
    Allowed,
    /// Bucket exhausted; retry once the window turns over.
    Limited { retry_after: Duration },
}

impl Decision {
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Token bucket for a single submitter.
#[derive(Debug)]
struct Bucket {
    tokens: u32,
    window_start: Instant,
    last_seen: Instant,
}

impl Bucket {
    fn new(capacity: u32, now: Instant) -> Self {
        Self {
            tokens: capacity,
            window_start: now,
            last_seen: now,
        }
    }

    fn check(&mut self, config: &RateLimitConfig, now: Instant) -> Decision {
        self.last_seen = now;
        let window = Duration::from_millis(config.window_ms);

        if now.duration_since(self.window_start) >= window {
            self.tokens = config.capacity;
            self.window_start = now;
        }

        if self.tokens > 0 {
            self.tokens -= 1;
            Decision::Allowed
        } else {
            Decision::Limited {
                retry_after: (self.window_start + window).saturating_duration_since(now),
            }
        }
    }
}

/// Snapshot of one bucket for observability.
#[derive(Debug, Clone, Serialize)]
pub struct BucketStats {
    /// Tokens remaining in the current window.
    pub tokens: u32,
    /// Milliseconds until the window turns over.
    pub window_remaining_ms: u64,
}

/// Per-submitter rate limiter registry.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Arc<parking_lot::Mutex<Bucket>>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    fn bucket(&self, key: &str) -> Arc<parking_lot::Mutex<Bucket>> {
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(parking_lot::Mutex::new(Bucket::new(
                    self.config.capacity,
                    Instant::now(),
                )))
            })
            .clone()
    }

    /// Check and consume one token for `key`.
    pub fn check(&self, key: &str) -> Decision {
        let bucket = self.bucket(key);
        let decision = bucket.lock().check(&self.config, Instant::now());

        if let Decision::Limited { retry_after } = decision {
            tracing::debug!(
                key = %key,
                retry_after_ms = retry_after.as_millis() as u64,
                "admission rate limit exceeded"
            );
        }

        decision
    }

    /// Remove buckets idle for more than two windows. Returns how many
    /// were removed.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let idle_cutoff = Duration::from_millis(self.config.window_ms.saturating_mul(2));
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.lock().last_seen) <= idle_cutoff);
        let removed = before - self.buckets.len();
        if removed > 0 {
            tracing::debug!(removed, "swept idle rate-limit buckets");
        }
        removed
    }

    /// Snapshot the bucket for `key`, if one exists.
    pub fn stats(&self, key: &str) -> Option<BucketStats> {
        self.buckets.get(key).map(|bucket| {
            let bucket = bucket.lock();
            let window = Duration::from_millis(self.config.window_ms);
            let elapsed = Instant::now().duration_since(bucket.window_start);
            BucketStats {
                tokens: bucket.tokens,
                window_remaining_ms: window.saturating_sub(elapsed).as_millis() as u64,
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(capacity: u32, window_ms: u64) -> RateLimitConfig {
        RateLimitConfig {
            capacity,
            window_ms,
        }
    }

    #[test]
    fn test_bucket_exhaustion() {
        let limiter = RateLimiter::new(config(3, 60_000));

        for _ in 0..3 {
            assert!(limiter.check("alice").is_allowed());
        }

        let Decision::Limited { retry_after } = limiter.check("alice") else {
            panic!("expected rate limit");
        };
        assert!(retry_after <= Duration::from_millis(60_000));
        assert!(retry_after > Duration::ZERO);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(config(1, 60_000));

        assert!(limiter.check("alice").is_allowed());
        assert!(!limiter.check("alice").is_allowed());
        assert!(limiter.check("bob").is_allowed());
    }

    #[test]
    fn test_window_refill() {
        let limiter = RateLimiter::new(config(2, 60_000));
        limiter.check("alice");
        limiter.check("alice");
        assert!(!limiter.check("alice").is_allowed());

        // Rewind the window start to simulate an elapsed window.
        {
            let bucket = limiter.buckets.get("alice").unwrap().clone();
            bucket.lock().window_start = Instant::now()
                .checked_sub(Duration::from_millis(60_001))
                .unwrap();
        }

        assert!(limiter.check("alice").is_allowed());
        let stats = limiter.stats("alice").unwrap();
        assert_eq!(stats.tokens, 1);
    }

    #[test]
    fn test_sweep_removes_only_idle_buckets() {
        let limiter = RateLimiter::new(config(10, 1_000));
        limiter.check("stale");
        limiter.check("fresh");

        {
            let bucket = limiter.buckets.get("stale").unwrap().clone();
            bucket.lock().last_seen = Instant::now()
                .checked_sub(Duration::from_millis(2_500))
                .unwrap();
        }

        let removed = limiter.sweep_idle(Instant::now());
        assert_eq!(removed, 1);
        assert!(limiter.stats("stale").is_none());
        assert!(limiter.stats("fresh").is_some());
    }

    #[test]
    fn test_stats_reflect_consumption() {
        let limiter = RateLimiter::new(config(5, 60_000));
        assert!(limiter.stats("alice").is_none());

        limiter.check("alice");
        limiter.check("alice");

        let stats = limiter.stats("alice").unwrap();
        assert_eq!(stats.tokens, 3);
        assert!(stats.window_remaining_ms <= 60_000);
    }
}
