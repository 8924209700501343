//! Per-key token bucket rate limiting.
//!
//! Buckets are created lazily at full capacity and live for the life of the
//! process. Each key is updated under its own map shard lock, so unrelated
//! clients never serialize on a single mutex.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// A single token bucket.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Token count after refilling up to `now`, without mutating.
    fn projected(&self, now: Instant, capacity: f64, refill_rate: f64) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * refill_rate).clamp(0.0, capacity)
    }

    fn try_consume(&mut self, n: f64, now: Instant, capacity: f64, refill_rate: f64) -> bool {
        self.tokens = self.projected(now, capacity, refill_rate);
        self.last_refill = now;

        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }
}

/// Keyed token bucket limiter.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
    capacity: f64,
    refill_rate: f64,
}

impl RateLimiter {
    /// Create a limiter where every bucket holds `capacity` tokens and
    /// regains `refill_per_sec` tokens per second.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity: f64::from(capacity),
            refill_rate: refill_per_sec.max(0.0),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.capacity, config.refill_per_sec)
    }

    /// Refill then try to take `n` tokens from `key`'s bucket.
    pub fn consume(&self, key: &str, n: u32) -> bool {
        let now = Instant::now();
        let n = f64::from(n);

        if let Some(mut bucket) = self.buckets.get_mut(key) {
            return bucket.try_consume(n, now, self.capacity, self.refill_rate);
        }

        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::full(self.capacity, now))
            .try_consume(n, now, self.capacity, self.refill_rate)
    }

    /// Tokens currently available for `key`. Never mutates the bucket.
    pub fn tokens_remaining(&self, key: &str) -> f64 {
        match self.buckets.get(key) {
            Some(bucket) => bucket.projected(Instant::now(), self.capacity, self.refill_rate),
            None => self.capacity,
        }
    }

    /// Time until `n` tokens will be available for `key`.
    pub fn retry_after(&self, key: &str, n: u32) -> Duration {
        let missing = f64::from(n) - self.tokens_remaining(key);
        if missing <= 0.0 {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 || f64::from(n) > self.capacity {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64(missing / self.refill_rate).unwrap_or(Duration::MAX)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Number of buckets created so far.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
