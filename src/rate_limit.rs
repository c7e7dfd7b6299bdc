//! Rate Limiting
//!
//! Token bucket rate limiter keyed by user identity. Each user may send up to
//! `max_per_minute` frames in a burst; tokens refill continuously.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Token bucket for rate limiting a single user.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens added per second.
    refill_rate: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(per_minute: u32) -> Self {
        let capacity = per_minute as f64;
        TokenBucket {
            tokens: capacity,
            capacity,
            refill_rate: capacity / 60.0,
            last_update: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-user rate limiter.
pub struct RateLimiter {
    buckets: RwLock<HashMap<Uuid, TokenBucket>>,
    max_per_minute: u32,
}

impl RateLimiter {
    /// Creates a limiter allowing `max_per_minute` frames per user.
    pub fn new(max_per_minute: u32) -> Self {
        RateLimiter {
            buckets: RwLock::new(HashMap::new()),
            max_per_minute,
        }
    }

    /// Tries to consume a token for `user_id`.
    ///
    /// Returns true if allowed, false if rate limited.
    pub fn consume(&self, user_id: &Uuid) -> bool {
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        buckets
            .entry(*user_id)
            .or_insert_with(|| TokenBucket::new(self.max_per_minute))
            .try_consume()
    }

    /// Drops buckets untouched for `max_idle`. Returns how many were removed.
    pub fn cleanup_inactive(&self, max_idle: Duration) -> usize {
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_update) < max_idle);
        before - buckets.len()
    }

    /// Number of users currently tracked.
    pub fn client_count(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
