//! Shared gate on pod creation
//!
//! One limiter is shared by every synthesis call in the controller, so the
//! check-and-consume in [`RateLimiter::allow`] must be atomic.

use std::time::{Duration, Instant};

#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;

/// Decides whether one more pod may be created right now
#[cfg_attr(test, automock)]
pub trait RateLimiter: Send + Sync {
    /// Take one permit if available
    fn allow(&self) -> bool;
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: `burst` permits, refilled at `per_second` permits per second
#[derive(Debug)]
pub struct TokenBucket {
    per_second: f64,
    burst: f64,
    state: Mutex<Bucket>,
}

impl TokenBucket {
    /// Create a full bucket
    ///
    /// A zero `burst` is raised to one so the limiter can ever admit a request.
    pub fn new(per_second: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            per_second: per_second.max(0.0),
            burst,
            state: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut bucket = self.state.lock();
        let elapsed = now
            .checked_duration_since(bucket.last_refill)
            .unwrap_or(Duration::ZERO);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.per_second).min(self.burst);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl RateLimiter for TokenBucket {
    fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }
}

/// Limiter that never denies
#[derive(Clone, Copy, Debug, Default)]
pub struct Unlimited;

impl RateLimiter for Unlimited {
    fn allow(&self) -> bool {
        true
    }
}
