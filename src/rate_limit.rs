use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::util::lock_unpoisoned;

/// Sustained rate and burst allowance for a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitPolicy {
    calls_per_second: f64,
    burst: f64,
}

impl RateLimitPolicy {
    /// `burst` starts equal to the rate; use [`burst`](Self::burst) to
    /// widen it.
    pub fn new(calls_per_second: f64) -> Self {
        let rate = normalize(calls_per_second);
        RateLimitPolicy {
            calls_per_second: rate,
            burst: rate.max(1.0),
        }
    }

    /// Ten calls per second, burst of ten.
    pub fn standard() -> Self {
        RateLimitPolicy::new(10.0)
    }

    pub fn burst(mut self, burst: f64) -> Self {
        self.burst = normalize(burst).max(1.0);
        self
    }

    pub fn calls_per_second_value(&self) -> f64 {
        self.calls_per_second
    }

    pub fn burst_value(&self) -> f64 {
        self.burst
    }
}

fn normalize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

struct TokenBucket {
    tokens: f64,
    last_refill_at: Instant,
    throttled_until: Option<Instant>,
}

impl TokenBucket {
    fn refill(&mut self, now: Instant, rate: f64, capacity: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill_at);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(capacity);
        self.last_refill_at = now;
    }
}

/// Token-bucket pacing, shared by every caller holding the same limiter.
///
/// Tokens accrue lazily at acquisition time; no background task runs. The
/// bucket's lock is only ever held for the arithmetic. When tokens are
/// short, [`acquire_delay`](Self::acquire_delay) returns how long to wait
/// without deducting, so the caller sleeps outside the lock and asks
/// again, competing fairly with concurrent callers after the wait.
pub struct RateLimiter {
    policy: RateLimitPolicy,
    bucket: Mutex<TokenBucket>,
}

// Wait hint when the configured rate is zero and no tokens remain.
const STALLED_RATE_WAIT: Duration = Duration::from_secs(60);

impl RateLimiter {
    /// A fresh limiter starts with a full bucket, so a burst of up to
    /// `burst` calls passes without waiting.
    pub fn new(policy: RateLimitPolicy) -> Self {
        RateLimiter {
            bucket: Mutex::new(TokenBucket {
                tokens: policy.burst_value(),
                last_refill_at: Instant::now(),
                throttled_until: None,
            }),
            policy,
        }
    }

    /// Deducts `tokens` and returns zero, or returns how long to wait
    /// before trying again. Nothing is deducted when a wait is returned.
    pub fn acquire_delay(&self, tokens: f64) -> Duration {
        let tokens = tokens.max(0.0);
        let now = Instant::now();
        let mut bucket = lock_unpoisoned(&self.bucket);
        if let Some(until) = bucket.throttled_until {
            if now < until {
                return until - now;
            }
            bucket.throttled_until = None;
        }
        bucket.refill(
            now,
            self.policy.calls_per_second_value(),
            self.policy.burst_value(),
        );
        if bucket.tokens >= tokens {
            bucket.tokens -= tokens;
            return Duration::ZERO;
        }
        let rate = self.policy.calls_per_second_value();
        if rate <= f64::EPSILON {
            return STALLED_RATE_WAIT;
        }
        let deficit = tokens - bucket.tokens;
        Duration::from_secs_f64(deficit / rate)
    }

    /// Tokens currently available, after a refill to now.
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = lock_unpoisoned(&self.bucket);
        bucket.refill(
            Instant::now(),
            self.policy.calls_per_second_value(),
            self.policy.burst_value(),
        );
        bucket.tokens
    }

    /// Pauses all acquisition for `wait`, typically a server's
    /// `Retry-After` hint. Every caller sharing this limiter backs off,
    /// not just the request that saw the 429.
    pub fn observe_retry_after(&self, wait: Duration) {
        if wait.is_zero() {
            return;
        }
        let until = Instant::now() + wait;
        let mut bucket = lock_unpoisoned(&self.bucket);
        match bucket.throttled_until {
            Some(existing) if existing >= until => {}
            _ => bucket.throttled_until = Some(until),
        }
    }

    /// Refills the bucket to capacity and lifts any server throttle.
    pub fn reset(&self) {
        let mut bucket = lock_unpoisoned(&self.bucket);
        bucket.tokens = self.policy.burst_value();
        bucket.last_refill_at = Instant::now();
        bucket.throttled_until = None;
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }
}
