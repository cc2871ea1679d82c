use std::collections::BTreeSet;
use std::time::Duration;

use http::{Method, StatusCode};
use rand::Rng;

use crate::error::ApiErrorKind;

/// Governs if and how a failed attempt is retried.
///
/// `max_attempts` is the total number of transport invocations, so the
/// standard policy of 3 means one initial try plus up to two retries.
/// Delays grow geometrically from `initial_delay`, capped at `max_delay`,
/// with uniform jitter of `jitter_ratio` applied either side.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_ratio: f64,
    max_retry_after: Duration,
    retryable_status_codes: BTreeSet<u16>,
    retryable_methods: Vec<Method>,
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [429, 500, 502, 503, 504].into_iter().collect()
}

fn default_retryable_methods() -> Vec<Method> {
    vec![
        Method::GET,
        Method::PUT,
        Method::DELETE,
        Method::HEAD,
        Method::OPTIONS,
    ]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::standard()
    }
}

impl RetryPolicy {
    /// Three total attempts, 200ms initial delay doubling to a 10s cap,
    /// 20% jitter.
    pub fn standard() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_ratio: 0.2,
            max_retry_after: Duration::from_secs(30),
            retryable_status_codes: default_retryable_status_codes(),
            retryable_methods: default_retryable_methods(),
        }
    }

    /// A single attempt, no retries.
    pub fn disabled() -> Self {
        RetryPolicy {
            max_attempts: 1,
            jitter_ratio: 0.0,
            ..RetryPolicy::standard()
        }
    }

    /// Total transport invocations. Zero is treated as one attempt.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
            multiplier
        } else {
            1.0
        };
        self
    }

    /// Clamped to `[0.0, 1.0]`.
    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = if jitter_ratio.is_finite() {
            jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Ceiling on server-supplied `Retry-After` waits. A misbehaving
    /// server advertising an hour must not stall the retry loop for an
    /// hour.
    pub fn max_retry_after(mut self, max_retry_after: Duration) -> Self {
        self.max_retry_after = max_retry_after;
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn retryable_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.retryable_methods = methods.into_iter().collect();
        self
    }

    pub fn max_attempts_value(&self) -> u32 {
        self.max_attempts
    }

    pub(crate) fn clamp_retry_after(&self, hint: Duration) -> Duration {
        hint.min(self.max_retry_after)
    }

    pub(crate) fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retryable_status_codes.contains(&status.as_u16())
    }

    pub(crate) fn is_retryable_method(&self, method: &Method) -> bool {
        self.retryable_methods.contains(method)
    }

    /// Whether the attempt described by `decision` should be retried.
    ///
    /// Requires budget left, a method on the retryable list, and either a
    /// retryable status or a transient error kind. The method gate applies
    /// to transport errors too: a connection can drop after a POST reached
    /// the server, so replaying it is not safe by default.
    pub fn should_retry(&self, decision: &RetryDecision) -> bool {
        if decision.attempt >= self.max_attempts {
            return false;
        }
        if !self.is_retryable_method(&decision.method) {
            return false;
        }
        if let Some(status) = decision.status {
            return self.is_retryable_status(status);
        }
        matches!(
            decision.error_kind,
            Some(ApiErrorKind::Network) | Some(ApiErrorKind::Timeout)
        )
    }

    /// Backoff before retry number `retry_index` (zero-based), jittered.
    ///
    /// The pre-jitter delay is `initial_delay * multiplier^retry_index`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        let exponent = retry_index.min(64) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        self.apply_jitter(capped)
    }

    fn apply_jitter(&self, delay_secs: f64) -> Duration {
        if self.jitter_ratio <= f64::EPSILON || delay_secs <= 0.0 {
            return Duration::from_secs_f64(delay_secs.max(0.0));
        }
        let span = delay_secs * self.jitter_ratio;
        let low = (delay_secs - span).max(0.0);
        let high = delay_secs + span;
        let sampled = rand::rng().random_range(low..=high);
        Duration::from_secs_f64(sampled.min(self.max_delay.as_secs_f64()))
    }
}

/// One attempt's outcome, as seen by [`RetryPolicy::should_retry`].
///
/// Exactly one of `status` and `error_kind` is set: a status when the
/// transport produced a response, an error kind when it did not.
#[derive(Debug, Clone)]
pub struct RetryDecision {
    pub attempt: u32,
    pub max_attempts: u32,
    pub method: Method,
    pub status: Option<StatusCode>,
    pub error_kind: Option<ApiErrorKind>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_decision(attempt: u32, method: Method, status: u16) -> RetryDecision {
        RetryDecision {
            attempt,
            max_attempts: 3,
            method,
            status: Some(StatusCode::from_u16(status).unwrap()),
            error_kind: None,
        }
    }

    fn error_decision(attempt: u32, method: Method, kind: ApiErrorKind) -> RetryDecision {
        RetryDecision {
            attempt,
            max_attempts: 3,
            method,
            status: None,
            error_kind: Some(kind),
        }
    }

    #[test]
    fn delays_grow_geometrically_to_the_cap() {
        let policy = RetryPolicy::standard()
            .initial_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .max_delay(Duration::from_millis(350))
            .jitter_ratio(0.0);

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(10), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_ratio_bounds() {
        let policy = RetryPolicy::standard()
            .initial_delay(Duration::from_millis(1000))
            .max_delay(Duration::from_secs(60))
            .jitter_ratio(0.2);

        for _ in 0..200 {
            let delay = policy.delay_for(0);
            assert!(delay >= Duration::from_millis(800), "delay {delay:?} too low");
            assert!(delay <= Duration::from_millis(1200), "delay {delay:?} too high");
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let policy = RetryPolicy::standard().jitter_ratio(0.0);
        assert_eq!(policy.delay_for(1), policy.delay_for(1));
    }

    #[test]
    fn retryable_statuses_on_idempotent_methods_retry() {
        let policy = RetryPolicy::standard();
        for status in [429, 500, 502, 503, 504] {
            assert!(
                policy.should_retry(&status_decision(1, Method::GET, status)),
                "status {status} should retry"
            );
        }
        assert!(!policy.should_retry(&status_decision(1, Method::GET, 501)));
        assert!(!policy.should_retry(&status_decision(1, Method::GET, 400)));
        assert!(!policy.should_retry(&status_decision(1, Method::GET, 200)));
    }

    #[test]
    fn post_is_never_retried_by_default() {
        let policy = RetryPolicy::standard();
        assert!(!policy.should_retry(&status_decision(1, Method::POST, 503)));
        assert!(!policy.should_retry(&error_decision(1, Method::POST, ApiErrorKind::Timeout)));
    }

    #[test]
    fn post_retries_when_opted_in() {
        let policy = RetryPolicy::standard().retryable_methods([Method::GET, Method::POST]);
        assert!(policy.should_retry(&status_decision(1, Method::POST, 503)));
    }

    #[test]
    fn budget_exhaustion_stops_retries() {
        let policy = RetryPolicy::standard().max_attempts(3);
        assert!(policy.should_retry(&status_decision(2, Method::GET, 503)));
        assert!(!policy.should_retry(&status_decision(3, Method::GET, 503)));
    }

    #[test]
    fn transient_errors_retry_and_terminal_errors_do_not() {
        let policy = RetryPolicy::standard();
        assert!(policy.should_retry(&error_decision(1, Method::GET, ApiErrorKind::Network)));
        assert!(policy.should_retry(&error_decision(1, Method::GET, ApiErrorKind::Timeout)));
        assert!(!policy.should_retry(&error_decision(1, Method::GET, ApiErrorKind::Validation)));
    }

    #[test]
    fn retry_after_hints_are_capped() {
        let policy = RetryPolicy::standard().max_retry_after(Duration::from_secs(5));
        assert_eq!(
            policy.clamp_retry_after(Duration::from_secs(86_400)),
            Duration::from_secs(5)
        );
        assert_eq!(
            policy.clamp_retry_after(Duration::from_secs(2)),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn zero_max_attempts_clamps_to_one() {
        let policy = RetryPolicy::standard().max_attempts(0);
        assert_eq!(policy.max_attempts_value(), 1);
        assert!(!policy.should_retry(&status_decision(1, Method::GET, 503)));
    }
}
