use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ApiError, ApiErrorKind};
use crate::response::Response;
use crate::util::lock_unpoisoned;

/// Counters shared by every clone of a client. Lock-free on the hot path;
/// the per-status and per-error maps take a short mutex.
#[derive(Clone, Default)]
pub struct ClientMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    retries: AtomicU64,
    rate_limit_waits: AtomicU64,
    rate_limit_wait_micros: AtomicU64,
    cache_hits: AtomicU64,
    in_flight: AtomicU64,
    latency_samples: AtomicU64,
    latency_total_micros: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<ApiErrorKind, u64>>,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub retries: u64,
    pub rate_limit_waits: u64,
    pub rate_limit_wait_total: Duration,
    pub cache_hits: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total: Duration,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<ApiErrorKind, u64>,
}

impl MetricsSnapshot {
    pub fn average_latency(&self) -> Option<Duration> {
        if self.latency_samples == 0 {
            return None;
        }
        Some(self.latency_total / self.latency_samples as u32)
    }
}

impl ClientMetrics {
    pub(crate) fn record_request_started(&self) {
        self.inner.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub(crate) fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limit_wait(&self, waited: Duration) {
        self.inner.rate_limit_waits.fetch_add(1, Ordering::Relaxed);
        self.inner
            .rate_limit_wait_micros
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, result: &Result<Response, ApiError>, latency: Duration) {
        self.inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        self.inner
            .latency_total_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        match result {
            Ok(response) => {
                self.inner.requests_succeeded.fetch_add(1, Ordering::Relaxed);
                let mut counts = lock_unpoisoned(&self.inner.status_counts);
                *counts.entry(response.status().as_u16()).or_insert(0) += 1;
            }
            Err(error) => {
                self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
                if let Some(status) = error.status() {
                    let mut counts = lock_unpoisoned(&self.inner.status_counts);
                    *counts.entry(status.as_u16()).or_insert(0) += 1;
                }
                let mut counts = lock_unpoisoned(&self.inner.error_counts);
                *counts.entry(error.kind()).or_insert(0) += 1;
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_started: self.inner.requests_started.load(Ordering::Relaxed),
            requests_succeeded: self.inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.inner.requests_failed.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
            rate_limit_waits: self.inner.rate_limit_waits.load(Ordering::Relaxed),
            rate_limit_wait_total: Duration::from_micros(
                self.inner.rate_limit_wait_micros.load(Ordering::Relaxed),
            ),
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
            latency_samples: self.inner.latency_samples.load(Ordering::Relaxed),
            latency_total: Duration::from_micros(
                self.inner.latency_total_micros.load(Ordering::Relaxed),
            ),
            status_counts: lock_unpoisoned(&self.inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&self.inner.error_counts).clone(),
        }
    }
}

pub(crate) struct InFlightGuard {
    inner: Arc<MetricsInner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;
    use bytes::Bytes;
    use http::{HeaderMap, Method, StatusCode};

    fn ok_response() -> Response {
        Response::new(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::new(),
            Duration::from_millis(4),
            1,
            Request::test_stub(Method::GET, "https://api.example.com/x"),
        )
    }

    #[test]
    fn outcomes_feed_status_and_latency_counters() {
        let metrics = ClientMetrics::default();
        metrics.record_request_started();
        metrics.record_outcome(&Ok(ok_response()), Duration::from_millis(10));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_started, 1);
        assert_eq!(snapshot.requests_succeeded, 1);
        assert_eq!(snapshot.status_counts.get(&200), Some(&1));
        assert_eq!(snapshot.average_latency(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn errors_are_counted_by_kind() {
        let metrics = ClientMetrics::default();
        let error = ApiError::Timeout {
            timeout: Duration::from_secs(1),
            attempts: 3,
            message: "timed out".to_string(),
            request: None,
        };
        metrics.record_outcome(&Err(error), Duration::from_millis(5));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_failed, 1);
        assert_eq!(snapshot.error_counts.get(&ApiErrorKind::Timeout), Some(&1));
    }

    #[test]
    fn in_flight_guard_balances() {
        let metrics = ClientMetrics::default();
        {
            let _a = metrics.enter_in_flight();
            let _b = metrics.enter_in_flight();
            assert_eq!(metrics.snapshot().in_flight, 2);
        }
        assert_eq!(metrics.snapshot().in_flight, 0);
    }

    #[test]
    fn clones_share_counters() {
        let metrics = ClientMetrics::default();
        let clone = metrics.clone();
        metrics.record_retry();
        clone.record_retry();
        assert_eq!(metrics.snapshot().retries, 2);
    }
}
