//! Gateway counters.
//!
//! Every admission rejection and every backend attempt is counted here.
//! Served as JSON from `GET /metrics`, and as Prometheus text when the
//! `metrics` feature is enabled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// API Gateway metrics
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    // Request counters
    pub requests_total: AtomicU64,
    pub requests_success: AtomicU64,
    pub requests_error: AtomicU64,
    pub in_flight: AtomicU64,

    // Admission gates
    pub auth_rejected: AtomicU64,
    pub rate_limit_checks: AtomicU64,
    pub rate_limit_rejected: AtomicU64,
    pub circuit_rejected: AtomicU64,

    // Backend attempts
    pub backend_attempts: AtomicU64,
    pub retry_attempts: AtomicU64,
    pub retries_exhausted: AtomicU64,
    pub backend_failures: AtomicU64,

    // Latency
    pub total_latency_ms: AtomicU64,
    pub request_count_for_latency: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished request
    pub fn record_request(&self, success: bool, latency_ms: u64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        if success {
            self.requests_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_error.fetch_add(1, Ordering::Relaxed);
        }

        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.request_count_for_latency
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_rejection(&self) {
        self.auth_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_check(&self, granted: bool) {
        self.rate_limit_checks.fetch_add(1, Ordering::Relaxed);
        if !granted {
            self.rate_limit_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_circuit_rejection(&self) {
        self.circuit_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// One call handed to a backend client
    pub fn record_backend_attempt(&self) {
        self.backend_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// One further attempt issued by the retry loop, whether or not it
    /// reaches a backend
    pub fn record_retry_attempt(&self) {
        self.retry_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backend_failure(&self) {
        self.backend_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retries_exhausted(&self) {
        self.retries_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Get average latency in ms
    pub fn average_latency_ms(&self) -> f64 {
        let total = self.total_latency_ms.load(Ordering::Relaxed);
        let count = self.request_count_for_latency.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        }
    }

    /// Export metrics in Prometheus text format
    #[cfg(feature = "metrics")]
    pub fn to_prometheus(&self) -> Result<String, prometheus::Error> {
        use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};

        let registry = Registry::new_custom(Some("api_gateway".into()), None)?;

        let counters = [
            ("requests_total", "Total number of API requests", &self.requests_total),
            ("requests_success_total", "Successful requests", &self.requests_success),
            ("requests_error_total", "Failed requests", &self.requests_error),
            ("auth_rejected_total", "Requests rejected by authentication", &self.auth_rejected),
            ("rate_limit_checks_total", "Rate limiter admission checks", &self.rate_limit_checks),
            ("rate_limit_rejected_total", "Rate limited requests", &self.rate_limit_rejected),
            ("circuit_rejected_total", "Calls rejected by an open circuit", &self.circuit_rejected),
            ("backend_attempts_total", "Calls handed to backends", &self.backend_attempts),
            ("retry_attempts_total", "Attempts issued after the first", &self.retry_attempts),
            ("retries_exhausted_total", "Calls that ran out of attempts", &self.retries_exhausted),
            ("backend_failures_total", "Failed backend attempts", &self.backend_failures),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::new(name, help)?;
            counter.inc_by(value.load(Ordering::Relaxed));
            registry.register(Box::new(counter))?;
        }

        let in_flight = IntGauge::new("in_flight_requests", "Requests currently being served")?;
        in_flight.set(self.in_flight() as i64);
        registry.register(Box::new(in_flight))?;

        let latency = Gauge::new("average_latency_ms", "Average request latency")?;
        latency.set(self.average_latency_ms());
        registry.register(Box::new(latency))?;

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "requests": {
                "total": self.requests_total.load(Ordering::Relaxed),
                "success": self.requests_success.load(Ordering::Relaxed),
                "error": self.requests_error.load(Ordering::Relaxed),
                "in_flight": self.in_flight(),
            },
            "admission": {
                "auth_rejected": self.auth_rejected.load(Ordering::Relaxed),
                "rate_limit_checks": self.rate_limit_checks.load(Ordering::Relaxed),
                "rate_limit_rejected": self.rate_limit_rejected.load(Ordering::Relaxed),
                "circuit_rejected": self.circuit_rejected.load(Ordering::Relaxed),
            },
            "backends": {
                "attempts": self.backend_attempts.load(Ordering::Relaxed),
                "retries": self.retry_attempts.load(Ordering::Relaxed),
                "retries_exhausted": self.retries_exhausted.load(Ordering::Relaxed),
                "failures": self.backend_failures.load(Ordering::Relaxed),
            },
            "latency": {
                "average_ms": self.average_latency_ms(),
            }
        })
    }
}

/// Tracks one request from admission to reply.
///
/// Counts the request as in flight until [`finish`](Self::finish) is called
/// or the timer is dropped; a dropped timer records an error.
pub struct RequestTimer {
    start: Instant,
    metrics: Arc<GatewayMetrics>,
    finished: bool,
}

impl RequestTimer {
    pub fn new(metrics: Arc<GatewayMetrics>) -> Self {
        metrics.in_flight.fetch_add(1, Ordering::Relaxed);
        Self {
            start: Instant::now(),
            metrics,
            finished: false,
        }
    }

    pub fn finish(mut self, success: bool) {
        self.complete(success);
    }

    fn complete(&mut self, success: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        let latency_ms = self.start.elapsed().as_millis() as u64;
        self.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.metrics.record_request(success, latency_ms);
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        self.complete(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = GatewayMetrics::new();

        metrics.record_request(true, 100);
        metrics.record_request(true, 200);
        metrics.record_request(false, 50);

        assert_eq!(metrics.requests_total.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.requests_success.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.requests_error.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_average_latency() {
        let metrics = GatewayMetrics::new();

        metrics.record_request(true, 100);
        metrics.record_request(true, 200);
        metrics.record_request(true, 300);

        assert!((metrics.average_latency_ms() - 200.0).abs() < 0.01);
    }

    #[test]
    fn test_attempt_counters_are_independent() {
        let metrics = GatewayMetrics::new();
        metrics.record_backend_attempt();
        metrics.record_retry_attempt();
        metrics.record_retry_attempt();

        assert_eq!(metrics.backend_attempts.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.retry_attempts.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_timer_tracks_in_flight() {
        let metrics = Arc::new(GatewayMetrics::new());

        let timer = RequestTimer::new(Arc::clone(&metrics));
        assert_eq!(metrics.in_flight(), 1);
        timer.finish(true);
        assert_eq!(metrics.in_flight(), 0);
        assert_eq!(metrics.requests_success.load(Ordering::Relaxed), 1);

        // Dropped without finishing: the caller went away
        drop(RequestTimer::new(Arc::clone(&metrics)));
        assert_eq!(metrics.in_flight(), 0);
        assert_eq!(metrics.requests_error.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_json_export() {
        let metrics = GatewayMetrics::new();
        metrics.record_request(true, 100);
        metrics.record_rate_limit_check(false);

        let json = metrics.to_json();
        assert_eq!(json["requests"]["total"], 1);
        assert_eq!(json["requests"]["success"], 1);
        assert_eq!(json["admission"]["rate_limit_rejected"], 1);
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_prometheus_export() {
        let metrics = GatewayMetrics::new();
        metrics.record_circuit_rejection();

        let text = metrics.to_prometheus().unwrap();
        assert!(text.contains("api_gateway_circuit_rejected_total 1"));
    }
}
