use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

use crate::error::{AppError, Result};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Prometheus-facing metrics. Without an installed recorder every call is a
/// no-op, so library code can record unconditionally.
#[derive(Debug, Clone)]
pub struct Metrics {
    initialized: bool,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self { initialized: true }
    }

    pub fn record_idempotency_outcome(&self, outcome: &str) {
        counter!("idempotency_outcomes_total", "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_handler_failure(&self) {
        counter!("idempotency_handler_failures_total").increment(1);
    }

    pub fn record_storage_error(&self, operation: &str) {
        counter!("idempotency_storage_errors_total", "operation" => operation.to_string())
            .increment(1);
    }

    pub fn record_stale_lock_takeover(&self) {
        counter!("idempotency_stale_lock_takeovers_total").increment(1);
    }

    pub fn record_handler_latency(&self, duration_ms: f64) {
        histogram!("idempotency_handler_duration_ms").record(duration_ms);
    }

    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_ms: f64) {
        counter!("http_requests_total", "method" => method.to_string(), "path" => path.to_string(), "status" => status.to_string()).increment(1);
        histogram!("http_request_duration_ms", "method" => method.to_string(), "path" => path.to_string()).record(duration_ms);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder (once per process) and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::Configuration(format!("failed to install Prometheus recorder: {}", e)))?;
    describe_metrics();
    METRICS.get_or_init(Metrics::new);

    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

fn describe_metrics() {
    describe_counter!("idempotency_outcomes_total", Unit::Count, "Requests by idempotency outcome");
    describe_counter!("idempotency_handler_failures_total", Unit::Count, "Protected handler invocations that failed and were not cached");
    describe_counter!("idempotency_storage_errors_total", Unit::Count, "Idempotency store operations that failed");
    describe_counter!("idempotency_stale_lock_takeovers_total", Unit::Count, "Locks taken over after exceeding the lock timeout");
    describe_histogram!("idempotency_handler_duration_ms", Unit::Milliseconds, "Protected handler latency in milliseconds");

    describe_counter!("http_requests_total", Unit::Count, "Total HTTP requests");
    describe_histogram!("http_request_duration_ms", Unit::Milliseconds, "HTTP request latency in milliseconds");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
