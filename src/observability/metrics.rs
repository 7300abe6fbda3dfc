use metrics::{counter, gauge, histogram, describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

use crate::error::{AppError, Result};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Prometheus facade for the idempotency gateway.
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

    /// `outcome` is one of replayed, executed, conflict, failed.
    pub fn record_outcome(&self, outcome: &str) {
        counter!("idempotency_requests_total", "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_handler_latency(&self, duration_ms: f64, cached: bool) {
        histogram!("idempotency_handler_duration_ms", "cached" => cached.to_string()).record(duration_ms);
    }

    pub fn record_store_operation(&self, operation: &str, duration_ms: f64, success: bool) {
        counter!("idempotency_store_operations_total", "operation" => operation.to_string(), "success" => success.to_string()).increment(1);
        histogram!("idempotency_store_duration_ms", "operation" => operation.to_string()).record(duration_ms);
    }

    pub fn record_gate_wait(&self, duration_ms: f64) {
        histogram!("idempotency_gate_wait_duration_ms").record(duration_ms);
    }

    pub fn set_in_flight_leases(&self, count: usize) {
        gauge!("idempotency_in_flight_leases").set(count as f64);
    }

    pub fn record_corrupt_record(&self) {
        counter!("idempotency_corrupt_records_total").increment(1);
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

/// Installs the Prometheus recorder once and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to install Prometheus recorder: {}", e)))?;
    describe_metrics();

    METRICS.get_or_init(Metrics::new);
    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

/// Describes all metrics for Prometheus.
fn describe_metrics() {
    describe_counter!("idempotency_requests_total", Unit::Count, "Idempotent requests by outcome");
    describe_histogram!("idempotency_handler_duration_ms", Unit::Milliseconds, "Downstream handler latency in milliseconds");

    describe_counter!("idempotency_store_operations_total", Unit::Count, "Idempotency store operations");
    describe_histogram!("idempotency_store_duration_ms", Unit::Milliseconds, "Idempotency store latency in milliseconds");

    describe_histogram!("idempotency_gate_wait_duration_ms", Unit::Milliseconds, "Time duplicates spent waiting on an in-flight execution");
    describe_gauge!("idempotency_in_flight_leases", Unit::Count, "Keys with an execution in flight");
    describe_counter!("idempotency_corrupt_records_total", Unit::Count, "Stored records that could not be replayed");

    describe_counter!("http_requests_total", Unit::Count, "Total HTTP requests");
    describe_histogram!("http_request_duration_ms", Unit::Milliseconds, "HTTP request latency in milliseconds");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
