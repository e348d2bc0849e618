//! Metrics instrumentation for runtime observability.

use crate::run::{Lane, RunStatus};
use std::time::Instant;

/// Record model turn latency, from request to end of stream.
pub fn record_model_latency(duration_ms: f64) {
    metrics::histogram!("model_turn_latency", duration_ms);
}

/// Record tool execution latency.
pub fn record_tool_latency(duration_ms: f64) {
    metrics::histogram!("tool_execution_latency", duration_ms);
}

/// Record run duration.
pub fn record_run_duration(duration_ms: f64) {
    metrics::histogram!("run_duration", duration_ms);
}

/// Count a run reaching a terminal state.
pub fn increment_runs_finished(lane: Lane, status: RunStatus) {
    metrics::counter!("runs_finished", 1, "lane" => lane.as_str(), "status" => status.as_str());
}

/// Count a tool invocation that reported failure.
pub fn increment_tool_failures() {
    metrics::counter!("tool_failures", 1);
}

/// Count credits deducted from accounts.
pub fn increment_credits_charged(credits: i64) {
    if credits > 0 {
        metrics::counter!("credits_charged", credits as u64);
    }
}

/// RAII timer for automatic metric recording.
pub struct MetricTimer {
    start: Instant,
    metric_name: &'static str,
}

impl MetricTimer {
    pub fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for MetricTimer {
    fn drop(&mut self) {
        let duration_ms = self.elapsed_ms();
        match self.metric_name {
            "model_turn_latency" => record_model_latency(duration_ms),
            "tool_execution_latency" => record_tool_latency(duration_ms),
            "run_duration" => record_run_duration(duration_ms),
            _ => {}
        }
    }
}

/// Install the Prometheus recorder with its own HTTP listener.
#[cfg(feature = "prometheus")]
pub fn install_prometheus_exporter(
    addr: std::net::SocketAddr,
) -> Result<(), crate::interfaces::RuntimeError> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| {
            crate::interfaces::RuntimeError::ConfigError(format!(
                "Failed to install metrics exporter: {}",
                e
            ))
        })
}
