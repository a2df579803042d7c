//! Ambient process telemetry: a Prometheus recorder installed once at
//! startup, describing the counters/gauges/histograms the rest of the
//! crate emits via the `metrics` macros.
//!
//! Grounded directly on the teacher's `metrics/registry.rs` (`Metrics`);
//! renamed `Telemetry` to avoid colliding with the in-process
//! [`crate::metering::MetricsAggregator`] (spec.md component F), which is
//! a query engine over recent call outcomes, not a Prometheus exporter.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder. Retained solely for
/// rendering the `/metrics` endpoint; the `metrics` crate macros write
/// through the global recorder installed by `install()`.
#[derive(Clone)]
pub struct Telemetry {
    handle: PrometheusHandle,
}

impl Telemetry {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called once at startup before any
    /// `counter!`/`gauge!`/`histogram!` call.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "creditgate_admission_requests_total",
            Unit::Count,
            "Total calls accepted into the admission pipeline"
        );
        describe_histogram!(
            "creditgate_admission_duration_seconds",
            Unit::Seconds,
            "End-to-end admission pipeline duration per call"
        );

        describe_counter!(
            "creditgate_rate_limit_allowed_total",
            Unit::Count,
            "Total calls allowed by the rate limiter"
        );
        describe_counter!(
            "creditgate_rate_limit_denied_total",
            Unit::Count,
            "Total calls rejected by the rate limiter"
        );

        describe_counter!(
            "creditgate_reservations_total",
            Unit::Count,
            "Reservation outcomes by label (held, rejected, settled, released, expired)"
        );

        describe_counter!(
            "creditgate_dedup_hits_total",
            Unit::Count,
            "Total requests recognised as duplicates by fingerprint"
        );
        describe_counter!(
            "creditgate_events_dropped_total",
            Unit::Count,
            "Total async event-subscriber deliveries dropped on a full queue"
        );

        describe_gauge!(
            "creditgate_keys_total",
            Unit::Count,
            "Number of provisioned API keys"
        );
        describe_gauge!(
            "creditgate_sessions_active",
            Unit::Count,
            "Number of currently active sessions"
        );

        describe_counter!(
            "creditgate_tool_calls_total",
            Unit::Count,
            "Total downstream tool invocations by outcome"
        );
        describe_histogram!(
            "creditgate_tool_call_duration_seconds",
            Unit::Seconds,
            "Downstream tool invocation duration"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
