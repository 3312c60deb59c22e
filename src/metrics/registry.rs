use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) work anywhere in the codebase. The handle is
/// retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register descriptions.
    ///
    /// When a recorder is already installed (multiple states in one test
    /// process) a detached recorder is used instead — macros keep feeding
    /// the first one, and this handle renders empty.
    pub fn install() -> Self {
        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher");

        let handle = match builder.install_recorder() {
            Ok(handle) => handle,
            Err(_) => PrometheusBuilder::new().build_recorder().handle(),
        };

        // --- Describe all metrics (adds HELP / TYPE lines) ---

        // request path
        describe_counter!(
            "edge_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed by the edge"
        );
        describe_histogram!(
            "edge_http_request_duration_seconds",
            Unit::Seconds,
            "Wall time per request from ingress to response write"
        );
        describe_gauge!(
            "edge_http_requests_in_flight",
            Unit::Count,
            "Requests currently inside the pipeline"
        );
        describe_counter!(
            "edge_http_errors_total",
            Unit::Count,
            "Failure responses by kind"
        );
        describe_counter!(
            "edge_fast_route_hits_total",
            Unit::Count,
            "Requests short-circuited by the fast-route table"
        );

        // dispatch
        describe_counter!("edge_dispatch_total", Unit::Count, "Dispatch attempts");
        describe_counter!(
            "edge_dispatch_failures_total",
            Unit::Count,
            "Dispatch failures by kind"
        );
        describe_counter!("edge_retries_total", Unit::Count, "Retry attempts");
        describe_counter!(
            "edge_unknown_response_total",
            Unit::Count,
            "Worker responses with no pending entry (late or duplicate)"
        );
        describe_counter!(
            "edge_protocol_errors_total",
            Unit::Count,
            "Framing violations that dropped a worker socket"
        );
        describe_counter!(
            "edge_broadcast_skipped_total",
            Unit::Count,
            "Broadcast messages skipped due to saturated workers"
        );

        // admission
        describe_counter!(
            "edge_admission_rejected_total",
            Unit::Count,
            "Requests rejected by the admission layer"
        );

        // worker fleet
        describe_gauge!("edge_workers_ready", Unit::Count, "Ready workers");
        describe_gauge!("edge_workers_desired", Unit::Count, "Desired worker count");
        describe_counter!(
            "edge_worker_respawns_total",
            Unit::Count,
            "Unexpected worker exits that were respawned"
        );
        describe_counter!(
            "edge_worker_poisoned_total",
            Unit::Count,
            "Worker slots poisoned after exhausting the restart budget"
        );
        describe_gauge!(
            "edge_worker_rss_bytes",
            Unit::Bytes,
            "Sampled resident set size per worker"
        );
        describe_counter!(
            "drained_requests_total",
            Unit::Count,
            "In-flight requests completed during graceful drain"
        );

        // autoscaler
        describe_gauge!(
            "edge_inflight_requests",
            Unit::Count,
            "Total in-flight requests across workers (autoscaler sample)"
        );
        describe_gauge!(
            "edge_send_queue_depth",
            Unit::Count,
            "Outbound frames queued across worker channels"
        );
        describe_gauge!(
            "edge_avg_worker_latency_ms",
            Unit::Milliseconds,
            "Mean EWMA latency across ready workers"
        );
        describe_gauge!(
            "edge_rescue_mode",
            Unit::Count,
            "1 while the edge is in rescue mode"
        );
        describe_counter!(
            "edge_autoscale_decisions_total",
            Unit::Count,
            "Scaling decisions by direction"
        );
        describe_counter!(
            "edge_gc_hints_total",
            Unit::Count,
            "force_gc broadcasts triggered by RSS growth"
        );

        // connections
        describe_gauge!(
            "edge_connections_active",
            Unit::Count,
            "Active downstream connections"
        );
        describe_counter!(
            "edge_connections_total",
            Unit::Count,
            "Connections accepted"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
