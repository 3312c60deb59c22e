use crate::ipc::worker::WorkerConnection;
use std::sync::Arc;

/// Argmin of each worker's EWMA latency (α = 0.2, maintained by the
/// connection itself on request completion). Workers with no completed
/// requests yet score zero and are tried first.
#[derive(Default)]
pub struct LeastLatencyBalancer;

impl LeastLatencyBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn do_select(&self, ready: &[Arc<WorkerConnection>]) -> Option<Arc<WorkerConnection>> {
        ready
            .iter()
            .min_by(|a, b| {
                a.ewma_latency_ns()
                    .partial_cmp(&b.ewma_latency_ns())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id().cmp(b.id()))
            })
            .cloned()
    }
}
