use crate::ipc::worker::WorkerConnection;
use std::sync::Arc;

/// Argmin of in-flight requests; ties broken by worker id so concurrent
/// callers converge on a stable order.
#[derive(Default)]
pub struct LeastConnectionsBalancer;

impl LeastConnectionsBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn do_select(&self, ready: &[Arc<WorkerConnection>]) -> Option<Arc<WorkerConnection>> {
        ready
            .iter()
            .min_by(|a, b| {
                a.active()
                    .cmp(&b.active())
                    .then_with(|| a.id().cmp(b.id()))
            })
            .cloned()
    }
}
