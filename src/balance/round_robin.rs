use crate::ipc::worker::WorkerConnection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Atomic next-index rotation over the ready snapshot.
pub struct RoundRobinBalancer {
    counter: AtomicU64,
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn do_select(&self, ready: &[Arc<WorkerConnection>]) -> Option<Arc<WorkerConnection>> {
        if ready.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(ready[(count % ready.len() as u64) as usize].clone())
    }
}
