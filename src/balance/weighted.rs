use crate::ipc::worker::WorkerConnection;
use std::sync::{Arc, Mutex};

/// Smooth weighted round-robin (the nginx algorithm).
///
/// Each pick adds every worker's effective weight to its current weight,
/// selects the argmax, and subtracts the total weight from the winner.
/// The running weights live behind a small mutex; they are rebuilt when
/// the worker-set version changes.
pub struct WeightedBalancer {
    state: Mutex<SwrrState>,
}

struct SwrrState {
    set_version: u64,
    /// (worker-id, current weight), aligned with the snapshot by id.
    current: Vec<(Arc<str>, i64)>,
}

impl Default for WeightedBalancer {
    fn default() -> Self {
        Self {
            state: Mutex::new(SwrrState {
                set_version: u64::MAX,
                current: Vec::new(),
            }),
        }
    }
}

impl WeightedBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn do_select(
        &self,
        ready: &[Arc<WorkerConnection>],
        set_version: u64,
    ) -> Option<Arc<WorkerConnection>> {
        if ready.is_empty() {
            return None;
        }

        let mut state = self.state.lock().unwrap();
        if state.set_version != set_version || state.current.len() != ready.len() {
            state.set_version = set_version;
            state.current = ready.iter().map(|w| (w.id_arc(), 0i64)).collect();
        }

        let mut total: i64 = 0;
        let mut best: Option<usize> = None;
        for (idx, worker) in ready.iter().enumerate() {
            let weight = worker.effective_weight() as i64;
            total += weight;
            state.current[idx].1 += weight;
            match best {
                Some(b) if state.current[idx].1 <= state.current[b].1 => {}
                _ => best = Some(idx),
            }
        }

        let winner = best?;
        state.current[winner].1 -= total;
        Some(ready[winner].clone())
    }
}
