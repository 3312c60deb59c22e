use crate::ipc::worker::WorkerConnection;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Stable key-affinity selection: hash of the routing key mod the ready-set
/// size. The snapshot is sorted by worker id, so a given key maps to the
/// same worker until the membership changes (which rehashes everything).
#[derive(Default)]
pub struct HashBalancer;

impl HashBalancer {
    pub fn new() -> Self {
        Self
    }

    pub fn do_select(
        &self,
        ready: &[Arc<WorkerConnection>],
        key: &str,
    ) -> Option<Arc<WorkerConnection>> {
        if ready.is_empty() {
            return None;
        }
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % ready.len() as u64) as usize;
        Some(ready[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::worker::WorkerState;
    use tokio::sync::mpsc;

    fn worker(id: &str) -> Arc<WorkerConnection> {
        let (tx, _rx) = mpsc::channel(8);
        let w = Arc::new(WorkerConnection::new(id, 1, tx));
        w.set_state(WorkerState::Ready);
        w
    }

    #[test]
    fn test_same_key_same_worker() {
        let lb = HashBalancer::new();
        let ready = vec![worker("a"), worker("b"), worker("c")];
        let first = lb.do_select(&ready, "client-42").unwrap();
        for _ in 0..50 {
            assert_eq!(lb.do_select(&ready, "client-42").unwrap().id(), first.id());
        }
    }

    #[test]
    fn test_keys_spread_across_workers() {
        let lb = HashBalancer::new();
        let ready = vec![worker("a"), worker("b"), worker("c"), worker("d")];
        let mut seen = std::collections::HashSet::new();
        for i in 0..200 {
            let key = format!("key-{}", i);
            seen.insert(lb.do_select(&ready, &key).unwrap().id().to_string());
        }
        assert_eq!(seen.len(), 4, "200 distinct keys should reach all workers");
    }

    #[test]
    fn test_empty() {
        let lb = HashBalancer::new();
        assert!(lb.do_select(&[], "k").is_none());
    }
}
