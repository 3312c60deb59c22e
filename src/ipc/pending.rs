use crate::error::DispatchError;
use crate::ipc::frame::WorkerReply;
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Outcome delivered through a pending entry.
pub type PendingResult = Result<WorkerReply, DispatchError>;

struct PendingEntry {
    tx: oneshot::Sender<PendingResult>,
    worker_id: Arc<str>,
}

/// In-flight request correlation table.
///
/// One entry per dispatched request id, inserted before the frame is
/// enqueued and removed on the earlier of response arrival, deadline, or
/// worker teardown — exactly one terminal outcome per id. A `response`
/// with an unknown id is dropped by the caller.
pub struct PendingTable {
    entries: DashMap<String, PendingEntry>,
    seq: AtomicU64,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            seq: AtomicU64::new(1),
        }
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-unique opaque id: local counter plus a random suffix so ids
    /// are not guessable across edge restarts.
    pub fn next_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let suffix: u32 = rand::thread_rng().gen();
        format!("{}-{:08x}", seq, suffix)
    }

    /// Insert an entry for `id` owned by `worker_id`.
    pub fn register(&self, id: &str, worker_id: Arc<str>) -> oneshot::Receiver<PendingResult> {
        let (tx, rx) = oneshot::channel();
        self.entries
            .insert(id.to_string(), PendingEntry { tx, worker_id });
        rx
    }

    /// Deliver a worker reply. Returns `false` when the id is unknown
    /// (already timed out or never dispatched) — the reply is dropped.
    pub fn complete(&self, reply: WorkerReply) -> bool {
        match self.entries.remove(&reply.id) {
            Some((_, entry)) => entry.tx.send(Ok(reply)).is_ok(),
            None => false,
        }
    }

    /// Remove an entry without delivering (deadline fired on the dispatch
    /// side). Returns `true` if the entry was still present.
    pub fn cancel(&self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Resolve every entry owned by `worker_id` with an upstream error —
    /// called when the worker's socket is torn down.
    pub fn fail_worker(&self, worker_id: &str) -> usize {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| &*e.value().worker_id == worker_id)
            .map(|e| e.key().clone())
            .collect();

        let mut failed = 0;
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                let _ = entry.tx.send(Err(DispatchError::UpstreamError { status: 502 }));
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
