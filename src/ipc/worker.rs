use crate::ipc::frame::Frame;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;

/// EWMA smoothing factor for per-worker latency.
const EWMA_ALPHA: f64 = 0.2;

/// Lifecycle of one worker connection.
///
/// `Handshaking` until a valid `register_worker` arrives; only `Ready`
/// workers are eligible for selection; `Draining` workers finish in-flight
/// requests but receive no new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Handshaking,
    Ready,
    Draining,
    Dead,
}

const STATE_HANDSHAKING: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_DRAINING: u8 = 2;
const STATE_DEAD: u8 = 3;

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            STATE_READY => WorkerState::Ready,
            STATE_DRAINING => WorkerState::Draining,
            STATE_DEAD => WorkerState::Dead,
            _ => WorkerState::Handshaking,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Handshaking => STATE_HANDSHAKING,
            WorkerState::Ready => STATE_READY,
            WorkerState::Draining => STATE_DRAINING,
            WorkerState::Dead => STATE_DEAD,
        }
    }
}

/// Per-worker connection state. Cheap to clone via `Arc`; all hot fields
/// are atomics so selection and accounting never take a lock.
pub struct WorkerConnection {
    id: Arc<str>,
    weight: u32,
    sender: mpsc::Sender<Frame>,
    state: AtomicU8,
    active_requests: AtomicUsize,
    completed_requests: AtomicU64,
    total_response_ns: AtomicU64,
    /// EWMA latency in ns, stored as f64 bits.
    ewma_latency_ns: AtomicU64,
    /// Set by the cluster manager when the worker exceeds its CPU target;
    /// halves the effective weight in selection.
    cpu_throttled: AtomicBool,
    last_heartbeat_us: AtomicU64,
}

impl WorkerConnection {
    pub fn new(id: &str, weight: u32, sender: mpsc::Sender<Frame>) -> Self {
        Self {
            id: Arc::from(id),
            weight: weight.max(1),
            sender,
            state: AtomicU8::new(STATE_HANDSHAKING),
            active_requests: AtomicUsize::new(0),
            completed_requests: AtomicU64::new(0),
            total_response_ns: AtomicU64::new(0),
            ewma_latency_ns: AtomicU64::new(0f64.to_bits()),
            cpu_throttled: AtomicBool::new(false),
            last_heartbeat_us: AtomicU64::new(now_us()),
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn id_arc(&self) -> Arc<str> {
        self.id.clone()
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Selection weight after the soft CPU penalty.
    pub fn effective_weight(&self) -> u32 {
        if self.cpu_throttled.load(Ordering::Relaxed) {
            (self.weight / 2).max(1)
        } else {
            self.weight
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_READY
    }

    /// Non-blocking enqueue onto the worker's outbound channel.
    /// A full channel is the backpressure signal — the caller converts it
    /// into `WorkerSaturated`.
    pub fn try_send(&self, frame: Frame) -> Result<(), mpsc::error::TrySendError<Frame>> {
        self.sender.try_send(frame)
    }

    /// Number of frames currently queued toward this worker.
    pub fn queue_depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn queue_capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn inc_active(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed_requests.load(Ordering::Relaxed)
    }

    /// Fold one completed-request latency into the moving estimate.
    pub fn record_latency(&self, elapsed_ns: u64) {
        self.completed_requests.fetch_add(1, Ordering::Relaxed);
        self.total_response_ns.fetch_add(elapsed_ns, Ordering::Relaxed);

        let current = f64::from_bits(self.ewma_latency_ns.load(Ordering::Relaxed));
        let updated = if current == 0.0 {
            elapsed_ns as f64
        } else {
            EWMA_ALPHA * elapsed_ns as f64 + (1.0 - EWMA_ALPHA) * current
        };
        self.ewma_latency_ns
            .store(updated.to_bits(), Ordering::Relaxed);
    }

    pub fn ewma_latency_ns(&self) -> f64 {
        f64::from_bits(self.ewma_latency_ns.load(Ordering::Relaxed))
    }

    pub fn set_cpu_throttled(&self, throttled: bool) {
        self.cpu_throttled.store(throttled, Ordering::Relaxed);
    }

    pub fn is_cpu_throttled(&self) -> bool {
        self.cpu_throttled.load(Ordering::Relaxed)
    }

    pub fn touch_heartbeat(&self) {
        self.last_heartbeat_us.store(now_us(), Ordering::Relaxed);
    }

    pub fn heartbeat_age(&self) -> std::time::Duration {
        let last = self.last_heartbeat_us.load(Ordering::Relaxed);
        std::time::Duration::from_micros(now_us().saturating_sub(last))
    }
}

impl std::fmt::Debug for WorkerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConnection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("active", &self.active())
            .finish()
    }
}

/// The live worker set. Readers take a lock-free snapshot; registration and
/// removal serialize through a small write lock and publish a new snapshot.
pub struct WorkerSet {
    snapshot: ArcSwap<Vec<Arc<WorkerConnection>>>,
    write_lock: Mutex<()>,
    /// Bumped on every membership change; balancers use it to detect
    /// that their derived state is stale.
    version: AtomicU64,
}

impl Default for WorkerSet {
    fn default() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
            version: AtomicU64::new(0),
        }
    }
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, worker: Arc<WorkerConnection>) {
        let _guard = self.write_lock.lock().unwrap();
        let mut next = (**self.snapshot.load()).clone();
        next.retain(|w| w.id() != worker.id());
        next.push(worker);
        next.sort_by(|a, b| a.id().cmp(b.id()));
        self.snapshot.store(Arc::new(next));
        self.version.fetch_add(1, Ordering::Release);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<WorkerConnection>> {
        let _guard = self.write_lock.lock().unwrap();
        let mut next = (**self.snapshot.load()).clone();
        let pos = next.iter().position(|w| w.id() == id)?;
        let removed = next.remove(pos);
        self.snapshot.store(Arc::new(next));
        self.version.fetch_add(1, Ordering::Release);
        Some(removed)
    }

    pub fn get(&self, id: &str) -> Option<Arc<WorkerConnection>> {
        self.snapshot.load().iter().find(|w| w.id() == id).cloned()
    }

    /// Full membership snapshot, any state.
    pub fn all(&self) -> Vec<Arc<WorkerConnection>> {
        self.snapshot.load().as_ref().clone()
    }

    /// Snapshot filtered to selectable workers.
    pub fn ready(&self) -> Vec<Arc<WorkerConnection>> {
        self.snapshot
            .load()
            .iter()
            .filter(|w| w.is_ready())
            .cloned()
            .collect()
    }

    pub fn ready_count(&self) -> usize {
        self.snapshot.load().iter().filter(|w| w.is_ready()).count()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Total in-flight requests across the set.
    pub fn total_active(&self) -> usize {
        self.snapshot.load().iter().map(|w| w.active()).sum()
    }

    /// Mark every live worker draining (shutdown path).
    pub fn drain_all(&self) {
        for worker in self.snapshot.load().iter() {
            if worker.state() != WorkerState::Dead {
                worker.set_state(WorkerState::Draining);
            }
        }
    }
}

/// Microseconds on a process-local monotonic clock.
pub(crate) fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: &str, weight: u32) -> Arc<WorkerConnection> {
        let (tx, _rx) = mpsc::channel(8);
        Arc::new(WorkerConnection::new(id, weight, tx))
    }

    #[test]
    fn test_only_ready_workers_selectable() {
        let set = WorkerSet::new();
        let a = worker("a", 1);
        let b = worker("b", 1);
        set.insert(a.clone());
        set.insert(b.clone());
        assert_eq!(set.ready_count(), 0);

        a.set_state(WorkerState::Ready);
        b.set_state(WorkerState::Ready);
        assert_eq!(set.ready_count(), 2);

        b.set_state(WorkerState::Draining);
        let ready = set.ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id(), "a");
    }

    #[test]
    fn test_insert_replaces_same_id() {
        let set = WorkerSet::new();
        set.insert(worker("a", 1));
        set.insert(worker("a", 5));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("a").unwrap().weight(), 5);
    }

    #[test]
    fn test_version_bumps_on_membership_change() {
        let set = WorkerSet::new();
        let v0 = set.version();
        set.insert(worker("a", 1));
        let v1 = set.version();
        assert!(v1 > v0);
        set.remove("a");
        assert!(set.version() > v1);
        // Removing an unknown id does not publish a new snapshot.
        let v2 = set.version();
        assert!(set.remove("missing").is_none());
        assert_eq!(set.version(), v2);
    }

    #[test]
    fn test_ewma_latency_converges() {
        let w = worker("a", 1);
        w.record_latency(100);
        assert_eq!(w.ewma_latency_ns(), 100.0);
        w.record_latency(200);
        // 0.2 * 200 + 0.8 * 100
        assert!((w.ewma_latency_ns() - 120.0).abs() < 1e-9);
        assert_eq!(w.completed(), 2);
    }

    #[test]
    fn test_effective_weight_halves_under_throttle() {
        let w = worker("a", 4);
        assert_eq!(w.effective_weight(), 4);
        w.set_cpu_throttled(true);
        assert_eq!(w.effective_weight(), 2);
        let w1 = worker("b", 1);
        w1.set_cpu_throttled(true);
        assert_eq!(w1.effective_weight(), 1);
    }

    #[test]
    fn test_queue_depth_tracks_sends() {
        let (tx, mut _rx) = mpsc::channel(4);
        let w = WorkerConnection::new("a", 1, tx);
        assert_eq!(w.queue_depth(), 0);
        w.try_send(Frame::ForceGc).unwrap();
        w.try_send(Frame::ForceGc).unwrap();
        assert_eq!(w.queue_depth(), 2);
        assert_eq!(w.queue_capacity(), 4);
    }
}
