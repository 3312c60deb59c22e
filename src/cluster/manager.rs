use crate::cluster::process;
use crate::config::ClusterConfig;
use crate::ipc::{Bridge, Frame, WorkerState};
use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{error, info, warn};

/// Restarts inside this window count against the budget.
const RESTART_WINDOW: Duration = Duration::from_secs(60);
/// A poisoned slot stays down this long before spawns resume.
const POISON_COOLDOWN: Duration = Duration::from_secs(300);
/// Consecutive over-cap RSS samples before the worker is recycled.
const RSS_CAP_STRIKES: u32 = 2;
/// How long `start()` waits for the pre-allocated fleet's ready gate.
const PREALLOCATE_GATE: Duration = Duration::from_secs(30);

/// Scaling directives from the autoscaler, over a bounded channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoscaleCommand {
    ScaleUp,
    ScaleDown,
}

/// Per-worker RSS reading published to the autoscaler each sampling tick.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    pub worker_id: String,
    pub rss_bytes: u64,
}

struct WorkerSlot {
    worker_id: String,
    child: Option<Child>,
    restarts: VecDeque<Instant>,
    poisoned_until: Option<Instant>,
    rss_strikes: u32,
    last_cpu_jiffies: Option<u64>,
    /// Set when we asked the worker to drain (cap breach or scale-down);
    /// the exit that follows is expected and the slot is retired.
    shutdown_sent_at: Option<Instant>,
    retiring: bool,
}

impl WorkerSlot {
    fn fresh() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            child: None,
            restarts: VecDeque::new(),
            poisoned_until: None,
            rss_strikes: 0,
            last_cpu_jiffies: None,
            shutdown_sent_at: None,
            retiring: false,
        }
    }
}

/// Drop restart timestamps that fell out of the budget window.
fn prune_restarts(restarts: &mut VecDeque<Instant>, now: Instant) {
    while let Some(&front) = restarts.front() {
        if now.duration_since(front) > RESTART_WINDOW {
            restarts.pop_front();
        } else {
            break;
        }
    }
}

/// Whether a crashed slot may respawn under the configured budget.
fn respawn_allowed(respawn: bool, restarts: &VecDeque<Instant>, budget: u32) -> bool {
    respawn && (restarts.len() as u32) < budget
}

/// Spawns, supervises, and recycles the worker fleet. Out-of-band from the
/// request path: the bridge learns about workers through their handshakes,
/// never from the manager directly.
pub struct ClusterManager {
    config: ClusterConfig,
    ipc_path: String,
    bridge: Arc<Bridge>,
    slots: Mutex<Vec<WorkerSlot>>,
    desired: AtomicUsize,
    resource_tx: mpsc::Sender<ResourceSample>,
    fleet_failed: Arc<Notify>,
}

impl ClusterManager {
    pub fn new(
        config: ClusterConfig,
        ipc_path: String,
        bridge: Arc<Bridge>,
        resource_tx: mpsc::Sender<ResourceSample>,
    ) -> Arc<Self> {
        let desired = config.workers;
        Arc::new(Self {
            config,
            ipc_path,
            bridge,
            slots: Mutex::new(Vec::new()),
            desired: AtomicUsize::new(desired),
            resource_tx,
            fleet_failed: Arc::new(Notify::new()),
        })
    }

    /// Notified when the fleet is unrecoverable (every slot poisoned with
    /// nothing running) — the host exits with code 3.
    pub fn fleet_failed(&self) -> Arc<Notify> {
        self.fleet_failed.clone()
    }

    pub fn desired(&self) -> usize {
        self.desired.load(Ordering::Relaxed)
    }

    /// Spawn the initial fleet. With `pre_allocate`, block on the ready
    /// gate so startup latency is deterministic.
    pub async fn start(&self) -> Result<()> {
        if self.config.entry_point.is_empty() {
            info!("cluster: no entry point configured, workers connect externally");
            return Ok(());
        }

        let count = self.desired();
        {
            let mut slots = self.slots.lock().await;
            for _ in 0..count {
                let mut slot = WorkerSlot::fresh();
                self.spawn_into(&mut slot)?;
                slots.push(slot);
            }
        }
        metrics::gauge!("edge_workers_desired").set(count as f64);

        if self.config.pre_allocate {
            let gate = Instant::now() + PREALLOCATE_GATE;
            while self.bridge.workers().ready_count() < count {
                if Instant::now() >= gate {
                    warn!(
                        "cluster: pre-allocate gate timed out, ready={}/{}",
                        self.bridge.workers().ready_count(),
                        count
                    );
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            info!(
                "cluster: pre-allocated fleet ready, workers={}",
                self.bridge.workers().ready_count()
            );
        }
        Ok(())
    }

    fn spawn_into(&self, slot: &mut WorkerSlot) -> Result<()> {
        let capabilities = serde_json::json!({
            "weight": 1,
            "max_memory_mb": self.config.max_memory_mb,
        });
        let child = process::spawn_worker(
            &self.config.entry_point,
            &self.config.args,
            &self.config.env,
            &slot.worker_id,
            &self.ipc_path,
            &capabilities,
        )?;
        slot.child = Some(child);
        slot.rss_strikes = 0;
        slot.last_cpu_jiffies = None;
        slot.shutdown_sent_at = None;
        Ok(())
    }

    /// Supervision loop: process status, resource caps, scaling commands.
    pub async fn run(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<AutoscaleCommand>,
        shutdown: Arc<Notify>,
    ) {
        if self.config.entry_point.is_empty() {
            // Nothing to supervise; still consume scale commands so the
            // channel never backs up.
            loop {
                tokio::select! {
                    command = commands.recv() => {
                        if command.is_none() {
                            shutdown.notified().await;
                            return;
                        }
                    }
                    _ = shutdown.notified() => return,
                }
            }
        }

        let interval = Duration::from_secs(self.config.mem_check_interval_secs.max(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.supervise().await;
                }
                command = commands.recv() => {
                    match command {
                        Some(AutoscaleCommand::ScaleUp) => {
                            let desired = self.desired.fetch_add(1, Ordering::Relaxed) + 1;
                            info!("cluster: scale up, desired={}", desired);
                            metrics::gauge!("edge_workers_desired").set(desired as f64);
                        }
                        Some(AutoscaleCommand::ScaleDown) => {
                            let _ = self.desired.fetch_update(
                                Ordering::Relaxed,
                                Ordering::Relaxed,
                                |v| (v > 1).then(|| v - 1),
                            );
                            let desired = self.desired();
                            info!("cluster: scale down, desired={}", desired);
                            metrics::gauge!("edge_workers_desired").set(desired as f64);
                        }
                        None => return,
                    }
                }
                _ = shutdown.notified() => return,
            }
        }
    }

    async fn supervise(&self) {
        let mut slots = self.slots.lock().await;
        let now = Instant::now();

        // ---- Reap exits and decide respawn/poison ----
        for slot in slots.iter_mut() {
            let Some(child) = slot.child.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    slot.child = None;
                    if slot.shutdown_sent_at.is_some() || slot.retiring {
                        info!(
                            "cluster: worker exited after shutdown, id={}, status={}",
                            slot.worker_id, status
                        );
                        continue;
                    }
                    warn!(
                        "cluster: worker exited unexpectedly, id={}, status={}",
                        slot.worker_id, status
                    );
                    prune_restarts(&mut slot.restarts, now);
                    if respawn_allowed(self.config.respawn, &slot.restarts, self.config.restart_budget)
                    {
                        slot.restarts.push_back(now);
                        slot.worker_id = uuid::Uuid::new_v4().to_string();
                        metrics::counter!("edge_worker_respawns_total").increment(1);
                        if let Err(e) = self.spawn_into(slot) {
                            error!("cluster: respawn failed, error={}", e);
                        }
                    } else {
                        slot.poisoned_until = Some(now + POISON_COOLDOWN);
                        metrics::counter!("edge_worker_poisoned_total").increment(1);
                        error!(
                            "cluster: restart budget exhausted, slot poisoned for {}s, id={}",
                            POISON_COOLDOWN.as_secs(),
                            slot.worker_id
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("cluster: wait failed, id={}, error={}", slot.worker_id, e),
            }
        }

        // ---- Poison cool-down expiry ----
        for slot in slots.iter_mut() {
            if let Some(until) = slot.poisoned_until {
                if now >= until {
                    info!("cluster: poison cooled down, slot re-enabled");
                    slot.poisoned_until = None;
                    if !slot.retiring {
                        slot.worker_id = uuid::Uuid::new_v4().to_string();
                        slot.restarts.clear();
                        if let Err(e) = self.spawn_into(slot) {
                            error!("cluster: post-cooldown spawn failed, error={}", e);
                        }
                    }
                }
            }
        }

        // ---- Reconcile with desired count ----
        let desired = self.desired();
        let occupied = slots.iter().filter(|s| !s.retiring).count();
        if occupied < desired {
            for _ in occupied..desired {
                let mut slot = WorkerSlot::fresh();
                match self.spawn_into(&mut slot) {
                    Ok(()) => slots.push(slot),
                    Err(e) => {
                        error!("cluster: scale-up spawn failed, error={}", e);
                        break;
                    }
                }
            }
        } else if occupied > desired {
            // Retire the newest non-retiring slot: drain, then shutdown.
            if let Some(slot) = slots.iter_mut().rev().find(|s| !s.retiring && s.child.is_some())
            {
                slot.retiring = true;
                slot.shutdown_sent_at = Some(now);
                if let Some(worker) = self.bridge.workers().get(&slot.worker_id) {
                    worker.set_state(WorkerState::Draining);
                    let _ = worker.try_send(Frame::Shutdown);
                }
                info!("cluster: retiring worker, id={}", slot.worker_id);
            }
        }

        // ---- Resource caps ----
        let interval_secs = self.config.mem_check_interval_secs.max(1);
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        for slot in slots.iter_mut() {
            let Some(child) = slot.child.as_mut() else {
                continue;
            };
            let Some(pid) = child.id() else { continue };

            // Kill when the shutdown grace expired without an exit.
            if let Some(sent_at) = slot.shutdown_sent_at {
                if now.duration_since(sent_at) >= grace {
                    warn!(
                        "cluster: shutdown grace expired, killing worker, id={}",
                        slot.worker_id
                    );
                    let _ = child.start_kill();
                    continue;
                }
            }

            if let Some(rss) = process::sample_rss_bytes(pid) {
                let _ = self.resource_tx.try_send(ResourceSample {
                    worker_id: slot.worker_id.clone(),
                    rss_bytes: rss,
                });
                metrics::gauge!("edge_worker_rss_bytes", "worker" => slot.worker_id.clone())
                    .set(rss as f64);

                if let Some(cap_mb) = self.config.max_memory_mb {
                    if rss > cap_mb * 1024 * 1024 {
                        slot.rss_strikes += 1;
                        if slot.rss_strikes >= RSS_CAP_STRIKES && slot.shutdown_sent_at.is_none() {
                            warn!(
                                "cluster: memory cap exceeded {} samples, recycling worker, id={}, rss_mb={}",
                                slot.rss_strikes,
                                slot.worker_id,
                                rss / (1024 * 1024)
                            );
                            slot.shutdown_sent_at = Some(now);
                            if let Some(worker) = self.bridge.workers().get(&slot.worker_id) {
                                worker.set_state(WorkerState::Draining);
                                let _ = worker.try_send(Frame::Shutdown);
                            }
                        }
                    } else {
                        slot.rss_strikes = 0;
                    }
                }
            }

            if let Some(cap_percent) = self.config.max_cpu_percent {
                if let Some(jiffies) = process::sample_cpu_jiffies(pid) {
                    if let Some(prev) = slot.last_cpu_jiffies {
                        let percent = process::cpu_percent(prev, jiffies, interval_secs);
                        // Soft signal only: the balancer de-prioritizes,
                        // nothing is enforced at the OS level.
                        if let Some(worker) = self.bridge.workers().get(&slot.worker_id) {
                            worker.set_cpu_throttled(percent > cap_percent as f64);
                        }
                    }
                    slot.last_cpu_jiffies = Some(jiffies);
                }
            }
        }

        // ---- Retired slots whose child is gone drop out ----
        slots.retain(|s| !(s.retiring && s.child.is_none()));

        // ---- Fleet failure: all poisoned, nothing running, no workers ----
        let any_alive = slots.iter().any(|s| s.child.is_some());
        let all_poisoned = !slots.is_empty() && slots.iter().all(|s| s.poisoned_until.is_some());
        if !any_alive && all_poisoned && self.bridge.workers().ready_count() == 0 {
            error!("cluster: worker fleet unrecoverable, operator intervention required");
            self.fleet_failed.notify_waiters();
        }
    }

    /// Terminate remaining children after the bridge drain is complete.
    pub async fn shutdown_fleet(&self) {
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let deadline = Instant::now() + grace;

        loop {
            {
                let mut slots = self.slots.lock().await;
                let mut all_gone = true;
                for slot in slots.iter_mut() {
                    if let Some(child) = slot.child.as_mut() {
                        match child.try_wait() {
                            Ok(Some(_)) => slot.child = None,
                            _ => all_gone = false,
                        }
                    }
                }
                if all_gone {
                    info!("cluster: all workers exited cleanly");
                    return;
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let mut slots = self.slots.lock().await;
        for slot in slots.iter_mut() {
            if let Some(child) = slot.child.as_mut() {
                warn!("cluster: killing worker after grace, id={}", slot.worker_id);
                let _ = child.start_kill();
            }
        }
    }
}

// Unused in release builds but handy for debugging slot state.
#[allow(dead_code)]
fn slot_summary(slots: &[WorkerSlot]) -> HashMap<&'static str, usize> {
    let mut summary = HashMap::new();
    summary.insert("running", slots.iter().filter(|s| s.child.is_some()).count());
    summary.insert(
        "poisoned",
        slots.iter().filter(|s| s.poisoned_until.is_some()).count(),
    );
    summary.insert("retiring", slots.iter().filter(|s| s.retiring).count());
    summary
}
