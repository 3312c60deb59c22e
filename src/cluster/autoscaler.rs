use crate::cluster::manager::{AutoscaleCommand, ResourceSample};
use crate::cluster::process;
use crate::config::AutoscalerConfig;
use crate::ipc::{Bridge, Frame};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

/// RSS samples tracked per worker for the GC-hint heuristic.
const RSS_HISTORY: usize = 3;

/// Pure scaling decision from one load sample.
///
/// Order matters: memory pressure trumps load-based scale-up — a loaded but
/// memory-starved host must shed workers, not add them.
pub fn decide(
    config: &AutoscalerConfig,
    ready_workers: usize,
    total_active: usize,
    capacity_per_worker: usize,
    system_memory: Option<f64>,
) -> Option<AutoscaleCommand> {
    if ready_workers == 0 {
        return None;
    }

    if let Some(memory) = system_memory {
        if memory > config.critical_memory && ready_workers > config.min_workers {
            return Some(AutoscaleCommand::ScaleDown);
        }
    }

    let avg_per_worker = total_active as f64 / ready_workers as f64;
    let capacity = capacity_per_worker as f64;

    if avg_per_worker > config.up_threshold * capacity && ready_workers < config.max_workers {
        Some(AutoscaleCommand::ScaleUp)
    } else if avg_per_worker < config.down_threshold * capacity && ready_workers > config.min_workers
    {
        Some(AutoscaleCommand::ScaleDown)
    } else {
        None
    }
}

/// Whether the last `RSS_HISTORY` samples grew strictly monotonically.
fn rss_growing(history: &VecDeque<u64>) -> bool {
    if history.len() < RSS_HISTORY {
        return false;
    }
    history
        .iter()
        .zip(history.iter().skip(1))
        .all(|(a, b)| b > a)
}

/// Load observer: samples the bridge at a fixed cadence, issues scaling
/// commands (bounded channel, at most one per cooldown), broadcasts GC
/// hints, and flips rescue mode when the fleet is empty too long.
pub struct Autoscaler {
    config: AutoscalerConfig,
    bridge: Arc<Bridge>,
    commands: mpsc::Sender<AutoscaleCommand>,
    rescue: Arc<AtomicBool>,
}

impl Autoscaler {
    pub fn new(
        config: AutoscalerConfig,
        bridge: Arc<Bridge>,
        commands: mpsc::Sender<AutoscaleCommand>,
        rescue: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            bridge,
            commands,
            rescue,
        }
    }

    pub async fn run(
        self,
        mut resources: mpsc::Receiver<ResourceSample>,
        shutdown: Arc<Notify>,
    ) {
        let interval = Duration::from_secs(self.config.sample_interval_secs.max(1));
        let cooldown = Duration::from_secs(self.config.cooldown_secs);
        let rescue_after = Duration::from_secs(self.config.rescue_timeout_secs);

        let mut last_decision: Option<Instant> = None;
        let mut zero_ready_since: Option<Instant> = None;
        let mut rss_history: HashMap<String, VecDeque<u64>> = HashMap::new();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let stats = self.bridge.stats();
                    let now = Instant::now();

                    metrics::gauge!("edge_inflight_requests").set(stats.total_active as f64);
                    metrics::gauge!("edge_send_queue_depth").set(stats.queue_depth as f64);
                    metrics::gauge!("edge_avg_worker_latency_ms").set(stats.avg_latency_ms);

                    // ---- Rescue mode ----
                    if stats.ready_workers == 0 {
                        let since = *zero_ready_since.get_or_insert(now);
                        if self.config.rescue_enabled
                            && now.duration_since(since) >= rescue_after
                            && !self.rescue.load(Ordering::Relaxed)
                        {
                            warn!(
                                "autoscaler: no ready workers for {}s, entering rescue mode",
                                self.config.rescue_timeout_secs
                            );
                            self.rescue.store(true, Ordering::Relaxed);
                            metrics::gauge!("edge_rescue_mode").set(1.0);
                        }
                    } else {
                        zero_ready_since = None;
                        if self.rescue.swap(false, Ordering::Relaxed) {
                            info!("autoscaler: workers recovered, leaving rescue mode");
                            metrics::gauge!("edge_rescue_mode").set(0.0);
                        }
                    }

                    // Drop history for workers that left the set.
                    rss_history.retain(|id, _| self.bridge.workers().get(id).is_some());

                    // ---- Scaling (at most one decision per cooldown) ----
                    if !self.config.enabled {
                        continue;
                    }
                    let cooled = last_decision
                        .map(|at| now.duration_since(at) >= cooldown)
                        .unwrap_or(true);
                    if !cooled {
                        continue;
                    }

                    let command = decide(
                        &self.config,
                        stats.ready_workers,
                        stats.total_active,
                        stats.capacity_per_worker,
                        process::system_memory_usage(),
                    );
                    if let Some(command) = command {
                        info!("autoscaler: {:?}, ready={}, in_flight={}",
                            command, stats.ready_workers, stats.total_active);
                        metrics::counter!(
                            "edge_autoscale_decisions_total",
                            "direction" => match command {
                                AutoscaleCommand::ScaleUp => "up",
                                AutoscaleCommand::ScaleDown => "down",
                            },
                        )
                        .increment(1);
                        last_decision = Some(now);
                        if self.commands.try_send(command).is_err() {
                            warn!("autoscaler: command channel full, decision dropped");
                        }
                    }
                }

                sample = resources.recv() => {
                    let Some(sample) = sample else { return };
                    let history = rss_history
                        .entry(sample.worker_id.clone())
                        .or_default();
                    history.push_back(sample.rss_bytes);
                    while history.len() > RSS_HISTORY {
                        history.pop_front();
                    }
                    if rss_growing(history) {
                        info!(
                            "autoscaler: rss growing on worker={}, broadcasting gc hint",
                            sample.worker_id
                        );
                        metrics::counter!("edge_gc_hints_total").increment(1);
                        self.bridge.broadcast(Frame::ForceGc);
                        // Restart the observation so one trend yields one hint.
                        history.clear();
                    }
                }

                _ = shutdown.notified() => return,
            }
        }
    }
}
