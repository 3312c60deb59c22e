use crate::balance::WorkerBalancer;
use crate::breaker::{BreakerCheck, BreakerRegistry};
use crate::config::{BreakerConfig, IpcConfig};
use crate::error::DispatchError;
use crate::ipc::frame::{read_frame, write_frame, Frame, RequestTicket, WorkerReply, WorkerRoute};
use crate::ipc::pending::PendingTable;
use crate::ipc::worker::{WorkerConnection, WorkerSet, WorkerState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// Time a freshly connected socket has to produce `register_worker`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect backoff for outbound (TCP upstream) worker links.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);

/// Worker-set changes published to the rest of the system (router merge,
/// rescue clearing, cluster accounting) over a bounded channel — the bridge
/// holds no back-pointers into other components.
#[derive(Debug)]
pub enum BridgeEvent {
    WorkerReady { id: String },
    WorkerGone { id: String },
    RoutesSynced { worker_id: String, routes: Vec<WorkerRoute> },
}

/// The IPC bridge: owns the worker sockets, the pending-response table, and
/// the per-dispatch selection/breaker flow.
pub struct Bridge {
    workers: WorkerSet,
    pending: PendingTable,
    balancer: WorkerBalancer,
    breakers: BreakerRegistry,
    /// `true` when the breaker scope is per-route instead of per-worker.
    route_scoped_breaker: bool,
    ipc: IpcConfig,
    total_requests: AtomicU64,
    events: mpsc::Sender<BridgeEvent>,
}

impl Bridge {
    pub fn new(
        ipc: IpcConfig,
        strategy: &str,
        breaker: BreakerConfig,
        events: mpsc::Sender<BridgeEvent>,
    ) -> Arc<Self> {
        let route_scoped_breaker = breaker.scope == "route";
        Arc::new(Self {
            workers: WorkerSet::new(),
            pending: PendingTable::new(),
            balancer: WorkerBalancer::new(strategy),
            breakers: BreakerRegistry::new(breaker),
            route_scoped_breaker,
            ipc,
            total_requests: AtomicU64::new(0),
            events,
        })
    }

    pub fn workers(&self) -> &WorkerSet {
        &self.workers
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    // ---- Socket serving ----

    /// Bind the IPC socket. A stale socket file from a previous run is
    /// removed first; a real bind failure surfaces to the caller.
    pub fn bind_uds(path: &str) -> std::io::Result<UnixListener> {
        let _ = std::fs::remove_file(path);
        UnixListener::bind(path)
    }

    /// Accept worker connections on the Unix-domain socket until shutdown.
    pub async fn serve_uds(self: Arc<Self>, listener: UnixListener, shutdown: Arc<Notify>) {
        let path = self.ipc.socket_path.clone();
        info!("bridge: ipc listening, path={}", path);

        loop {
            let accepted = tokio::select! {
                result = listener.accept() => result,
                _ = shutdown.notified() => {
                    info!("bridge: ipc accept loop stopping");
                    let _ = std::fs::remove_file(&path);
                    return;
                }
            };

            match accepted {
                Ok((stream, _)) => {
                    let bridge = self.clone();
                    tokio::spawn(async move {
                        bridge.handle_socket(stream, false).await;
                    });
                }
                Err(e) => {
                    warn!("bridge: ipc accept failed, error={}", e);
                }
            }
        }
    }

    /// Maintain outbound links to remote workers (`ipc.upstreams`).
    /// Each address gets its own reconnect loop.
    pub fn connect_upstreams(self: &Arc<Self>, shutdown: &Arc<Notify>) {
        for addr in self.ipc.upstreams.clone() {
            let bridge = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    match tokio::net::TcpStream::connect(&addr).await {
                        Ok(stream) => {
                            info!("bridge: upstream connected, addr={}", addr);
                            bridge.clone().handle_socket(stream, true).await;
                            warn!("bridge: upstream link closed, addr={}", addr);
                        }
                        Err(e) => {
                            debug!("bridge: upstream connect failed, addr={}, error={}", addr, e);
                        }
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                        _ = shutdown.notified() => return,
                    }
                }
            });
        }
    }

    /// Drive one worker socket: handshake, writer loop, ping loop, reader
    /// loop, teardown. Generic over the stream so UDS and TCP links share
    /// one implementation.
    pub async fn handle_socket<S>(self: Arc<Self>, stream: S, require_token: bool)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let max_frame = self.ipc.max_frame_bytes;
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        // ---- Handshake: first frame must be register_worker ----
        let first = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut read_half, max_frame)).await
        {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                warn!("bridge: handshake failed, error={}", e);
                return;
            }
            Err(_) => {
                warn!("bridge: handshake timed out");
                return;
            }
        };

        let (worker_id, weight) = match first {
            Frame::RegisterWorker {
                id, weight, token, ..
            } => {
                if require_token && self.ipc.auth_token.is_some() && token != self.ipc.auth_token {
                    warn!("bridge: upstream register rejected, bad token, id={}", id);
                    return;
                }
                (id, weight.unwrap_or(1))
            }
            other => {
                warn!(
                    "bridge: expected register_worker, got {}, dropping connection",
                    other.kind()
                );
                return;
            }
        };

        let (tx, mut rx) = mpsc::channel::<Frame>(self.ipc.send_queue_capacity);
        let worker = Arc::new(WorkerConnection::new(&worker_id, weight, tx));
        worker.set_state(WorkerState::Ready);
        self.workers.insert(worker.clone());
        metrics::gauge!("edge_workers_ready").set(self.workers.ready_count() as f64);
        info!("bridge: worker registered, id={}, weight={}", worker_id, weight);

        let _ = self
            .events
            .send(BridgeEvent::WorkerReady {
                id: worker_id.clone(),
            })
            .await;

        // ---- Writer: sole consumer of the worker's send channel ----
        let writer_id = worker_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, &frame, max_frame).await {
                    warn!("bridge: write failed, worker={}, error={}", writer_id, e);
                    break;
                }
            }
        });

        // ---- Ping: liveness probe on a fixed cadence ----
        let ping_worker = worker.clone();
        let ping_interval = Duration::from_secs(self.ipc.ping_interval_secs.max(1));
        let ping_timeout = Duration::from_secs(self.ipc.ping_timeout_secs.max(1));
        let pinger = tokio::spawn(async move {
            let mut seq: u64 = 0;
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if ping_worker.state() == WorkerState::Dead {
                    return;
                }
                if ping_worker.heartbeat_age() > ping_timeout {
                    warn!(
                        "bridge: worker missed pong deadline, id={}",
                        ping_worker.id()
                    );
                    ping_worker.set_state(WorkerState::Dead);
                    return;
                }
                seq += 1;
                // Saturated channel: skip this ping, liveness rides the next one.
                let _ = ping_worker.try_send(Frame::Ping { seq });
            }
        });

        // ---- Reader: frame demultiplexer ----
        loop {
            if worker.state() == WorkerState::Dead {
                break;
            }
            match read_frame(&mut read_half, max_frame).await {
                Ok(Some(Frame::Response { reply })) => {
                    worker.touch_heartbeat();
                    if !self.pending.complete(reply.clone()) {
                        // Late or duplicate response; state is untouched.
                        debug!(
                            "bridge: response with unknown id dropped, worker={}, id={}",
                            worker.id(),
                            reply.id
                        );
                        metrics::counter!("edge_unknown_response_total").increment(1);
                    }
                }
                Ok(Some(Frame::Pong { .. })) => {
                    worker.touch_heartbeat();
                }
                Ok(Some(Frame::Ping { seq })) => {
                    worker.touch_heartbeat();
                    let _ = worker.try_send(Frame::Pong { seq });
                }
                Ok(Some(Frame::SyncRoutes { routes })) => {
                    worker.touch_heartbeat();
                    info!(
                        "bridge: routes synced, worker={}, count={}",
                        worker.id(),
                        routes.len()
                    );
                    let _ = self
                        .events
                        .send(BridgeEvent::RoutesSynced {
                            worker_id: worker.id().to_string(),
                            routes,
                        })
                        .await;
                }
                Ok(Some(Frame::RegisterWorker { id, .. })) => {
                    warn!(
                        "bridge: duplicate register_worker ignored, worker={}, id={}",
                        worker.id(),
                        id
                    );
                }
                Ok(Some(other)) => {
                    warn!(
                        "bridge: unexpected {} frame from worker={}, ignored",
                        other.kind(),
                        worker.id()
                    );
                }
                Ok(None) => break,
                Err(e) => {
                    // Framing violation: the connection is unrecoverable.
                    warn!("bridge: {} , worker={}, dropping", e, worker.id());
                    metrics::counter!("edge_protocol_errors_total").increment(1);
                    break;
                }
            }
        }

        // ---- Teardown ----
        worker.set_state(WorkerState::Dead);
        pinger.abort();
        self.workers.remove(worker.id());
        writer.abort();
        let failed = self.pending.fail_worker(worker.id());
        if failed > 0 {
            warn!(
                "bridge: resolved {} pending requests with upstream error, worker={}",
                failed,
                worker.id()
            );
        }
        metrics::gauge!("edge_workers_ready").set(self.workers.ready_count() as f64);
        info!("bridge: worker disconnected, id={}", worker.id());
        let _ = self
            .events
            .send(BridgeEvent::WorkerGone {
                id: worker.id().to_string(),
            })
            .await;
    }

    // ---- Dispatch ----

    /// Dispatch one request ticket to a worker and await the correlated
    /// reply up to `deadline`.
    ///
    /// `route_scope` keys the breaker when per-route scoping is configured.
    /// `affinity_key` feeds the hash strategy. `exclude` lists worker ids
    /// already tried in this retry sequence.
    pub async fn dispatch(
        &self,
        mut ticket: RequestTicket,
        route_scope: &str,
        affinity_key: &str,
        deadline: Instant,
        exclude: &[String],
    ) -> Result<WorkerReply, DispatchError> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("edge_dispatch_total").increment(1);

        // Route-scoped breaker gates before any worker is touched.
        let mut route_probe = false;
        if self.route_scoped_breaker {
            match self.breakers.check(route_scope) {
                BreakerCheck::Allowed => {}
                BreakerCheck::Probe => route_probe = true,
                BreakerCheck::Rejected => {
                    return Err(DispatchError::CircuitOpen {
                        scope: route_scope.to_string(),
                    });
                }
            }
        }

        let result = self
            .dispatch_inner(&mut ticket, affinity_key, deadline, exclude)
            .await;

        // Settle the breaker for whichever scope owns this dispatch.
        let scope_key = |worker_id: &str| -> String {
            if self.route_scoped_breaker {
                route_scope.to_string()
            } else {
                worker_id.to_string()
            }
        };

        match &result {
            Ok((reply, worker_id)) => {
                if (500..600).contains(&reply.status) {
                    self.breakers.record_failure(&scope_key(worker_id));
                } else {
                    self.breakers.record_success(&scope_key(worker_id));
                }
            }
            Err((err, worker_id)) => {
                metrics::counter!("edge_dispatch_failures_total", "kind" => err.kind())
                    .increment(1);
                match worker_id {
                    Some(id) if err.counts_for_breaker() => {
                        self.breakers.record_failure(&scope_key(id));
                    }
                    _ if route_probe => {
                        // Probe acquired but no worker was reached; free the
                        // slot without skewing the failure window.
                        self.breakers.release_probe(route_scope);
                    }
                    _ => {}
                }
            }
        }

        result.map(|(reply, _)| reply).map_err(|(err, _)| err)
    }

    /// Selection + send + await. Returns the worker id alongside the
    /// outcome so the caller can settle breaker state.
    async fn dispatch_inner(
        &self,
        ticket: &mut RequestTicket,
        affinity_key: &str,
        deadline: Instant,
        exclude: &[String],
    ) -> Result<(WorkerReply, String), (DispatchError, Option<String>)> {
        let set_version = self.workers.version();
        let mut candidates: Vec<_> = self
            .workers
            .ready()
            .into_iter()
            .filter(|w| !exclude.iter().any(|e| e == w.id()))
            .collect();

        if candidates.is_empty() {
            return Err((DispatchError::NoWorkers, None));
        }

        // Per-worker breaker scope: skip open workers during selection.
        let worker = if self.route_scoped_breaker {
            self.balancer
                .select(&candidates, affinity_key, set_version)
                .ok_or((DispatchError::NoWorkers, None))?
        } else {
            let mut rejected_any = false;
            let mut chosen = None;
            while !candidates.is_empty() {
                let candidate = match self.balancer.select(&candidates, affinity_key, set_version)
                {
                    Some(w) => w,
                    None => break,
                };
                match self.breakers.check(candidate.id()) {
                    BreakerCheck::Allowed | BreakerCheck::Probe => {
                        chosen = Some(candidate);
                        break;
                    }
                    BreakerCheck::Rejected => {
                        debug!("bridge: breaker open, skipping worker={}", candidate.id());
                        rejected_any = true;
                        candidates.retain(|w| w.id() != candidate.id());
                    }
                }
            }
            match chosen {
                Some(w) => w,
                None if rejected_any => {
                    // Every candidate's breaker rejected: report the
                    // exhausted-scopes sentinel so the retry coordinator
                    // fails fast instead of re-entering a certain rejection.
                    return Err((
                        DispatchError::CircuitOpen {
                            scope: crate::error::SCOPE_ALL_WORKERS.to_string(),
                        },
                        None,
                    ));
                }
                None => return Err((DispatchError::NoWorkers, None)),
            }
        };

        let worker_id = worker.id().to_string();

        ticket.id = self.pending.next_id();
        let remaining = deadline.saturating_duration_since(Instant::now());
        ticket.deadline_ms = remaining.as_millis() as u64;

        worker.inc_active();
        let rx = self.pending.register(&ticket.id, worker.id_arc());
        let ticket_id = ticket.id.clone();

        // Non-blocking send: a full channel is the backpressure signal, not
        // a suspension point.
        if let Err(e) = worker.try_send(Frame::Request {
            ticket: ticket.clone(),
        }) {
            self.pending.cancel(&ticket_id);
            worker.dec_active();
            return match e {
                mpsc::error::TrySendError::Full(_) => Err((
                    DispatchError::WorkerSaturated {
                        worker_id: worker_id.clone(),
                    },
                    Some(worker_id),
                )),
                // The worker is tearing down; counts as an upstream failure
                // so half-open probe slots are released.
                mpsc::error::TrySendError::Closed(_) => Err((
                    DispatchError::UpstreamError { status: 502 },
                    Some(worker_id),
                )),
            };
        }

        let started = Instant::now();
        match tokio::time::timeout_at(deadline.into(), rx).await {
            Ok(Ok(Ok(reply))) => {
                worker.dec_active();
                worker.record_latency(started.elapsed().as_nanos() as u64);
                Ok((reply, worker_id))
            }
            Ok(Ok(Err(err))) => {
                // Worker socket torn down while we were waiting.
                worker.dec_active();
                Err((err, Some(worker_id)))
            }
            Ok(Err(_)) => {
                worker.dec_active();
                Err((
                    DispatchError::Internal("pending entry dropped".to_string()),
                    Some(worker_id),
                ))
            }
            Err(_) => {
                // Deadline fired. The entry is removed now; a response that
                // arrives later is dropped by the reader loop.
                self.pending.cancel(&ticket_id);
                worker.dec_active();
                Err((DispatchError::Timeout, Some(worker_id)))
            }
        }
    }

    // ---- Broadcast ----

    /// Non-blocking fan-out to every ready worker. Saturated workers skip
    /// this message. Returns the number of workers reached.
    pub fn broadcast(&self, frame: Frame) -> usize {
        let mut sent = 0;
        for worker in self.workers.ready() {
            match worker.try_send(frame.clone()) {
                Ok(()) => sent += 1,
                Err(_) => {
                    warn!(
                        "bridge: broadcast skipped saturated worker, id={}, frame={}",
                        worker.id(),
                        frame.kind()
                    );
                    metrics::counter!("edge_broadcast_skipped_total").increment(1);
                }
            }
        }
        sent
    }

    // ---- Drain ----

    /// Mark every worker draining; no new dispatch will select them.
    pub fn begin_drain(&self) {
        self.workers.drain_all();
        metrics::gauge!("edge_workers_ready").set(0.0);
    }

    /// Wait until in-flight requests finish (or `timeout` elapses), then
    /// send `shutdown` to the fleet. Returns how many requests drained.
    pub async fn drain(&self, timeout: Duration) -> u64 {
        self.begin_drain();
        let inflight_at_start = self.pending.len() as u64;

        let deadline = Instant::now() + timeout;
        while !self.pending.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let drained = inflight_at_start - self.pending.len() as u64;
        metrics::counter!("drained_requests_total").increment(drained);

        for worker in self.workers.all() {
            let _ = worker.try_send(Frame::Shutdown);
        }
        info!(
            "bridge: drain complete, drained={}, abandoned={}",
            drained,
            self.pending.len()
        );
        drained
    }

    /// Point-in-time load sample for the autoscaler.
    pub fn stats(&self) -> BridgeStats {
        let workers = self.workers.all();
        let ready = workers.iter().filter(|w| w.is_ready()).count();
        let total_active = workers.iter().map(|w| w.active()).sum();
        let queue_depth: usize = workers.iter().map(|w| w.queue_depth()).sum();
        let capacity_per_worker = workers
            .first()
            .map(|w| w.queue_capacity())
            .unwrap_or(self.ipc.send_queue_capacity);
        let avg_latency_ms = if ready > 0 {
            workers
                .iter()
                .filter(|w| w.is_ready())
                .map(|w| w.ewma_latency_ns())
                .sum::<f64>()
                / ready as f64
                / 1_000_000.0
        } else {
            0.0
        };
        BridgeStats {
            ready_workers: ready,
            total_active,
            queue_depth,
            capacity_per_worker,
            avg_latency_ms,
        }
    }
}

/// One autoscaler sample of bridge load.
#[derive(Debug, Clone)]
pub struct BridgeStats {
    pub ready_workers: usize,
    pub total_active: usize,
    pub queue_depth: usize,
    pub capacity_per_worker: usize,
    pub avg_latency_ms: f64,
}
