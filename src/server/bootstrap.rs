use crate::cluster::{Autoscaler, ClusterManager};
use crate::config::EdgeConfig;
use crate::ipc::{Bridge, BridgeEvent};
use crate::server::{self, Coordinator, EdgeState};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Unrecoverable startup/runtime failures, mapped to process exit codes.
#[derive(Debug)]
pub enum FatalError {
    /// Bad configuration — exit 1.
    Config(anyhow::Error),
    /// A listener or socket could not be bound — exit 2.
    Bind(anyhow::Error),
    /// The worker fleet is unrecoverable — exit 3.
    Fleet,
}

impl FatalError {
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalError::Config(_) => 1,
            FatalError::Bind(_) => 2,
            FatalError::Fleet => 3,
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalError::Config(e) => write!(f, "configuration error: {}", e),
            FatalError::Bind(e) => write!(f, "bind error: {}", e),
            FatalError::Fleet => write!(f, "worker fleet unrecoverable"),
        }
    }
}

/// Edge lifecycle: init → bind → spawn fleet → serve → drain → exit.
pub async fn run(config: EdgeConfig) -> Result<(), FatalError> {
    init_tracing();

    // Phase 1: state tree + route tables.
    let (state, mut events) = EdgeState::new(config).map_err(FatalError::Config)?;
    let config = state.config.load_full();

    let coordinator = Arc::new(Coordinator::new(&config).map_err(FatalError::Config)?);
    for route in &config.routes {
        coordinator
            .register_route(route)
            .map_err(|e| FatalError::Config(anyhow::anyhow!(e)))?;
    }
    for fast in &config.fast_routes {
        state
            .fast_routes
            .register(fast, &coordinator.primary().scope.router)
            .map_err(|e| FatalError::Config(anyhow::anyhow!(e)))?;
    }
    state.admission.start_gc();
    info!(
        "server: routes loaded, generic={}, fast={}",
        coordinator.total_routes(),
        state.fast_routes.len()
    );

    // Phase 2: bind every socket before any traffic or worker starts, so a
    // taken port fails fast with a distinct exit code.
    let uds = Bridge::bind_uds(&config.ipc.socket_path)
        .map_err(|e| FatalError::Bind(anyhow::anyhow!("ipc {}: {}", config.ipc.socket_path, e)))?;

    let mut edge_listeners = Vec::new();
    for child in coordinator.children() {
        let listener = TcpListener::bind(&child.addr)
            .await
            .map_err(|e| FatalError::Bind(anyhow::anyhow!("{}: {}", child.addr, e)))?;
        edge_listeners.push((listener, child.scope.clone()));
    }
    let status_listener = TcpListener::bind(&config.server.status_listen)
        .await
        .map_err(|e| {
            FatalError::Bind(anyhow::anyhow!("{}: {}", config.server.status_listen, e))
        })?;

    let shutdown = Arc::new(Notify::new());

    // Phase 3: IPC serving + outbound upstream links.
    tokio::spawn(state.bridge.clone().serve_uds(uds, shutdown.clone()));
    state.bridge.connect_upstreams(&shutdown);

    // Phase 4: worker fleet + autoscaler, talking over bounded channels.
    let (command_tx, command_rx) = mpsc::channel(16);
    let (resource_tx, resource_rx) = mpsc::channel(256);

    let manager = ClusterManager::new(
        config.cluster.clone(),
        config.ipc.socket_path.clone(),
        state.bridge.clone(),
        resource_tx,
    );
    let fleet_failed = manager.fleet_failed();
    manager.start().await.map_err(FatalError::Config)?;
    tokio::spawn(manager.clone().run(command_rx, shutdown.clone()));

    let autoscaler = Autoscaler::new(
        config.autoscaler.clone(),
        state.bridge.clone(),
        command_tx,
        state.rescue.clone(),
    );
    tokio::spawn(autoscaler.run(resource_rx, shutdown.clone()));

    // Phase 5: bridge event pump — worker-set updates flow here, not
    // through back-pointers.
    {
        let coordinator = coordinator.clone();
        let rescue = state.rescue.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    BridgeEvent::WorkerReady { id } => {
                        debug!("server: worker ready, id={}", id);
                        if rescue.swap(false, Ordering::Relaxed) {
                            info!("server: worker re-registered, rescue mode cleared");
                            metrics::gauge!("edge_rescue_mode").set(0.0);
                        }
                    }
                    BridgeEvent::RoutesSynced { worker_id, routes } => {
                        let mut merged = 0;
                        for route in &routes {
                            if coordinator.register_worker_route(&route.method, &route.path) {
                                merged += 1;
                            }
                        }
                        info!(
                            "server: worker routes merged, worker={}, merged={}/{}",
                            worker_id,
                            merged,
                            routes.len()
                        );
                    }
                    BridgeEvent::WorkerGone { id } => {
                        debug!("server: worker gone, id={}", id);
                    }
                }
            }
        });
    }

    // Phase 6: listeners.
    tokio::spawn(server::run_status_server(status_listener, state.clone()));

    let mut server_handles = Vec::new();
    for (listener, scope) in edge_listeners {
        server_handles.push(tokio::spawn(server::run_edge_server(
            listener,
            state.clone(),
            scope,
            shutdown.clone(),
        )));
    }

    info!(
        "server: edge started, listeners={}, workers_desired={}",
        server_handles.len(),
        manager.desired()
    );

    // Phase 7: block until a signal or an unrecoverable fleet.
    let fleet_broken = tokio::select! {
        _ = wait_for_signal() => false,
        _ = fleet_failed.notified() => {
            error!("server: fleet failure signalled, shutting down");
            true
        }
    };

    shutdown.notify_waiters();

    // Phase 8: graceful drain — existing requests run to completion (or
    // the request deadline), then workers get `shutdown` and are reaped.
    let drain_budget = Duration::from_secs(config.server.timeout_secs);
    let drained = state.bridge.drain(drain_budget).await;
    info!("server: drained {} in-flight requests", drained);
    manager.shutdown_fleet().await;

    for handle in server_handles {
        if let Err(e) = handle.await {
            error!("server: listener task error: {}", e);
        }
    }

    if fleet_broken {
        return Err(FatalError::Fleet);
    }
    info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    let result = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .try_init();

    // Already initialized (tests): drop the writer guard normally.
    if result.is_ok() {
        std::mem::forget(guard);
    }
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("server: received SIGINT, shutting down"),
        _ = terminate => info!("server: received SIGTERM, shutting down"),
    }
}
