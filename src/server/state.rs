use crate::admission::AdmissionLayer;
use crate::config::EdgeConfig;
use crate::ipc::{Bridge, BridgeEvent};
use crate::metrics::Metrics;
use crate::routing::FastRouteEngine;
use crate::server::trust_proxy::TrustedProxies;
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Shared edge state, cheaply cloneable.
///
/// Ownership follows the component arena: the bridge owns sockets and the
/// pending table, the admission layer owns its buckets, each listener
/// scope owns its router snapshot. Config hot-updates publish a whole new
/// snapshot behind the `ArcSwap`; readers are lock-free.
#[derive(Clone)]
pub struct EdgeState {
    pub config: Arc<ArcSwap<EdgeConfig>>,
    pub bridge: Arc<Bridge>,
    pub fast_routes: Arc<FastRouteEngine>,
    pub admission: Arc<AdmissionLayer>,
    pub trust: Arc<TrustedProxies>,
    /// Set by the autoscaler when no worker has been ready past the rescue
    /// timeout; cleared on the next registration.
    pub rescue: Arc<AtomicBool>,
    pub metrics: Metrics,
    pub started_at: Instant,
}

impl EdgeState {
    /// Build the state tree. Returns the receiver half of the bridge event
    /// channel — the bootstrap owns the pump that reacts to worker-set
    /// changes.
    pub fn new(config: EdgeConfig) -> Result<(Self, mpsc::Receiver<BridgeEvent>)> {
        let trust = TrustedProxies::parse(&config.server.trust_proxy)?;

        let (events_tx, events_rx) = mpsc::channel(256);
        let bridge = Bridge::new(
            config.ipc.clone(),
            &config.cluster.strategy,
            config.breaker.clone(),
            events_tx,
        );

        let admission = Arc::new(AdmissionLayer::new(
            config.admission.clone(),
            config.network_quality.clone(),
        ));

        let metrics = Metrics::install();

        Ok((
            Self {
                config: Arc::new(ArcSwap::new(Arc::new(config))),
                bridge,
                fast_routes: Arc::new(FastRouteEngine::new()),
                admission,
                trust: Arc::new(trust),
                rescue: Arc::new(AtomicBool::new(false)),
                metrics,
                started_at: Instant::now(),
            },
            events_rx,
        ))
    }
}
