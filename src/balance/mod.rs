pub mod hash;
pub mod least_connections;
pub mod least_latency;
pub mod round_robin;
pub mod weighted;

use crate::ipc::worker::WorkerConnection;
use hash::HashBalancer;
use least_connections::LeastConnectionsBalancer;
use least_latency::LeastLatencyBalancer;
use round_robin::RoundRobinBalancer;
use std::sync::Arc;
use weighted::WeightedBalancer;

/// Enum-based balancer — no trait objects, no dynamic dispatch.
///
/// Selection always operates on a ready-filtered snapshot provided by the
/// caller and never blocks on the worker-set lock.
pub enum WorkerBalancer {
    RoundRobin(RoundRobinBalancer),
    LeastConnections(LeastConnectionsBalancer),
    Weighted(WeightedBalancer),
    Hash(HashBalancer),
    LeastLatency(LeastLatencyBalancer),
}

impl WorkerBalancer {
    pub fn new(strategy: &str) -> Self {
        match strategy {
            "least-connections" => Self::LeastConnections(LeastConnectionsBalancer::new()),
            "weighted" => Self::Weighted(WeightedBalancer::new()),
            "hash" => Self::Hash(HashBalancer::new()),
            "least-latency" => Self::LeastLatency(LeastLatencyBalancer::new()),
            _ => Self::RoundRobin(RoundRobinBalancer::new()),
        }
    }

    /// Pick a worker from `ready`.
    ///
    /// `key` is the affinity key for the hash strategy (`X-Route-Key`
    /// header value, falling back to the remote address). `set_version`
    /// lets stateful strategies detect membership changes.
    pub fn select(
        &self,
        ready: &[Arc<WorkerConnection>],
        key: &str,
        set_version: u64,
    ) -> Option<Arc<WorkerConnection>> {
        match self {
            Self::RoundRobin(lb) => lb.do_select(ready),
            Self::LeastConnections(lb) => lb.do_select(ready),
            Self::Weighted(lb) => lb.do_select(ready, set_version),
            Self::Hash(lb) => lb.do_select(ready, key),
            Self::LeastLatency(lb) => lb.do_select(ready),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RoundRobin(_) => "round-robin",
            Self::LeastConnections(_) => "least-connections",
            Self::Weighted(_) => "weighted",
            Self::Hash(_) => "hash",
            Self::LeastLatency(_) => "least-latency",
        }
    }
}
