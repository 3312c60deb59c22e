pub mod body;
pub mod bootstrap;
pub mod compress;
mod handler;
pub mod multi;
pub mod runtime;
mod state;
pub mod trust_proxy;

pub use handler::handle_request;
pub use multi::{Coordinator, ListenerScope};
pub use state::EdgeState;
pub use trust_proxy::TrustedProxies;

use crate::server::body::{full_body, BoxBody};
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Run one edge listener with graceful shutdown.
///
/// When `shutdown` fires the server stops accepting and waits up to
/// `DRAIN_TIMEOUT` for in-flight connections to finish.
pub async fn run_edge_server(
    listener: TcpListener,
    state: EdgeState,
    scope: Arc<ListenerScope>,
    shutdown: Arc<Notify>,
) -> Result<()> {
    const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

    let local_addr = listener.local_addr()?;
    info!("server: listening, name={}, addr={}", scope.name, local_addr);

    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: {} stop accepting, draining...", scope.name);
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!("edge_connections_total", "status" => "accepted").increment(1);
                v
            }
            Err(e) => {
                error!("server: accept failed, name={}, error={}", scope.name, e);
                metrics::counter!("edge_connections_total", "status" => "error").increment(1);
                continue;
            }
        };

        metrics::gauge!("edge_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let scope = scope.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let config = state.config.load_full();
            let keep_alive = Duration::from_secs(config.server.keep_alive_secs);
            let max_requests = config.server.max_requests_per_connection;
            let http2 = config.server.http2;

            let io = TokioIo::new(stream);
            // Per-connection request budget; the response that reaches the
            // cap carries `connection: close`.
            let served = Arc::new(AtomicU64::new(0));
            let state_inner = state.clone();
            let scope_inner = scope.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state_inner.clone();
                let scope = scope_inner.clone();
                let n = served.fetch_add(1, Ordering::Relaxed) + 1;
                let close_after = n >= max_requests;
                async move {
                    handler::handle_request(req, state, scope, peer_addr, local_addr, close_after)
                        .await
                }
            });

            let result = if http2 {
                let mut builder = auto::Builder::new(TokioExecutor::new());
                builder
                    .http1()
                    .keep_alive(true)
                    .header_read_timeout(keep_alive);
                builder
                    .http2()
                    .keep_alive_interval(Some(Duration::from_secs(20)));
                builder.serve_connection_with_upgrades(io, svc).await
            } else {
                let mut builder = auto::Builder::new(TokioExecutor::new()).http1_only();
                builder
                    .http1()
                    .keep_alive(true)
                    .header_read_timeout(keep_alive);
                builder.serve_connection_with_upgrades(io, svc).await
            };

            if let Err(e) = result {
                if !e.to_string().contains("connection closed") {
                    error!(
                        "server: connection error, name={}, peer={}, error={}",
                        scope.name, peer_addr, e
                    );
                }
            }

            metrics::gauge!("edge_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    // Drain phase.
    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!(
            "server: {} waiting for {} connections to drain",
            scope.name, active
        );
        let drain = async {
            while active_conns.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(_) => info!("server: {} drained", scope.name),
            Err(_) => info!(
                "server: {} drain timeout, {} connections dropped",
                scope.name,
                active_conns.load(Ordering::Relaxed)
            ),
        }
    }

    Ok(())
}

/// The status/metrics listener: `/healthz`, `/status`, `/metrics`.
/// Internal-facing; also the resolution target for `Internal` routes.
pub async fn run_status_server(listener: TcpListener, state: EdgeState) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("server: status listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { handle_status(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: status connection error, error={}", e);
                }
            }
        });
    }
}

fn handle_status(
    req: Request<Incoming>,
    state: EdgeState,
) -> Result<hyper::Response<BoxBody>, hyper::Error> {
    let response = match req.uri().path() {
        "/healthz" => {
            let healthy = state.bridge.workers().ready_count() > 0;
            let status = if healthy { 200 } else { 503 };
            hyper::Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(full_body(format!(r#"{{"healthy":{}}}"#, healthy)))
                .unwrap()
        }
        "/status" => {
            let workers: Vec<serde_json::Value> = state
                .bridge
                .workers()
                .all()
                .iter()
                .map(|w| {
                    serde_json::json!({
                        "id": w.id(),
                        "state": format!("{:?}", w.state()),
                        "active": w.active(),
                        "completed": w.completed(),
                        "queue_depth": w.queue_depth(),
                        "ewma_latency_ms": w.ewma_latency_ns() / 1_000_000.0,
                        "cpu_throttled": w.is_cpu_throttled(),
                    })
                })
                .collect();
            let body = serde_json::json!({
                "uptime_secs": state.started_at.elapsed().as_secs(),
                "total_requests": state.bridge.total_requests(),
                "pending": state.bridge.pending_count(),
                "rescue": state.rescue.load(Ordering::Relaxed),
                "workers": workers,
            });
            hyper::Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body.to_string()))
                .unwrap()
        }
        "/metrics" => hyper::Response::builder()
            .status(200)
            .header("content-type", "text/plain; version=0.0.4")
            .body(full_body(state.metrics.render()))
            .unwrap(),
        _ => hyper::Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap(),
    };
    Ok(response)
}
