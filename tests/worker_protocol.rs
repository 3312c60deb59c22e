//! End-to-end exercises of the edge against scripted in-process workers
//! speaking the real frame protocol over Unix-domain sockets.

use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::{mpsc, Notify};
use xypriss_edge::config::{BreakerConfig, EdgeConfig, IpcConfig, RateLimitRule, RetryConfig};
use xypriss_edge::error::DispatchError;
use xypriss_edge::ipc::{frame, Bridge, Frame, RequestTicket, WorkerReply};
use xypriss_edge::retry;
use xypriss_edge::server::{run_edge_server, Coordinator, EdgeState};

const MAX_FRAME: u32 = 100 * 1024 * 1024;

fn unique_sock() -> PathBuf {
    std::env::temp_dir().join(format!("xypriss-test-{}.sock", uuid::Uuid::new_v4()))
}

fn ticket(method: &str, path: &str) -> RequestTicket {
    RequestTicket {
        id: String::new(),
        method: method.to_string(),
        url: path.to_string(),
        headers: Vec::new(),
        query: String::new(),
        params: HashMap::new(),
        remote_addr: "9.9.9.9:1234".to_string(),
        local_addr: "127.0.0.1:4349".to_string(),
        body: Bytes::new(),
        deadline_ms: 0,
        retry_count: 0,
        trace: None,
    }
}

/// What a scripted worker does with each request frame.
#[derive(Clone, Copy)]
enum Mode {
    Ok,
    Status(u16),
    Delay(Duration),
}

/// Connect a scripted worker to the edge's IPC socket. Every frame kind it
/// sees is appended to `log`.
async fn spawn_worker(
    sock: &Path,
    id: &str,
    mode: Mode,
    log: Arc<Mutex<Vec<String>>>,
) -> tokio::task::JoinHandle<()> {
    let stream = UnixStream::connect(sock).await.expect("worker connect");
    let id = id.to_string();
    tokio::spawn(async move {
        let (mut rd, mut wr) = stream.into_split();
        frame::write_frame(
            &mut wr,
            &Frame::RegisterWorker {
                id: id.clone(),
                weight: None,
                capabilities: None,
                token: None,
            },
            MAX_FRAME,
        )
        .await
        .unwrap();

        while let Ok(Some(incoming)) = frame::read_frame(&mut rd, MAX_FRAME).await {
            log.lock().unwrap().push(incoming.kind().to_string());
            match incoming {
                Frame::Request { ticket } => {
                    let (status, body) = match mode {
                        Mode::Ok => (200, format!("ok from {}", id)),
                        Mode::Status(s) => (s, format!("status {} from {}", s, id)),
                        Mode::Delay(d) => {
                            tokio::time::sleep(d).await;
                            (200, format!("ok from {}", id))
                        }
                    };
                    let reply = WorkerReply {
                        id: ticket.id,
                        status,
                        headers: vec![("content-type".to_string(), "text/plain".to_string())],
                        body: Bytes::from(body),
                    };
                    frame::write_frame(&mut wr, &Frame::Response { reply }, MAX_FRAME)
                        .await
                        .unwrap();
                }
                Frame::Ping { seq } => {
                    frame::write_frame(&mut wr, &Frame::Pong { seq }, MAX_FRAME)
                        .await
                        .unwrap();
                }
                Frame::Shutdown => return,
                _ => {}
            }
        }
    })
}

/// Stand up a bare bridge listening on a fresh UDS.
fn start_bridge(sock: &Path, strategy: &str) -> (Arc<Bridge>, Arc<Notify>) {
    let (events_tx, mut events_rx) = mpsc::channel(64);
    // Keep the event channel drained so worker handshakes never block.
    tokio::spawn(async move { while events_rx.recv().await.is_some() {} });

    let ipc = IpcConfig {
        socket_path: sock.to_string_lossy().to_string(),
        ..IpcConfig::default()
    };
    let bridge = Bridge::new(ipc, strategy, BreakerConfig::default(), events_tx);
    let listener = Bridge::bind_uds(&sock.to_string_lossy()).expect("bind uds");
    let shutdown = Arc::new(Notify::new());
    tokio::spawn(bridge.clone().serve_uds(listener, shutdown.clone()));
    (bridge, shutdown)
}

async fn wait_ready(bridge: &Arc<Bridge>, count: usize) {
    for _ in 0..400 {
        if bridge.workers().ready_count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "expected {} ready workers, have {}",
        count,
        bridge.workers().ready_count()
    );
}

// ---------------------------------------------------------------------------
// Bridge-level scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_round_robin() {
    let sock = unique_sock();
    let (bridge, _shutdown) = start_bridge(&sock, "round-robin");
    let log = Arc::new(Mutex::new(Vec::new()));

    spawn_worker(&sock, "w1", Mode::Ok, log.clone()).await;
    spawn_worker(&sock, "w2", Mode::Ok, log.clone()).await;
    wait_ready(&bridge, 2).await;

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut bodies = Vec::new();
    for _ in 0..3 {
        let reply = bridge
            .dispatch(ticket("GET", "/a"), "/a", "key", deadline, &[])
            .await
            .expect("dispatch");
        assert_eq!(reply.status, 200);
        bodies.push(String::from_utf8_lossy(&reply.body).to_string());
    }

    // Round robin over the id-sorted set: w1, w2, w1.
    assert_eq!(bodies[0], "ok from w1");
    assert_eq!(bodies[1], "ok from w2");
    assert_eq!(bodies[2], "ok from w1");

    // Latency recorded for every completed request.
    let completed: u64 = bridge.workers().all().iter().map(|w| w.completed()).sum();
    assert_eq!(completed, 3);
}

#[tokio::test]
async fn retry_recovers_from_upstream_5xx() {
    let sock = unique_sock();
    let (bridge, _shutdown) = start_bridge(&sock, "round-robin");
    let log = Arc::new(Mutex::new(Vec::new()));

    // Id order decides rotation: "a-bad" is tried first.
    spawn_worker(&sock, "a-bad", Mode::Status(500), log.clone()).await;
    spawn_worker(&sock, "b-good", Mode::Ok, log.clone()).await;
    wait_ready(&bridge, 2).await;

    let config = RetryConfig {
        max: 2,
        base_delay_ms: 10,
        max_delay_ms: 50,
        jitter: 0.0,
    };
    let deadline = Instant::now() + Duration::from_secs(5);
    let reply = retry::dispatch_with_retry(
        &bridge,
        &config,
        &ticket("GET", "/b"),
        "/b",
        "key",
        deadline,
    )
    .await
    .expect("retried dispatch");

    assert_eq!(reply.status, 200);
    assert_eq!(String::from_utf8_lossy(&reply.body), "ok from b-good");
}

#[tokio::test]
async fn non_idempotent_5xx_passes_through() {
    let sock = unique_sock();
    let (bridge, _shutdown) = start_bridge(&sock, "round-robin");
    let log = Arc::new(Mutex::new(Vec::new()));

    spawn_worker(&sock, "a-bad", Mode::Status(502), log.clone()).await;
    spawn_worker(&sock, "b-good", Mode::Ok, log.clone()).await;
    wait_ready(&bridge, 2).await;

    let config = RetryConfig::default();
    let deadline = Instant::now() + Duration::from_secs(5);
    let reply = retry::dispatch_with_retry(
        &bridge,
        &config,
        &ticket("POST", "/b"),
        "/b",
        "key",
        deadline,
    )
    .await
    .expect("POST dispatch");

    // POST is not idempotent: the first worker's 502 is final.
    assert_eq!(reply.status, 502);
}

#[tokio::test]
async fn broadcast_reaches_each_ready_worker_once() {
    let sock = unique_sock();
    let (bridge, _shutdown) = start_bridge(&sock, "round-robin");

    let logs: Vec<Arc<Mutex<Vec<String>>>> =
        (0..3).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();
    for (i, log) in logs.iter().enumerate() {
        spawn_worker(&sock, &format!("w{}", i), Mode::Ok, log.clone()).await;
    }
    wait_ready(&bridge, 3).await;

    assert_eq!(bridge.broadcast(Frame::ForceGc), 3);
    tokio::time::sleep(Duration::from_millis(100)).await;

    for log in &logs {
        let count = log
            .lock()
            .unwrap()
            .iter()
            .filter(|k| k.as_str() == "force_gc")
            .count();
        assert_eq!(count, 1, "each ready worker sees the broadcast exactly once");
    }
}

#[tokio::test]
async fn unknown_response_id_is_dropped_without_disturbing_state() {
    let sock = unique_sock();
    let (bridge, _shutdown) = start_bridge(&sock, "round-robin");

    // A worker that first volunteers a response nobody asked for.
    let stream = UnixStream::connect(&sock).await.unwrap();
    let (mut rd, mut wr) = stream.into_split();
    frame::write_frame(
        &mut wr,
        &Frame::RegisterWorker {
            id: "noisy".to_string(),
            weight: None,
            capabilities: None,
            token: None,
        },
        MAX_FRAME,
    )
    .await
    .unwrap();
    frame::write_frame(
        &mut wr,
        &Frame::Response {
            reply: WorkerReply {
                id: "never-issued".to_string(),
                status: 200,
                headers: Vec::new(),
                body: Bytes::new(),
            },
        },
        MAX_FRAME,
    )
    .await
    .unwrap();

    // Then it behaves: answer the next request properly.
    tokio::spawn(async move {
        while let Ok(Some(incoming)) = frame::read_frame(&mut rd, MAX_FRAME).await {
            if let Frame::Request { ticket } = incoming {
                let reply = WorkerReply {
                    id: ticket.id,
                    status: 200,
                    headers: Vec::new(),
                    body: Bytes::from_static(b"fine"),
                };
                frame::write_frame(&mut wr, &Frame::Response { reply }, MAX_FRAME)
                    .await
                    .unwrap();
            }
        }
    });
    wait_ready(&bridge, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let deadline = Instant::now() + Duration::from_secs(5);
    let reply = bridge
        .dispatch(ticket("GET", "/x"), "/x", "key", deadline, &[])
        .await
        .expect("dispatch after stray response");
    assert_eq!(reply.status, 200);
    assert_eq!(bridge.pending_count(), 0);
}

#[tokio::test]
async fn graceful_drain_completes_inflight_requests() {
    let sock = unique_sock();
    let (bridge, _shutdown) = start_bridge(&sock, "round-robin");
    let log = Arc::new(Mutex::new(Vec::new()));

    spawn_worker(&sock, "w1", Mode::Delay(Duration::from_millis(200)), log.clone()).await;
    spawn_worker(&sock, "w2", Mode::Delay(Duration::from_millis(200)), log.clone()).await;
    wait_ready(&bridge, 2).await;

    let mut dispatches = Vec::new();
    for _ in 0..6 {
        let bridge = bridge.clone();
        dispatches.push(tokio::spawn(async move {
            let deadline = Instant::now() + Duration::from_secs(30);
            bridge
                .dispatch(ticket("GET", "/slow"), "/slow", "key", deadline, &[])
                .await
        }));
    }
    // Let every dispatch register its pending entry.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let drained = bridge.drain(Duration::from_secs(5)).await;
    assert_eq!(drained, 6, "all in-flight requests complete during drain");

    for handle in dispatches {
        let reply = handle.await.unwrap().expect("in-flight completes");
        assert_eq!(reply.status, 200);
    }

    // Draining workers are no longer selectable.
    let deadline = Instant::now() + Duration::from_millis(200);
    let err = bridge
        .dispatch(ticket("GET", "/slow"), "/slow", "key", deadline, &[])
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::NoWorkers);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let shutdowns = log
        .lock()
        .unwrap()
        .iter()
        .filter(|k| k.as_str() == "shutdown")
        .count();
    assert_eq!(shutdowns, 2, "both workers receive the shutdown frame");
}

#[tokio::test]
async fn tcp_upstream_with_token_handshake() {
    // The edge dials out to a remote worker endpoint; the remote registers
    // with the shared token.
    let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = remote.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = remote.accept().await.unwrap();
        let (mut rd, mut wr) = tokio::io::split(stream);
        frame::write_frame(
            &mut wr,
            &Frame::RegisterWorker {
                id: "remote-1".to_string(),
                weight: Some(2),
                capabilities: None,
                token: Some("sesame".to_string()),
            },
            MAX_FRAME,
        )
        .await
        .unwrap();
        while let Ok(Some(incoming)) = frame::read_frame(&mut rd, MAX_FRAME).await {
            if let Frame::Request { ticket } = incoming {
                let reply = WorkerReply {
                    id: ticket.id,
                    status: 200,
                    headers: Vec::new(),
                    body: Bytes::from_static(b"remote ok"),
                };
                frame::write_frame(&mut wr, &Frame::Response { reply }, MAX_FRAME)
                    .await
                    .unwrap();
            }
        }
    });

    let (events_tx, mut events_rx) = mpsc::channel(64);
    tokio::spawn(async move { while events_rx.recv().await.is_some() {} });
    let ipc = IpcConfig {
        socket_path: unique_sock().to_string_lossy().to_string(),
        upstreams: vec![remote_addr.to_string()],
        auth_token: Some("sesame".to_string()),
        ..IpcConfig::default()
    };
    let bridge = Bridge::new(ipc, "round-robin", BreakerConfig::default(), events_tx);
    let shutdown = Arc::new(Notify::new());
    bridge.connect_upstreams(&shutdown);

    wait_ready(&bridge, 1).await;
    let deadline = Instant::now() + Duration::from_secs(5);
    let reply = bridge
        .dispatch(ticket("GET", "/r"), "/r", "key", deadline, &[])
        .await
        .expect("remote dispatch");
    assert_eq!(String::from_utf8_lossy(&reply.body), "remote ok");
}

// ---------------------------------------------------------------------------
// Full HTTP edge scenarios
// ---------------------------------------------------------------------------

/// Start the full edge pipeline (HTTP listener + IPC) around `config`.
async fn start_edge(mut config: EdgeConfig) -> (SocketAddr, EdgeState, Arc<Notify>, PathBuf) {
    let sock = unique_sock();
    config.ipc.socket_path = sock.to_string_lossy().to_string();

    let (state, mut events) = EdgeState::new(config).expect("state");
    let config = state.config.load_full();

    let coordinator = Arc::new(Coordinator::new(&config).expect("coordinator"));
    for route in &config.routes {
        coordinator.register_route(route).expect("route");
    }
    for fast in &config.fast_routes {
        state
            .fast_routes
            .register(fast, &coordinator.primary().scope.router)
            .expect("fast route");
    }

    {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let xypriss_edge::ipc::BridgeEvent::RoutesSynced { routes, .. } = event {
                    for route in routes {
                        coordinator.register_worker_route(&route.method, &route.path);
                    }
                }
            }
        });
    }

    let uds = Bridge::bind_uds(&config.ipc.socket_path).expect("bind uds");
    let shutdown = Arc::new(Notify::new());
    tokio::spawn(state.bridge.clone().serve_uds(uds, shutdown.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let scope = coordinator.primary().scope.clone();
    tokio::spawn(run_edge_server(listener, state.clone(), scope, shutdown.clone()));

    (addr, state, shutdown, sock)
}

/// Minimal HTTP/1.1 client: one request per connection.
async fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
) -> (u16, HashMap<String, String>, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut request = format!("{} {} HTTP/1.1\r\nhost: test\r\nconnection: close\r\n", method, path);
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw).to_string();

    let (head, body) = text.split_once("\r\n\r\n").expect("response head");
    let mut lines = head.lines();
    let status: u16 = lines
        .next()
        .unwrap()
        .split_whitespace()
        .nth(1)
        .unwrap()
        .parse()
        .unwrap();
    let mut header_map = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            header_map.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    (status, header_map, body.to_string())
}

fn edge_config_with_route(path: &str) -> EdgeConfig {
    let mut config = EdgeConfig::default();
    config.routes.push(xypriss_edge::config::RouteConfig {
        method: "GET".to_string(),
        pattern: path.to_string(),
        kind: "literal".to_string(),
        target: xypriss_edge::config::RouteTargetConfig::Worker,
    });
    config
}

#[tokio::test]
async fn http_edge_dispatches_to_worker() {
    let (addr, state, _shutdown, sock) = start_edge(edge_config_with_route("/a")).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    spawn_worker(&sock, "w1", Mode::Ok, log).await;
    wait_ready(&state.bridge, 1).await;

    let (status, headers, body) = http_request(addr, "GET", "/a", &[]).await;
    assert_eq!(status, 200);
    assert_eq!(headers.get("content-type").unwrap(), "text/plain");
    assert_eq!(body, "ok from w1");

    // Unrouted path is a 404, not a dispatch.
    let (status, _, _) = http_request(addr, "GET", "/zzz", &[]).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn http_edge_rate_limits_with_headers() {
    let mut config = edge_config_with_route("/d");
    config.admission.rules.push(RateLimitRule {
        scope: "per_ip".to_string(),
        strategy: "sliding".to_string(),
        limit: 3,
        window_secs: 60,
        route: None,
    });
    let (addr, state, _shutdown, sock) = start_edge(config).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    spawn_worker(&sock, "w1", Mode::Ok, log).await;
    wait_ready(&state.bridge, 1).await;

    for i in 0..3 {
        let (status, _, _) = http_request(addr, "GET", "/d", &[]).await;
        assert_eq!(status, 200, "request {} under the limit", i);
    }
    for _ in 0..2 {
        let (status, headers, _) = http_request(addr, "GET", "/d", &[]).await;
        assert_eq!(status, 429);
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "3");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
        assert!(headers.contains_key("x-ratelimit-reset"));
        let retry_after: u64 = headers.get("retry-after").unwrap().parse().unwrap();
        assert!(retry_after >= 55, "window is 60s, nothing has aged out");
    }
}

#[tokio::test]
async fn http_edge_rescue_mode_response() {
    let (addr, state, _shutdown, _sock) = start_edge(edge_config_with_route("/a")).await;
    state.rescue.store(true, Ordering::Relaxed);

    let (status, headers, body) = http_request(addr, "GET", "/a", &[]).await;
    assert_eq!(status, 503);
    assert_eq!(headers.get("x-xypriss-rescue").unwrap(), "1");
    assert!(body.contains("rebooting"));
}

#[tokio::test]
async fn http_edge_url_length_and_redirect() {
    let mut config = edge_config_with_route("/a");
    config.server.max_url_length = 64;
    config.routes.push(xypriss_edge::config::RouteConfig {
        method: "GET".to_string(),
        pattern: "/old".to_string(),
        kind: "literal".to_string(),
        target: xypriss_edge::config::RouteTargetConfig::Redirect {
            code: 301,
            url: "/new".to_string(),
        },
    });
    let (addr, _state, _shutdown, _sock) = start_edge(config).await;

    let long_path = format!("/{}", "x".repeat(100));
    let (status, _, _) = http_request(addr, "GET", &long_path, &[]).await;
    assert_eq!(status, 414);

    let (status, headers, _) = http_request(addr, "GET", "/old", &[]).await;
    assert_eq!(status, 301);
    assert_eq!(headers.get("location").unwrap(), "/new");
}

#[tokio::test]
async fn worker_synced_routes_become_dispatchable() {
    let (addr, state, _shutdown, sock) = start_edge(EdgeConfig::default()).await;

    // Worker registers and claims /synced via sync_routes.
    let stream = UnixStream::connect(&sock).await.unwrap();
    let (mut rd, mut wr) = stream.into_split();
    frame::write_frame(
        &mut wr,
        &Frame::RegisterWorker {
            id: "routeful".to_string(),
            weight: None,
            capabilities: None,
            token: None,
        },
        MAX_FRAME,
    )
    .await
    .unwrap();
    frame::write_frame(
        &mut wr,
        &Frame::SyncRoutes {
            routes: vec![xypriss_edge::ipc::WorkerRoute {
                method: "GET".to_string(),
                path: "/synced".to_string(),
            }],
        },
        MAX_FRAME,
    )
    .await
    .unwrap();
    tokio::spawn(async move {
        while let Ok(Some(incoming)) = frame::read_frame(&mut rd, MAX_FRAME).await {
            if let Frame::Request { ticket } = incoming {
                let reply = WorkerReply {
                    id: ticket.id,
                    status: 200,
                    headers: Vec::new(),
                    body: Bytes::from_static(b"synced ok"),
                };
                frame::write_frame(&mut wr, &Frame::Response { reply }, MAX_FRAME)
                    .await
                    .unwrap();
            }
        }
    });
    wait_ready(&state.bridge, 1).await;

    // Give the event pump a beat to merge the route.
    let mut merged = false;
    for _ in 0..100 {
        let (status, _, body) = http_request(addr, "GET", "/synced", &[]).await;
        if status == 200 {
            assert_eq!(body, "synced ok");
            merged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(merged, "synced route never became dispatchable");
}
