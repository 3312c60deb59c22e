use crate::admission::{AdmissionOutcome, RateLimitInfo};
use crate::config::EdgeConfig;
use crate::error::DispatchError;
use crate::ipc::{RequestTicket, WorkerReply};
use crate::retry;
use crate::routing::{FastRoute, RouteTarget};
use crate::server::body::{full_body, BoxBody};
use crate::server::compress::maybe_compress;
use crate::server::multi::ListenerScope;
use crate::server::state::EdgeState;
use bytes::Bytes;
use http::header::{ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::Request;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Handle one request through the edge pipeline:
///
/// 1. LIMITS      — URL length, Content-Length precheck
/// 2. CLIENT      — trust-proxy resolution
/// 3. RESCUE      — fleet-rebooting short-circuit
/// 4. FAST ROUTE  — pre-registered hot paths (admission per entry option)
/// 5. ADMISSION   — rate limits + network-quality gate
/// 6. ROUTE       — generic table, dispatch by target
/// 7. COMPRESS    — negotiated response compression
/// 8. LOG         — access line + metrics
pub async fn handle_request(
    req: Request<Incoming>,
    state: EdgeState,
    scope: Arc<ListenerScope>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    close_after: bool,
) -> Result<Response<BoxBody>, hyper::Error> {
    let started = Instant::now();
    let config = state.config.load_full();

    let method = req.method().as_str().to_uppercase();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    let headers = req.headers().clone();
    let accept_encoding = headers
        .get(ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_owned());

    let resolved = state.trust.resolve_client(peer_addr.ip(), &headers);
    let client_ip = resolved.ip;

    metrics::gauge!("edge_http_requests_in_flight").increment(1.0);

    let mut response = pipeline(
        req, &state, &scope, &config, &method, &path, &query, &headers, client_ip, peer_addr,
        local_addr, started,
    )
    .await;

    // Keep-alive budget: the connection closes after this response once the
    // per-connection request cap is reached.
    if close_after {
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }

    response = maybe_compress(&config.compression, accept_encoding.as_deref(), response);

    let status = response.status().as_u16();
    let mut buf = itoa::Buffer::new();
    metrics::counter!(
        "edge_http_requests_total",
        "method" => method.clone(),
        "status_code" => buf.format(status).to_owned(),
    )
    .increment(1);
    metrics::histogram!("edge_http_request_duration_seconds")
        .record(started.elapsed().as_secs_f64());
    metrics::gauge!("edge_http_requests_in_flight").decrement(1.0);

    tracing::info!(
        client_ip = %client_ip,
        method = %method,
        path = %path,
        status,
        listener = %scope.name,
        latency_ms = %started.elapsed().as_millis(),
        "access"
    );

    Ok(response)
}

#[allow(clippy::too_many_arguments)]
async fn pipeline(
    req: Request<Incoming>,
    state: &EdgeState,
    scope: &Arc<ListenerScope>,
    config: &EdgeConfig,
    method: &str,
    path: &str,
    query: &str,
    headers: &HeaderMap,
    client_ip: std::net::IpAddr,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    started: Instant,
) -> Response<BoxBody> {
    // ---- Limits ----
    let url_len = path.len() + if query.is_empty() { 0 } else { query.len() + 1 };
    if url_len > config.server.max_url_length {
        return error_response(&DispatchError::UriTooLong);
    }
    if let Some(content_length) = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        if content_length > scope.max_body_bytes {
            return error_response(&DispatchError::PayloadTooLarge);
        }
    }

    // ---- Rescue mode ----
    if state.rescue.load(Ordering::Relaxed) {
        return error_response(&DispatchError::RescueMode);
    }

    let deadline = started + scope.timeout;
    let affinity_key = headers
        .get("x-route-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_owned())
        .unwrap_or_else(|| client_ip.to_string());

    // ---- Fast-route table, consulted before the generic router ----
    if let Some(fast) = state.fast_routes.lookup(method, path) {
        if !fast.skip_admission {
            match state.admission.admit(client_ip, path, None, headers) {
                AdmissionOutcome::Allowed(_) => {}
                AdmissionOutcome::RateLimited(info) => return rate_limited_response(info),
                AdmissionOutcome::PoorQuality(reason) => {
                    return error_response(&DispatchError::PoorNetworkQuality(reason));
                }
            }
        }
        return handle_fast_route(
            req, state, config, &fast, method, path, query, headers, peer_addr, local_addr,
            scope.max_body_bytes, deadline, &affinity_key,
        )
        .await;
    }

    // ---- Generic router ----
    let route_match = scope.router.match_route(method, path);
    let route_pattern = route_match.as_ref().map(|(r, _)| r.pattern.clone());

    // ---- Admission ----
    let limit_info = match state
        .admission
        .admit(client_ip, path, route_pattern.as_deref(), headers)
    {
        AdmissionOutcome::Allowed(info) => info,
        AdmissionOutcome::RateLimited(info) => return rate_limited_response(info),
        AdmissionOutcome::PoorQuality(reason) => {
            return error_response(&DispatchError::PoorNetworkQuality(reason));
        }
    };

    let mut response = match route_match {
        Some((route, params)) => match &route.target {
            RouteTarget::Worker => {
                dispatch_worker(
                    req,
                    state,
                    config,
                    &route.pattern,
                    params,
                    method,
                    path,
                    query,
                    headers,
                    peer_addr,
                    local_addr,
                    scope.max_body_bytes,
                    deadline,
                    &affinity_key,
                )
                .await
            }
            RouteTarget::Static(file) => serve_static(file).await,
            RouteTarget::Redirect { code, url } => redirect_response(*code, url),
            RouteTarget::Internal => internal_response(state),
        },
        None if config.server.worker_fallback => {
            // No route, but the application claims unrouted traffic.
            dispatch_worker(
                req,
                state,
                config,
                "_fallback",
                HashMap::new(),
                method,
                path,
                query,
                headers,
                peer_addr,
                local_addr,
                scope.max_body_bytes,
                deadline,
                &affinity_key,
            )
            .await
        }
        None => {
            debug!("edge: no route matched, method={}, path={}", method, path);
            not_found_response()
        }
    };

    if let Some(info) = limit_info {
        apply_rate_limit_headers(response.headers_mut(), &info);
    }
    response
}

/// A fast-route hit: serve from the entry's cache when fresh, otherwise
/// dispatch and fill it. Per-entry response headers are always applied.
#[allow(clippy::too_many_arguments)]
async fn handle_fast_route(
    req: Request<Incoming>,
    state: &EdgeState,
    config: &EdgeConfig,
    fast: &Arc<FastRoute>,
    method: &str,
    path: &str,
    query: &str,
    headers: &HeaderMap,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    max_body: u64,
    deadline: Instant,
    affinity_key: &str,
) -> Response<BoxBody> {
    metrics::counter!("edge_fast_route_hits_total").increment(1);

    if let Some(reply) = fast.cached() {
        let mut response = reply_to_response(reply);
        apply_extra_headers(response.headers_mut(), &fast.headers);
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-xypriss-cache"), HeaderValue::from_static("hit"));
        return response;
    }

    let body = match read_body(req.into_body(), max_body).await {
        Ok(b) => b,
        Err(err) => return error_response(&err),
    };
    let ticket = build_ticket(
        method, path, query, headers, peer_addr, local_addr, body, HashMap::new(),
    );

    match retry::dispatch_with_retry(
        &state.bridge,
        &config.retry,
        &ticket,
        path,
        affinity_key,
        deadline,
    )
    .await
    {
        Ok(reply) => {
            if reply.status < 500 {
                fast.store(&reply);
            }
            let mut response = reply_to_response(reply);
            apply_extra_headers(response.headers_mut(), &fast.headers);
            response
        }
        Err(err) => error_response(&err),
    }
}

/// Worker-target dispatch: buffer the body (bounded), build the ticket,
/// run it through the retry coordinator, convert the outcome.
#[allow(clippy::too_many_arguments)]
async fn dispatch_worker(
    req: Request<Incoming>,
    state: &EdgeState,
    config: &EdgeConfig,
    route_pattern: &str,
    params: HashMap<String, String>,
    method: &str,
    path: &str,
    query: &str,
    headers: &HeaderMap,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    max_body: u64,
    deadline: Instant,
    affinity_key: &str,
) -> Response<BoxBody> {
    let body = match read_body(req.into_body(), max_body).await {
        Ok(b) => b,
        Err(err) => return error_response(&err),
    };

    let ticket = build_ticket(method, path, query, headers, peer_addr, local_addr, body, params);

    match retry::dispatch_with_retry(
        &state.bridge,
        &config.retry,
        &ticket,
        route_pattern,
        affinity_key,
        deadline,
    )
    .await
    {
        Ok(reply) => reply_to_response(reply),
        Err(err) => {
            warn!(
                "edge: dispatch failed, method={}, path={}, kind={}",
                method,
                path,
                err.kind()
            );
            error_response(&err)
        }
    }
}

/// Buffer the request body, enforcing the size cap even for chunked
/// requests without a Content-Length.
async fn read_body(body: Incoming, limit: u64) -> Result<Bytes, DispatchError> {
    match Limited::new(body, limit as usize).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => {
            if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                Err(DispatchError::PayloadTooLarge)
            } else {
                Err(DispatchError::BadRequest(e.to_string()))
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_ticket(
    method: &str,
    path: &str,
    query: &str,
    headers: &HeaderMap,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    body: Bytes,
    params: HashMap<String, String>,
) -> RequestTicket {
    // Header pairs in arrival order; per-name ordering matters for
    // multi-value headers.
    let header_pairs: Vec<(String, String)> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect();

    let trace = headers
        .get("traceparent")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_owned());

    RequestTicket {
        // Assigned by the bridge at dispatch so every attempt gets a fresh id.
        id: String::new(),
        method: method.to_string(),
        url: path.to_string(),
        headers: header_pairs,
        query: query.to_string(),
        params,
        remote_addr: peer_addr.to_string(),
        local_addr: local_addr.to_string(),
        body,
        deadline_ms: 0,
        retry_count: 0,
        trace,
    }
}

/// Convert a worker reply into a downstream response. Connection-level
/// headers from the worker are dropped; the edge owns framing.
fn reply_to_response(reply: WorkerReply) -> Response<BoxBody> {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in &reply.headers {
        let lower = name.to_ascii_lowercase();
        if matches!(
            lower.as_str(),
            "content-length" | "transfer-encoding" | "connection"
        ) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(full_body(reply.body))
        .unwrap_or_else(|_| error_response(&DispatchError::Internal("bad worker headers".into())))
}

/// The single failure→response mapping table.
pub fn error_response(err: &DispatchError) -> Response<BoxBody> {
    metrics::counter!("edge_http_errors_total", "kind" => err.kind()).increment(1);

    let mut builder = Response::builder()
        .status(err.status())
        .header(CONTENT_TYPE, "application/json");

    match err {
        DispatchError::RescueMode => {
            builder = builder.header(HeaderName::from_static("x-xypriss-rescue"), "1");
            return builder
                .body(full_body(r#"{"error":"rebooting","detail":"worker fleet is restarting"}"#))
                .unwrap();
        }
        DispatchError::PoorNetworkQuality(reason) => {
            if let Ok(v) = HeaderValue::from_str(reason) {
                builder = builder.header(HeaderName::from_static("x-xypriss-reason"), v);
            }
        }
        DispatchError::RateLimited { retry_after_secs } => {
            builder = builder.header("retry-after", *retry_after_secs);
        }
        _ => {}
    }

    builder
        .body(full_body(format!(r#"{{"error":"{}"}}"#, err)))
        .unwrap()
}

fn rate_limited_response(info: RateLimitInfo) -> Response<BoxBody> {
    let mut response = error_response(&DispatchError::RateLimited {
        retry_after_secs: info.retry_after_secs,
    });
    apply_rate_limit_headers(response.headers_mut(), &info);
    response
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, info: &RateLimitInfo) {
    let set = |headers: &mut HeaderMap, name: &'static str, value: u64| {
        let mut buf = itoa::Buffer::new();
        if let Ok(v) = HeaderValue::from_str(buf.format(value)) {
            headers.insert(HeaderName::from_static(name), v);
        }
    };
    set(headers, "x-ratelimit-limit", info.limit);
    set(headers, "x-ratelimit-remaining", info.remaining);
    set(headers, "x-ratelimit-reset", info.reset_secs);
}

fn apply_extra_headers(headers: &mut HeaderMap, extra: &[(String, String)]) {
    for (name, value) in extra {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(n, v);
        }
    }
}

fn not_found_response() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(r#"{"error":"not found"}"#))
        .unwrap()
}

fn redirect_response(code: u16, url: &str) -> Response<BoxBody> {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::FOUND);
    Response::builder()
        .status(status)
        .header(
            LOCATION,
            HeaderValue::from_str(url).unwrap_or_else(|_| HeaderValue::from_static("/")),
        )
        .body(full_body(""))
        .unwrap()
}

/// Serve a configured static file. The path comes from the route table,
/// never from the request, so there is no traversal surface.
async fn serve_static(file: &std::path::Path) -> Response<BoxBody> {
    match tokio::fs::read(file).await {
        Ok(contents) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content_type_for(file))
            .body(full_body(contents))
            .unwrap(),
        Err(e) => {
            debug!("edge: static read failed, path={}, error={}", file.display(), e);
            not_found_response()
        }
    }
}

fn content_type_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("ico") => "image/x-icon",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}

/// The `Internal` route target: a point-in-time fleet summary.
fn internal_response(state: &EdgeState) -> Response<BoxBody> {
    let stats = state.bridge.stats();
    let body = serde_json::json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "workers_ready": stats.ready_workers,
        "in_flight": stats.total_active,
        "pending": state.bridge.pending_count(),
        "total_requests": state.bridge.total_requests(),
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(body.to_string()))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping_table() {
        let resp = error_response(&DispatchError::UriTooLong);
        assert_eq!(resp.status(), StatusCode::URI_TOO_LONG);

        let resp = error_response(&DispatchError::Timeout);
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);

        let resp = error_response(&DispatchError::NoWorkers);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_rescue_response_shape() {
        let resp = error_response(&DispatchError::RescueMode);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers().get("x-xypriss-rescue").unwrap(), "1");
    }

    #[test]
    fn test_rate_limited_headers() {
        let resp = rate_limited_response(RateLimitInfo {
            limit: 20,
            remaining: 0,
            reset_secs: 50,
            retry_after_secs: 50,
        });
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("x-ratelimit-limit").unwrap(), "20");
        assert_eq!(resp.headers().get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(resp.headers().get("x-ratelimit-reset").unwrap(), "50");
        assert_eq!(resp.headers().get("retry-after").unwrap(), "50");
    }

    #[test]
    fn test_reply_conversion_strips_connection_headers() {
        let reply = WorkerReply {
            id: "1".to_string(),
            status: 201,
            headers: vec![
                ("content-type".to_string(), "text/plain".to_string()),
                ("connection".to_string(), "keep-alive".to_string()),
                ("transfer-encoding".to_string(), "chunked".to_string()),
            ],
            body: Bytes::from_static(b"done"),
        };
        let resp = reply_to_response(reply);
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), "text/plain");
        assert!(resp.headers().get(CONNECTION).is_none());
        assert!(resp.headers().get("transfer-encoding").is_none());
    }

    #[test]
    fn test_redirect_response() {
        let resp = redirect_response(301, "/new-home");
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(resp.headers().get(LOCATION).unwrap(), "/new-home");
    }

    #[test]
    fn test_content_types() {
        use std::path::Path;
        assert_eq!(content_type_for(Path::new("a.html")), "text/html; charset=utf-8");
        assert_eq!(content_type_for(Path::new("a.json")), "application/json");
        assert_eq!(content_type_for(Path::new("a.bin")), "application/octet-stream");
    }
}
