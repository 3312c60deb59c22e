use http::StatusCode;
use std::fmt;

/// Breaker scope reported when every selectable worker's breaker rejected.
/// No different scope is reachable from such a dispatch, so the failure is
/// terminal for the request.
pub const SCOPE_ALL_WORKERS: &str = "all-workers";

/// Failure kinds surfaced by the dispatch pipeline.
///
/// Every pipeline stage returns success-or-`DispatchError`; the edge converts
/// the error to an HTTP response through [`DispatchError::status`] in one
/// place. No stage uses panics or sentinel values for control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Request line / header / body parsing failed at the edge.
    BadRequest(String),
    /// Request URL exceeded the configured maximum length.
    UriTooLong,
    /// Request body exceeded the configured maximum size.
    PayloadTooLarge,
    /// Rejected by the admission layer. Carries seconds until the window frees up.
    RateLimited { retry_after_secs: u64 },
    /// Rejected by the network-quality gate.
    PoorNetworkQuality(String),
    /// Circuit breaker for the selected scope is open.
    CircuitOpen { scope: String },
    /// No worker in the ready state.
    NoWorkers,
    /// The selected worker's send channel is full.
    WorkerSaturated { worker_id: String },
    /// The request deadline elapsed before a response arrived.
    Timeout,
    /// The worker answered with a 5xx status.
    UpstreamError { status: u16 },
    /// The fleet is rebooting; no worker has been ready past the rescue timeout.
    RescueMode,
    /// Malformed frame on the worker socket; the worker was dropped.
    Protocol(String),
    /// A pipeline stage failed without producing a response.
    Internal(String),
}

impl DispatchError {
    /// Client-visible status for this failure (the §7 mapping table).
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::UriTooLong => StatusCode::URI_TOO_LONG,
            DispatchError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            DispatchError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            DispatchError::PoorNetworkQuality(_) => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::NoWorkers => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::WorkerSaturated { .. } => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::UpstreamError { status } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            DispatchError::RescueMode => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::Protocol(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the retry coordinator may re-dispatch after this failure.
    /// The idempotency gate on the method is applied separately.
    ///
    /// `retry_scope` is the breaker scope the retry would run against. A
    /// `CircuitOpen` is retryable only toward a *different* scope: the
    /// scope that just rejected is certain to reject again until its open
    /// interval elapses, and [`SCOPE_ALL_WORKERS`] means no alternative
    /// scope exists at all.
    pub fn retryable(&self, retry_scope: &str) -> bool {
        match self {
            DispatchError::CircuitOpen { scope } => {
                scope != SCOPE_ALL_WORKERS && scope != retry_scope
            }
            DispatchError::NoWorkers
            | DispatchError::WorkerSaturated { .. }
            | DispatchError::Timeout
            | DispatchError::UpstreamError { .. } => true,
            _ => false,
        }
    }

    /// Whether the circuit breaker counts this failure against its scope.
    /// Client errors (4xx) and admission rejections do not trip the breaker.
    pub fn counts_for_breaker(&self) -> bool {
        match self {
            DispatchError::Timeout | DispatchError::WorkerSaturated { .. } => true,
            DispatchError::UpstreamError { status } => (500..600).contains(status),
            _ => false,
        }
    }

    /// Short stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::BadRequest(_) => "bad_request",
            DispatchError::UriTooLong => "uri_too_long",
            DispatchError::PayloadTooLarge => "payload_too_large",
            DispatchError::RateLimited { .. } => "rate_limited",
            DispatchError::PoorNetworkQuality(_) => "poor_network_quality",
            DispatchError::CircuitOpen { .. } => "circuit_open",
            DispatchError::NoWorkers => "no_workers",
            DispatchError::WorkerSaturated { .. } => "worker_saturated",
            DispatchError::Timeout => "timeout",
            DispatchError::UpstreamError { .. } => "upstream_error",
            DispatchError::RescueMode => "rescue_mode",
            DispatchError::Protocol(_) => "protocol",
            DispatchError::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            DispatchError::UriTooLong => write!(f, "request URI too long"),
            DispatchError::PayloadTooLarge => write!(f, "request payload too large"),
            DispatchError::RateLimited { retry_after_secs } => {
                write!(f, "rate limited, retry after {}s", retry_after_secs)
            }
            DispatchError::PoorNetworkQuality(reason) => {
                write!(f, "network quality below threshold: {}", reason)
            }
            DispatchError::CircuitOpen { scope } => write!(f, "circuit open for {}", scope),
            DispatchError::NoWorkers => write!(f, "no ready workers"),
            DispatchError::WorkerSaturated { worker_id } => {
                write!(f, "worker {} saturated", worker_id)
            }
            DispatchError::Timeout => write!(f, "dispatch timed out"),
            DispatchError::UpstreamError { status } => {
                write!(f, "worker responded with status {}", status)
            }
            DispatchError::RescueMode => write!(f, "fleet rebooting"),
            DispatchError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            DispatchError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for DispatchError {}
