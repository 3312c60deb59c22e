use crate::config::RetryConfig;
use crate::error::DispatchError;
use crate::ipc::{Bridge, RequestTicket, WorkerReply};
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::debug;

/// Methods safe to re-dispatch after a transient failure.
pub fn is_idempotent(method: &str) -> bool {
    matches!(method, "GET" | "HEAD" | "PUT" | "DELETE" | "OPTIONS")
}

/// Delay before retry attempt `n` (0-based): jittered exponential backoff,
/// `min(max_delay, base * 2^n) * (1 ± jitter)`.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = config
        .base_delay_ms
        .saturating_mul(1u64 << attempt.min(20))
        .min(config.max_delay_ms);
    let jitter = config.jitter.clamp(0.0, 1.0);
    let factor = if jitter > 0.0 {
        rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
    } else {
        1.0
    };
    Duration::from_secs_f64(exp as f64 / 1000.0 * factor)
}

/// Dispatch with bounded retries.
///
/// Retries apply only to idempotent methods and retryable failures, and
/// never extend the request deadline — an attempt whose backoff would
/// overrun the deadline is skipped and the last failure surfaces. A worker
/// that reported saturation is excluded from subsequent attempts.
///
/// A `CircuitOpen` is retried only toward a different breaker scope. The
/// route scope is fixed for the whole sequence and the bridge reports an
/// all-workers rejection under its own sentinel scope, so a rejection that
/// would repeat verbatim fails fast instead of burning backoff against the
/// deadline.
pub async fn dispatch_with_retry(
    bridge: &Bridge,
    config: &RetryConfig,
    ticket: &RequestTicket,
    route_scope: &str,
    affinity_key: &str,
    deadline: Instant,
) -> Result<WorkerReply, DispatchError> {
    let idempotent = is_idempotent(&ticket.method);
    let max_attempts = if idempotent { config.max } else { 0 };
    let mut tried: Vec<String> = Vec::new();
    let mut last_err: Option<DispatchError> = None;

    for attempt in 0..=max_attempts {
        if attempt > 0 {
            let delay = backoff_delay(config, attempt - 1);
            if Instant::now() + delay >= deadline {
                debug!(
                    "retry: backoff would exceed deadline, giving up after attempt {}",
                    attempt
                );
                break;
            }
            metrics::counter!("edge_retries_total").increment(1);
            tokio::time::sleep(delay).await;
        }

        let mut attempt_ticket = ticket.clone();
        attempt_ticket.retry_count = attempt;

        match bridge
            .dispatch(attempt_ticket, route_scope, affinity_key, deadline, &tried)
            .await
        {
            Ok(reply) => {
                // A worker 5xx is retryable for idempotent methods, bounded
                // by the same attempt budget; the final reply passes through.
                if (500..600).contains(&reply.status) && attempt < max_attempts {
                    debug!(
                        "retry: worker returned {}, attempt {}/{}",
                        reply.status, attempt, max_attempts
                    );
                    last_err = Some(DispatchError::UpstreamError {
                        status: reply.status,
                    });
                    continue;
                }
                return Ok(reply);
            }
            Err(err) => {
                if let DispatchError::WorkerSaturated { worker_id } = &err {
                    tried.push(worker_id.clone());
                }
                // The next attempt runs against the same route scope, so
                // that is what a CircuitOpen is measured against.
                let give_up = !err.retryable(route_scope) || attempt >= max_attempts;
                if give_up {
                    return Err(err);
                }
                debug!(
                    "retry: {} on attempt {}/{}, backing off",
                    err.kind(),
                    attempt,
                    max_attempts
                );
                last_err = Some(err);
            }
        }
    }

    Err(last_err.unwrap_or(DispatchError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, IpcConfig};
    use crate::ipc::frame::{self, Frame};
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn test_ticket(method: &str) -> RequestTicket {
        RequestTicket {
            id: String::new(),
            method: method.to_string(),
            url: "/c".to_string(),
            headers: Vec::new(),
            query: String::new(),
            params: HashMap::new(),
            remote_addr: "1.1.1.1:1".to_string(),
            local_addr: "127.0.0.1:4349".to_string(),
            body: Bytes::new(),
            deadline_ms: 0,
            retry_count: 0,
            trace: None,
        }
    }

    fn test_bridge(breaker: BreakerConfig) -> Arc<Bridge> {
        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        Bridge::new(IpcConfig::default(), "round-robin", breaker, tx)
    }

    /// Register an in-process worker that answers every request with
    /// `status`.
    async fn fake_worker(bridge: &Arc<Bridge>, id: &str, status: u16) {
        let (edge_side, worker_side) = tokio::io::duplex(64 * 1024);
        let b = bridge.clone();
        tokio::spawn(async move {
            b.handle_socket(edge_side, false).await;
        });
        let id = id.to_string();
        tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(worker_side);
            let max = 100 * 1024 * 1024;
            frame::write_frame(
                &mut wr,
                &Frame::RegisterWorker {
                    id,
                    weight: None,
                    capabilities: None,
                    token: None,
                },
                max,
            )
            .await
            .unwrap();
            while let Ok(Some(incoming)) = frame::read_frame(&mut rd, max).await {
                if let Frame::Request { ticket } = incoming {
                    let reply = WorkerReply {
                        id: ticket.id,
                        status,
                        headers: Vec::new(),
                        body: Bytes::new(),
                    };
                    frame::write_frame(&mut wr, &Frame::Response { reply }, max)
                        .await
                        .unwrap();
                }
            }
        });
        for _ in 0..200 {
            if bridge.workers().ready_count() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("worker never became ready");
    }

    #[test]
    fn test_idempotency_gate() {
        for m in ["GET", "HEAD", "PUT", "DELETE", "OPTIONS"] {
            assert!(is_idempotent(m), "{} should be idempotent", m);
        }
        for m in ["POST", "PATCH", "CONNECT"] {
            assert!(!is_idempotent(m), "{} should not be idempotent", m);
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig {
            max: 5,
            base_delay_ms: 50,
            max_delay_ms: 1_000,
            jitter: 0.0,
        };
        assert_eq!(backoff_delay(&config, 0), Duration::from_millis(50));
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(200));
        // 50 * 2^10 would be 51.2s; capped at 1s.
        assert_eq!(backoff_delay(&config, 10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let config = RetryConfig {
            max: 2,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: 0.25,
        };
        for _ in 0..1_000 {
            let d = backoff_delay(&config, 0);
            assert!(d >= Duration::from_millis(75), "delay {:?} below floor", d);
            assert!(d <= Duration::from_millis(125), "delay {:?} above ceiling", d);
        }
    }

    #[tokio::test]
    async fn test_non_idempotent_fails_fast() {
        let bridge = test_bridge(BreakerConfig::default());
        let config = RetryConfig::default();

        let started = Instant::now();
        let deadline = started + Duration::from_secs(5);
        let err = dispatch_with_retry(&bridge, &config, &test_ticket("POST"), "/c", "k", deadline)
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::NoWorkers);
        // No backoff was taken: a non-idempotent method gets one attempt.
        assert!(started.elapsed() < Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_same_scope_circuit_open_fails_fast() {
        // Route-scoped breaker, tripped by a single 5xx.
        let bridge = test_bridge(BreakerConfig {
            threshold: 1,
            scope: "route".to_string(),
            ..BreakerConfig::default()
        });
        fake_worker(&bridge, "w1", 500).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        let reply = bridge
            .dispatch(test_ticket("GET"), "/c", "k", deadline, &[])
            .await
            .unwrap();
        assert_eq!(reply.status, 500);

        // The route scope is open and identical on every attempt — the
        // coordinator must not sleep a single backoff against it.
        let config = RetryConfig {
            max: 2,
            base_delay_ms: 500,
            max_delay_ms: 1_000,
            jitter: 0.0,
        };
        let started = Instant::now();
        let err = dispatch_with_retry(&bridge, &config, &test_ticket("GET"), "/c", "k", deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::CircuitOpen { .. }));
        assert!(
            started.elapsed() < Duration::from_millis(100),
            "same-scope CircuitOpen burned backoff: {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn test_all_worker_breakers_open_fails_fast() {
        // Per-worker scope; the only worker's breaker opens after one 5xx,
        // so the next dispatch rejects with the exhausted-scopes sentinel.
        let bridge = test_bridge(BreakerConfig {
            threshold: 1,
            ..BreakerConfig::default()
        });
        fake_worker(&bridge, "w1", 500).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        let reply = bridge
            .dispatch(test_ticket("GET"), "/c", "k", deadline, &[])
            .await
            .unwrap();
        assert_eq!(reply.status, 500);

        let config = RetryConfig {
            max: 2,
            base_delay_ms: 500,
            max_delay_ms: 1_000,
            jitter: 0.0,
        };
        let started = Instant::now();
        let err = dispatch_with_retry(&bridge, &config, &test_ticket("GET"), "/c", "k", deadline)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::CircuitOpen {
                scope: crate::error::SCOPE_ALL_WORKERS.to_string(),
            }
        );
        assert!(
            started.elapsed() < Duration::from_millis(100),
            "exhausted-scope CircuitOpen burned backoff: {:?}",
            started.elapsed()
        );
    }
}
