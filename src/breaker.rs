use crate::config::BreakerConfig;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Circuit breaker state machine: Closed → Open → HalfOpen → Closed/Open.
///
/// One breaker per scope. The default scope is the worker id, so an
/// unhealthy worker is isolated without affecting the rest of the fleet;
/// per-route scoping is available as an opt-in.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<ScopeBreaker>>,
    config: BreakerConfig,
}

struct ScopeBreaker {
    /// 0 = Closed, 1 = Open, 2 = HalfOpen.
    state: AtomicU8,
    /// Failures inside the rolling window (Closed state only).
    window: Mutex<FailureWindow>,
    /// When the breaker tripped to Open.
    opened_at: Mutex<Option<Instant>>,
    /// Probes currently in flight (HalfOpen state).
    probes_inflight: AtomicU32,
    /// Consecutive successes in HalfOpen.
    half_open_successes: AtomicU32,
    config: BreakerConfig,
}

struct FailureWindow {
    count: u32,
    first_at: Option<Instant>,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Result of checking the breaker before a dispatch.
pub enum BreakerCheck {
    /// Breaker is closed — proceed normally.
    Allowed,
    /// Breaker is half-open and a probe slot was acquired.
    Probe,
    /// Breaker is open (or all probe slots are taken) — reject immediately.
    Rejected,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Check whether a request against `scope` is allowed.
    pub fn check(&self, scope: &str) -> BreakerCheck {
        self.get_or_create(scope).check()
    }

    /// Record the outcome of a dispatch against `scope`.
    pub fn record_success(&self, scope: &str) {
        self.get_or_create(scope).record_success();
    }

    pub fn record_failure(&self, scope: &str) {
        self.get_or_create(scope).record_failure();
    }

    /// Whether `scope` is currently rejecting (for selection filtering).
    pub fn is_open(&self, scope: &str) -> bool {
        let breaker = self.get_or_create(scope);
        let state = breaker.state.load(Ordering::Acquire);
        if state == STATE_OPEN {
            let opened_at = breaker.opened_at.lock().unwrap();
            if let Some(at) = *opened_at {
                if at.elapsed() >= Duration::from_secs(breaker.config.open_duration_secs) {
                    return false; // Will transition to HalfOpen on next check().
                }
            }
            return true;
        }
        false
    }

    fn get_or_create(&self, scope: &str) -> Arc<ScopeBreaker> {
        // Fast path: scope already tracked — no allocation.
        if let Some(entry) = self.breakers.get(scope) {
            return entry.value().clone();
        }
        self.breakers
            .entry(scope.to_string())
            .or_insert_with(|| {
                Arc::new(ScopeBreaker {
                    state: AtomicU8::new(STATE_CLOSED),
                    window: Mutex::new(FailureWindow {
                        count: 0,
                        first_at: None,
                    }),
                    opened_at: Mutex::new(None),
                    probes_inflight: AtomicU32::new(0),
                    half_open_successes: AtomicU32::new(0),
                    config: self.config.clone(),
                })
            })
            .clone()
    }

    /// Free a half-open probe slot without recording an outcome — used when
    /// a probe was admitted but no worker was ever reached.
    pub fn release_probe(&self, scope: &str) {
        if let Some(entry) = self.breakers.get(scope) {
            if entry.state.load(Ordering::Acquire) == STATE_HALF_OPEN {
                entry.release_probe();
            }
        }
    }

    /// Drop breaker entries for scopes no longer in the active set.
    pub fn retain_scopes(&self, active: &std::collections::HashSet<String>) {
        self.breakers.retain(|k, _| active.contains(k));
    }
}

impl ScopeBreaker {
    fn check(&self) -> BreakerCheck {
        let state = self.state.load(Ordering::Acquire);
        match state {
            STATE_CLOSED => BreakerCheck::Allowed,
            STATE_OPEN => {
                let opened_at = self.opened_at.lock().unwrap();
                if let Some(at) = *opened_at {
                    if at.elapsed() >= Duration::from_secs(self.config.open_duration_secs) {
                        drop(opened_at);
                        // CAS to HalfOpen — only one caller wins the transition.
                        if self
                            .state
                            .compare_exchange(
                                STATE_OPEN,
                                STATE_HALF_OPEN,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            self.half_open_successes.store(0, Ordering::Relaxed);
                            self.probes_inflight.store(1, Ordering::Relaxed);
                            return BreakerCheck::Probe;
                        }
                    }
                }
                BreakerCheck::Rejected
            }
            STATE_HALF_OPEN => {
                // Bounded concurrent probes; the rest are rejected until a
                // slot frees up.
                let mut current = self.probes_inflight.load(Ordering::Acquire);
                loop {
                    if current >= self.config.probe_count {
                        return BreakerCheck::Rejected;
                    }
                    match self.probes_inflight.compare_exchange_weak(
                        current,
                        current + 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return BreakerCheck::Probe,
                        Err(observed) => current = observed,
                    }
                }
            }
            _ => BreakerCheck::Allowed,
        }
    }

    fn record_success(&self) {
        let state = self.state.load(Ordering::Acquire);
        match state {
            STATE_CLOSED => {
                let mut window = self.window.lock().unwrap();
                window.count = 0;
                window.first_at = None;
            }
            STATE_HALF_OPEN => {
                self.release_probe();
                let count = self.half_open_successes.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.probe_count {
                    self.state.store(STATE_CLOSED, Ordering::Release);
                    let mut window = self.window.lock().unwrap();
                    window.count = 0;
                    window.first_at = None;
                    tracing::info!(
                        "breaker: closed (recovered after {} probe successes)",
                        count
                    );
                }
            }
            _ => {}
        }
    }

    fn record_failure(&self) {
        let state = self.state.load(Ordering::Acquire);
        match state {
            STATE_CLOSED => {
                let tripped = {
                    let mut window = self.window.lock().unwrap();
                    let now = Instant::now();
                    let window_len = Duration::from_secs(self.config.window_secs);
                    match window.first_at {
                        Some(first) if now.duration_since(first) <= window_len => {
                            window.count += 1;
                        }
                        _ => {
                            // Window rolled over — this failure starts a new one.
                            window.count = 1;
                            window.first_at = Some(now);
                        }
                    }
                    window.count >= self.config.threshold
                };
                if tripped {
                    self.state.store(STATE_OPEN, Ordering::Release);
                    *self.opened_at.lock().unwrap() = Some(Instant::now());
                    tracing::warn!(
                        "breaker: opened (threshold {} reached within window)",
                        self.config.threshold
                    );
                }
            }
            STATE_HALF_OPEN => {
                // Any probe failure sends us back to Open with a fresh timer.
                self.release_probe();
                self.state.store(STATE_OPEN, Ordering::Release);
                *self.opened_at.lock().unwrap() = Some(Instant::now());
                self.half_open_successes.store(0, Ordering::Relaxed);
                tracing::warn!("breaker: re-opened (probe failed in half-open)");
            }
            _ => {}
        }
    }

    fn release_probe(&self) {
        let _ = self
            .probes_inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            threshold: 3,
            window_secs: 60,
            open_duration_secs: 3600,
            probe_count: 2,
            scope: "worker".to_string(),
        }
    }

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            open_duration_secs: 0,
            ..config()
        }
    }

    #[test]
    fn test_starts_closed() {
        let reg = BreakerRegistry::new(config());
        assert!(matches!(reg.check("w1"), BreakerCheck::Allowed));
        assert!(!reg.is_open("w1"));
    }

    #[test]
    fn test_trips_after_threshold_within_window() {
        let reg = BreakerRegistry::new(config());
        for _ in 0..3 {
            assert!(matches!(reg.check("w1"), BreakerCheck::Allowed));
            reg.record_failure("w1");
        }
        assert!(matches!(reg.check("w1"), BreakerCheck::Rejected));
        assert!(reg.is_open("w1"));
    }

    #[test]
    fn test_success_resets_window() {
        let reg = BreakerRegistry::new(config());
        reg.record_failure("w1");
        reg.record_failure("w1");
        reg.record_success("w1");
        reg.record_failure("w1");
        reg.record_failure("w1");
        assert!(matches!(reg.check("w1"), BreakerCheck::Allowed));
    }

    #[test]
    fn test_scopes_are_independent() {
        let reg = BreakerRegistry::new(config());
        for _ in 0..3 {
            reg.record_failure("w1");
        }
        assert!(matches!(reg.check("w1"), BreakerCheck::Rejected));
        assert!(matches!(reg.check("w2"), BreakerCheck::Allowed));
    }

    #[test]
    fn test_half_open_probe_budget() {
        let reg = BreakerRegistry::new(fast_config());
        for _ in 0..3 {
            reg.record_failure("w1");
        }
        std::thread::sleep(Duration::from_millis(10));

        // First check wins the Open→HalfOpen CAS and takes probe slot 1.
        assert!(matches!(reg.check("w1"), BreakerCheck::Probe));
        // Second concurrent probe allowed (probe_count = 2).
        assert!(matches!(reg.check("w1"), BreakerCheck::Probe));
        // Third exceeds the budget.
        assert!(matches!(reg.check("w1"), BreakerCheck::Rejected));
    }

    #[test]
    fn test_half_open_all_success_closes() {
        let reg = BreakerRegistry::new(fast_config());
        for _ in 0..3 {
            reg.record_failure("w1");
        }
        std::thread::sleep(Duration::from_millis(10));

        assert!(matches!(reg.check("w1"), BreakerCheck::Probe));
        reg.record_success("w1");
        assert!(matches!(reg.check("w1"), BreakerCheck::Probe));
        reg.record_success("w1");
        assert!(matches!(reg.check("w1"), BreakerCheck::Allowed));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let reg = BreakerRegistry::new(fast_config());
        for _ in 0..3 {
            reg.record_failure("w1");
        }
        std::thread::sleep(Duration::from_millis(10));

        assert!(matches!(reg.check("w1"), BreakerCheck::Probe));
        reg.record_failure("w1");
        // Back to Open; with open_duration=0 the next check becomes a fresh
        // probe, proving the Open round-trip happened.
        std::thread::sleep(Duration::from_millis(10));
        assert!(matches!(reg.check("w1"), BreakerCheck::Probe));
    }

    #[test]
    fn test_retain_scopes_drops_stale() {
        let reg = BreakerRegistry::new(config());
        reg.record_failure("w1");
        reg.record_failure("w2");
        let keep: std::collections::HashSet<String> = ["w2".to_string()].into_iter().collect();
        reg.retain_scopes(&keep);
        assert_eq!(reg.breakers.len(), 1);
        assert!(reg.breakers.get("w2").is_some());
    }
}
