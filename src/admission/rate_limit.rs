use crate::config::RateLimitRule;
use crate::ipc::worker::now_us;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Serializable bucket state for the external-store hook.
#[derive(Debug, Clone)]
pub enum BucketState {
    /// (window epoch index, count within it).
    Fixed { epoch: u64, count: u64 },
    /// Request timestamps (µs on the store's clock) inside the window.
    Sliding { stamps: Vec<u64> },
}

/// Optional externalized bucket storage. The default limiter keeps
/// everything in memory; deployments that need cross-process accounting
/// implement this pair.
pub trait BucketStore: Send + Sync {
    fn get(&self, key: &str) -> Option<BucketState>;
    fn put(&self, key: &str, bucket: BucketState, ttl_secs: u64);
}

/// Outcome of one rate-limit check, carrying what the 429/`X-RateLimit-*`
/// headers need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Seconds until the window resets.
    pub reset_secs: u64,
    /// Seconds a rejected caller should wait before retrying.
    pub retry_after_secs: u64,
}

struct FixedBucket {
    inner: Mutex<FixedInner>,
    last_access: AtomicU64,
}

struct FixedInner {
    epoch: u64,
    count: u64,
}

struct SlidingBucket {
    /// Deque of request timestamps (µs); entries older than the window are
    /// evicted on each touch.
    inner: Mutex<VecDeque<u64>>,
    last_access: AtomicU64,
}

/// Entries idle for this long are eligible for eviction.
const IDLE_EXPIRE_SECS: u64 = 300;

/// Keyed rate limiter with fixed-window and sliding-window accounting.
///
/// Buckets live in sharded concurrent maps; an absent bucket equals zero
/// usage. Under the entry cap the oldest buckets are force-evicted, so a
/// hot attacker key cannot pin unbounded memory.
pub struct RateLimiter {
    fixed: DashMap<String, Arc<FixedBucket>>,
    sliding: DashMap<String, Arc<SlidingBucket>>,
    max_buckets: usize,
    store: Option<Arc<dyn BucketStore>>,
}

impl RateLimiter {
    pub fn new(max_buckets: usize) -> Self {
        Self {
            fixed: DashMap::new(),
            sliding: DashMap::new(),
            max_buckets: max_buckets.max(1),
            store: None,
        }
    }

    /// Attach an external bucket store (spec hook); in-memory state becomes
    /// a write-through cache of it.
    pub fn with_store(mut self, store: Arc<dyn BucketStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Account one request against `key` under `rule`.
    pub fn check(&self, rule: &RateLimitRule, key: &str) -> Decision {
        self.check_at(rule, key, now_us())
    }

    /// Clock-injected variant for deterministic tests.
    pub fn check_at(&self, rule: &RateLimitRule, key: &str, now: u64) -> Decision {
        match rule.strategy.as_str() {
            "fixed" => self.check_fixed(rule, key, now),
            _ => self.check_sliding(rule, key, now),
        }
    }

    fn check_fixed(&self, rule: &RateLimitRule, key: &str, now: u64) -> Decision {
        let window_us = rule.window_secs * 1_000_000;
        let epoch = now / window_us;

        let bucket = if let Some(entry) = self.fixed.get(key) {
            entry.value().clone()
        } else {
            let seeded = self.store.as_ref().and_then(|s| s.get(key));
            self.fixed
                .entry(key.to_string())
                .or_insert_with(|| {
                    let (seed_epoch, seed_count) = match seeded {
                        Some(BucketState::Fixed { epoch, count }) => (epoch, count),
                        _ => (epoch, 0),
                    };
                    Arc::new(FixedBucket {
                        inner: Mutex::new(FixedInner {
                            epoch: seed_epoch,
                            count: seed_count,
                        }),
                        last_access: AtomicU64::new(now),
                    })
                })
                .clone()
        };
        bucket.last_access.store(now, Ordering::Relaxed);

        let mut inner = bucket.inner.lock().unwrap();
        if inner.epoch != epoch {
            inner.epoch = epoch;
            inner.count = 0;
        }

        let reset_us = (epoch + 1) * window_us - now;
        let reset_secs = reset_us.div_ceil(1_000_000);
        let decision = if inner.count < rule.limit {
            inner.count += 1;
            Decision {
                allowed: true,
                limit: rule.limit,
                remaining: rule.limit - inner.count,
                reset_secs,
                retry_after_secs: 0,
            }
        } else {
            Decision {
                allowed: false,
                limit: rule.limit,
                remaining: 0,
                reset_secs,
                retry_after_secs: reset_secs,
            }
        };

        if let Some(store) = &self.store {
            store.put(
                key,
                BucketState::Fixed {
                    epoch: inner.epoch,
                    count: inner.count,
                },
                rule.window_secs,
            );
        }
        decision
    }

    fn check_sliding(&self, rule: &RateLimitRule, key: &str, now: u64) -> Decision {
        let window_us = rule.window_secs * 1_000_000;

        let bucket = if let Some(entry) = self.sliding.get(key) {
            entry.value().clone()
        } else {
            let seeded = self.store.as_ref().and_then(|s| s.get(key));
            self.sliding
                .entry(key.to_string())
                .or_insert_with(|| {
                    let stamps = match seeded {
                        Some(BucketState::Sliding { stamps }) => VecDeque::from(stamps),
                        _ => VecDeque::new(),
                    };
                    Arc::new(SlidingBucket {
                        inner: Mutex::new(stamps),
                        last_access: AtomicU64::new(now),
                    })
                })
                .clone()
        };
        bucket.last_access.store(now, Ordering::Relaxed);

        let mut stamps = bucket.inner.lock().unwrap();
        while let Some(&front) = stamps.front() {
            if now.saturating_sub(front) >= window_us {
                stamps.pop_front();
            } else {
                break;
            }
        }

        let decision = if (stamps.len() as u64) < rule.limit {
            stamps.push_back(now);
            let oldest = *stamps.front().unwrap_or(&now);
            Decision {
                allowed: true,
                limit: rule.limit,
                remaining: rule.limit - stamps.len() as u64,
                reset_secs: (window_us - now.saturating_sub(oldest)).div_ceil(1_000_000),
                retry_after_secs: 0,
            }
        } else {
            // The window frees one slot when the oldest stamp ages out.
            let oldest = *stamps.front().unwrap_or(&now);
            let until_free = window_us - now.saturating_sub(oldest);
            let secs = until_free.div_ceil(1_000_000);
            Decision {
                allowed: false,
                limit: rule.limit,
                remaining: 0,
                reset_secs: secs,
                retry_after_secs: secs,
            }
        };

        if let Some(store) = &self.store {
            store.put(
                key,
                BucketState::Sliding {
                    stamps: stamps.iter().copied().collect(),
                },
                rule.window_secs,
            );
        }
        decision
    }

    /// Spawn the periodic eviction task. Call once after construction.
    pub fn start_gc(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                limiter.evict_stale();
            }
        });
    }

    /// Drop idle buckets; if still over the cap, force-evict the oldest.
    pub fn evict_stale(&self) {
        let now = now_us();
        let expire_us = IDLE_EXPIRE_SECS * 1_000_000;

        self.fixed
            .retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_us);
        self.sliding
            .retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_us);

        if self.fixed.len() > self.max_buckets {
            let overflow = self.fixed.len() - self.max_buckets;
            let mut ages: Vec<(String, u64)> = self
                .fixed
                .iter()
                .map(|r| {
                    let age = now.saturating_sub(r.value().last_access.load(Ordering::Relaxed));
                    (r.key().clone(), age)
                })
                .collect();
            ages.sort_unstable_by(|a, b| b.1.cmp(&a.1));
            for (key, _) in ages.into_iter().take(overflow) {
                self.fixed.remove(&key);
            }
        }

        if self.sliding.len() > self.max_buckets {
            let overflow = self.sliding.len() - self.max_buckets;
            let mut ages: Vec<(String, u64)> = self
                .sliding
                .iter()
                .map(|r| {
                    let age = now.saturating_sub(r.value().last_access.load(Ordering::Relaxed));
                    (r.key().clone(), age)
                })
                .collect();
            ages.sort_unstable_by(|a, b| b.1.cmp(&a.1));
            for (key, _) in ages.into_iter().take(overflow) {
                self.sliding.remove(&key);
            }
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.fixed.len() + self.sliding.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sliding_rule(limit: u64, window_secs: u64) -> RateLimitRule {
        RateLimitRule {
            scope: "per_ip".to_string(),
            strategy: "sliding".to_string(),
            limit,
            window_secs,
            route: None,
        }
    }

    fn fixed_rule(limit: u64, window_secs: u64) -> RateLimitRule {
        RateLimitRule {
            strategy: "fixed".to_string(),
            ..sliding_rule(limit, window_secs)
        }
    }

    const SEC: u64 = 1_000_000;

    #[test]
    fn test_sliding_window_burst() {
        // Scenario: 20/min sliding, 25 requests inside 10 s.
        let limiter = RateLimiter::new(1000);
        let rule = sliding_rule(20, 60);
        let base = 1_000 * SEC;

        let mut allowed = 0;
        let mut rejected = 0;
        let mut last = Decision {
            allowed: true,
            limit: 0,
            remaining: 0,
            reset_secs: 0,
            retry_after_secs: 0,
        };
        for i in 0..25u64 {
            // 25 evenly spaced requests over 10 s.
            let now = base + i * 10 * SEC / 25;
            last = limiter.check_at(&rule, "1.2.3.4", now);
            if last.allowed {
                allowed += 1;
            } else {
                rejected += 1;
            }
        }
        assert_eq!(allowed, 20);
        assert_eq!(rejected, 5);
        assert_eq!(last.remaining, 0);
        // Oldest stamp is ~10 s old, so the slot frees in ~50 s.
        assert!((49..=51).contains(&last.retry_after_secs), "{:?}", last);
    }

    #[test]
    fn test_sliding_window_slot_frees_as_oldest_ages_out() {
        let limiter = RateLimiter::new(1000);
        let rule = sliding_rule(2, 10);
        let base = 100 * SEC;

        assert!(limiter.check_at(&rule, "k", base).allowed);
        assert!(limiter.check_at(&rule, "k", base + SEC).allowed);
        assert!(!limiter.check_at(&rule, "k", base + 2 * SEC).allowed);
        // 10 s after the first stamp, one slot frees.
        assert!(limiter.check_at(&rule, "k", base + 10 * SEC).allowed);
        assert!(!limiter.check_at(&rule, "k", base + 10 * SEC + 1).allowed);
    }

    #[test]
    fn test_sliding_steady_state_rejection_fraction() {
        // Input rate 2× the limit → half rejected at steady state (±5%).
        let limiter = RateLimiter::new(1000);
        let rule = sliding_rule(50, 1);
        let mut allowed = 0u64;
        let total = 2_000u64;
        for i in 0..total {
            // 100 requests per second for 20 s.
            let now = SEC + i * SEC / 100;
            if limiter.check_at(&rule, "k", now).allowed {
                allowed += 1;
            }
        }
        let rejected_fraction = 1.0 - allowed as f64 / total as f64;
        assert!(
            (rejected_fraction - 0.5).abs() < 0.05,
            "rejected fraction {} outside ±5% of 0.5",
            rejected_fraction
        );
    }

    #[test]
    fn test_fixed_window_resets_at_epoch() {
        let limiter = RateLimiter::new(1000);
        let rule = fixed_rule(2, 10);

        let t0 = 5 * SEC;
        assert!(limiter.check_at(&rule, "k", t0).allowed);
        assert!(limiter.check_at(&rule, "k", t0 + 1).allowed);
        let d = limiter.check_at(&rule, "k", t0 + 2);
        assert!(!d.allowed);
        assert!(d.retry_after_secs <= 5);

        // Next epoch starts at 10 s.
        assert!(limiter.check_at(&rule, "k", 10 * SEC).allowed);
    }

    #[test]
    fn test_fixed_window_edge_burst_allowed() {
        // The documented fixed-window weakness: 2× limit across the boundary.
        let limiter = RateLimiter::new(1000);
        let rule = fixed_rule(5, 10);
        let mut allowed = 0;
        for i in 0..5 {
            if limiter.check_at(&rule, "k", 9 * SEC + i).allowed {
                allowed += 1;
            }
        }
        for i in 0..5 {
            if limiter.check_at(&rule, "k", 10 * SEC + i).allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[test]
    fn test_keys_independent() {
        let limiter = RateLimiter::new(1000);
        let rule = sliding_rule(1, 60);
        assert!(limiter.check_at(&rule, "a", SEC).allowed);
        assert!(!limiter.check_at(&rule, "a", SEC + 1).allowed);
        assert!(limiter.check_at(&rule, "b", SEC + 2).allowed);
    }

    #[test]
    fn test_remaining_counts_down() {
        let limiter = RateLimiter::new(1000);
        let rule = sliding_rule(3, 60);
        assert_eq!(limiter.check_at(&rule, "k", SEC).remaining, 2);
        assert_eq!(limiter.check_at(&rule, "k", SEC).remaining, 1);
        assert_eq!(limiter.check_at(&rule, "k", SEC).remaining, 0);
        assert_eq!(limiter.check_at(&rule, "k", SEC).remaining, 0);
    }

    #[test]
    fn test_force_evict_under_cap() {
        let limiter = RateLimiter::new(10);
        let rule = sliding_rule(5, 60);
        for i in 0..50 {
            limiter.check_at(&rule, &format!("key-{}", i), SEC + i);
        }
        assert_eq!(limiter.bucket_count(), 50);
        limiter.evict_stale();
        assert!(limiter.bucket_count() <= 10);
    }

    #[test]
    fn test_external_store_round_trip() {
        struct MapStore(Mutex<std::collections::HashMap<String, BucketState>>);
        impl BucketStore for MapStore {
            fn get(&self, key: &str) -> Option<BucketState> {
                self.0.lock().unwrap().get(key).cloned()
            }
            fn put(&self, key: &str, bucket: BucketState, _ttl_secs: u64) {
                self.0.lock().unwrap().insert(key.to_string(), bucket);
            }
        }

        let store = Arc::new(MapStore(Mutex::new(std::collections::HashMap::new())));
        let rule = sliding_rule(2, 60);

        // First limiter burns the budget and writes through.
        let limiter = RateLimiter::new(100).with_store(store.clone());
        assert!(limiter.check_at(&rule, "k", SEC).allowed);
        assert!(limiter.check_at(&rule, "k", SEC + 1).allowed);

        // A fresh limiter (new process) seeds from the store and rejects.
        let rebooted = RateLimiter::new(100).with_store(store);
        assert!(!rebooted.check_at(&rule, "k", SEC + 2).allowed);
    }
}
