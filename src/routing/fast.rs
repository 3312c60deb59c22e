use crate::config::FastRouteConfig;
use crate::ipc::WorkerReply;
use crate::routing::table::{RouteError, Router};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One pre-registered hot path.
pub struct FastRoute {
    pub method: String,
    pub path: String,
    /// When true, a hit bypasses the admission layer as well as the
    /// generic middleware. Off unless the entry opts in.
    pub skip_admission: bool,
    cache_ttl: Option<Duration>,
    /// Extra response headers added on a hit.
    pub headers: Vec<(String, String)>,
    cache: Mutex<Option<CachedReply>>,
}

struct CachedReply {
    stored_at: Instant,
    reply: WorkerReply,
}

impl FastRoute {
    /// Return the cached worker reply while it is fresh.
    pub fn cached(&self) -> Option<WorkerReply> {
        let ttl = self.cache_ttl?;
        let guard = self.cache.lock().unwrap();
        let entry = guard.as_ref()?;
        if entry.stored_at.elapsed() < ttl {
            Some(entry.reply.clone())
        } else {
            None
        }
    }

    /// Store a reply for future hits. No-op when caching is disabled.
    pub fn store(&self, reply: &WorkerReply) {
        if self.cache_ttl.is_none() {
            return;
        }
        *self.cache.lock().unwrap() = Some(CachedReply {
            stored_at: Instant::now(),
            reply: reply.clone(),
        });
    }
}

/// The fast-route table, consulted before the generic router. A hit skips
/// the generic matching and most middleware.
pub struct FastRouteEngine {
    entries: ArcSwap<HashMap<String, Arc<FastRoute>>>,
    write_lock: Mutex<()>,
}

impl Default for FastRouteEngine {
    fn default() -> Self {
        Self {
            entries: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }
}

impl FastRouteEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hot path. Fails when the generic router already matches
    /// the same (method, path) — the two tables must stay disjoint.
    pub fn register(&self, config: &FastRouteConfig, router: &Router) -> Result<(), RouteError> {
        let method = config.method.to_uppercase();
        if router.matches(&method, &config.path) {
            return Err(RouteError::FastRouteConflict {
                method,
                path: config.path.clone(),
            });
        }

        let _guard = self.write_lock.lock().unwrap();
        let key = format!("{} {}", method, config.path);
        let mut next = (**self.entries.load()).clone();
        if next.contains_key(&key) {
            return Err(RouteError::Duplicate {
                method,
                pattern: config.path.clone(),
            });
        }
        next.insert(
            key,
            Arc::new(FastRoute {
                method,
                path: config.path.clone(),
                skip_admission: config.skip_admission,
                cache_ttl: config.cache_ttl_secs.map(Duration::from_secs),
                headers: config.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                cache: Mutex::new(None),
            }),
        );
        self.entries.store(Arc::new(next));
        Ok(())
    }

    pub fn lookup(&self, method: &str, path: &str) -> Option<Arc<FastRoute>> {
        self.entries
            .load()
            .get(&format!("{} {}", method, path))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }
}
