use crate::config::{RouteConfig, RouteTargetConfig};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Route-registration failures.
#[derive(Debug)]
pub enum RouteError {
    /// Same (method, pattern) pair already registered.
    Duplicate { method: String, pattern: String },
    InvalidPattern(String),
    /// A fast route would shadow (or be shadowed by) a generic route.
    FastRouteConflict { method: String, path: String },
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::Duplicate { method, pattern } => {
                write!(f, "duplicate route {} {}", method, pattern)
            }
            RouteError::InvalidPattern(msg) => write!(f, "invalid route pattern: {}", msg),
            RouteError::FastRouteConflict { method, path } => {
                write!(f, "fast route {} {} conflicts with the generic router", method, path)
            }
        }
    }
}

impl std::error::Error for RouteError {}

/// Where a matched request is sent.
#[derive(Debug, Clone)]
pub enum RouteTarget {
    Worker,
    Static(PathBuf),
    Redirect { code: u16, url: String },
    Internal,
}

impl From<&RouteTargetConfig> for RouteTarget {
    fn from(config: &RouteTargetConfig) -> Self {
        match config {
            RouteTargetConfig::Worker => RouteTarget::Worker,
            RouteTargetConfig::Static { path } => RouteTarget::Static(PathBuf::from(path)),
            RouteTargetConfig::Redirect { code, url } => RouteTarget::Redirect {
                code: *code,
                url: url.clone(),
            },
            RouteTargetConfig::Internal => RouteTarget::Internal,
        }
    }
}

#[derive(Debug)]
enum Segment {
    Literal(String),
    Param(String),
}

/// Compiled pattern, ordered by matching priority.
#[derive(Debug)]
enum Pattern {
    Exact(String),
    Param {
        segments: Vec<Segment>,
        /// Bytes of pattern before the first parameter — the tiebreaker
        /// between overlapping parameterized routes.
        literal_prefix: usize,
    },
    Regex(regex::Regex),
    Wildcard,
}

/// A compiled route — the runtime object. The `RouteConfig` DTO is consumed
/// at registration and not retained.
#[derive(Debug)]
pub struct Route {
    /// Uppercase method, or `*` for any.
    pub method: String,
    pub pattern: String,
    compiled: Pattern,
    pub target: RouteTarget,
    registration: u64,
}

impl Route {
    fn method_matches(&self, method: &str) -> bool {
        self.method == "*" || self.method == method
    }
}

fn compile(pattern: &str, kind: &str) -> Result<Pattern, RouteError> {
    if kind == "regex" {
        // Anchor so a partial match cannot claim the whole path.
        let anchored = if pattern.starts_with('^') {
            pattern.to_string()
        } else {
            format!("^{}$", pattern.trim_end_matches('$'))
        };
        let re = regex::Regex::new(&anchored)
            .map_err(|e| RouteError::InvalidPattern(e.to_string()))?;
        return Ok(Pattern::Regex(re));
    }

    if pattern == "*" {
        return Ok(Pattern::Wildcard);
    }

    if !pattern.starts_with('/') {
        return Err(RouteError::InvalidPattern(format!(
            "pattern must start with '/': {}",
            pattern
        )));
    }

    if pattern.contains(':') {
        let mut segments = Vec::new();
        let mut literal_prefix = 0usize;
        let mut counting = true;
        for part in pattern.split('/').skip(1) {
            if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    return Err(RouteError::InvalidPattern(format!(
                        "empty parameter name in {}",
                        pattern
                    )));
                }
                counting = false;
                segments.push(Segment::Param(name.to_string()));
            } else {
                if counting {
                    literal_prefix += part.len() + 1;
                }
                segments.push(Segment::Literal(part.to_string()));
            }
        }
        return Ok(Pattern::Param {
            segments,
            literal_prefix,
        });
    }

    Ok(Pattern::Exact(pattern.to_string()))
}

/// Immutable, fully built matching table. Swapped atomically on changes so
/// concurrent matches always see one consistent snapshot.
pub struct RouterTable {
    /// Keyed `"METHOD path"`; wildcard-method routes keyed `"* path"`.
    exact: HashMap<String, Arc<Route>>,
    /// Longest literal prefix first, then registration order.
    params: Vec<Arc<Route>>,
    /// Registration order.
    regexes: Vec<Arc<Route>>,
    wildcards: Vec<Arc<Route>>,
}

impl RouterTable {
    fn build(routes: &[Arc<Route>]) -> Self {
        let mut exact = HashMap::new();
        let mut params: Vec<Arc<Route>> = Vec::new();
        let mut regexes = Vec::new();
        let mut wildcards = Vec::new();

        for route in routes {
            match &route.compiled {
                Pattern::Exact(path) => {
                    exact.insert(format!("{} {}", route.method, path), route.clone());
                }
                Pattern::Param { .. } => params.push(route.clone()),
                Pattern::Regex(_) => regexes.push(route.clone()),
                Pattern::Wildcard => wildcards.push(route.clone()),
            }
        }

        params.sort_by(|a, b| {
            let la = match &a.compiled {
                Pattern::Param { literal_prefix, .. } => *literal_prefix,
                _ => 0,
            };
            let lb = match &b.compiled {
                Pattern::Param { literal_prefix, .. } => *literal_prefix,
                _ => 0,
            };
            lb.cmp(&la).then(a.registration.cmp(&b.registration))
        });
        regexes.sort_by_key(|r| r.registration);
        wildcards.sort_by_key(|r| r.registration);

        Self {
            exact,
            params,
            regexes,
            wildcards,
        }
    }

    /// Match a decoded path. Query strings are not considered.
    pub fn match_route(
        &self,
        method: &str,
        path: &str,
    ) -> Option<(Arc<Route>, HashMap<String, String>)> {
        // 1. Exact literals.
        if let Some(route) = self
            .exact
            .get(&format!("{} {}", method, path))
            .or_else(|| self.exact.get(&format!("* {}", path)))
        {
            return Some((route.clone(), HashMap::new()));
        }

        // 2. Parameterized, longest literal prefix first.
        let path_segments: Vec<&str> = path.split('/').skip(1).collect();
        for route in &self.params {
            if !route.method_matches(method) {
                continue;
            }
            if let Pattern::Param { segments, .. } = &route.compiled {
                if let Some(params) = match_segments(segments, &path_segments) {
                    return Some((route.clone(), params));
                }
            }
        }

        // 3. Regex routes in registration order.
        for route in &self.regexes {
            if !route.method_matches(method) {
                continue;
            }
            if let Pattern::Regex(re) = &route.compiled {
                if let Some(caps) = re.captures(path) {
                    let mut params = HashMap::new();
                    for name in re.capture_names().flatten() {
                        if let Some(m) = caps.name(name) {
                            params.insert(name.to_string(), m.as_str().to_string());
                        }
                    }
                    for (i, m) in caps.iter().enumerate().skip(1) {
                        if let Some(m) = m {
                            params.entry(i.to_string()).or_insert_with(|| m.as_str().to_string());
                        }
                    }
                    return Some((route.clone(), params));
                }
            }
        }

        // 4. Catch-all only when nothing else matched.
        for route in &self.wildcards {
            if route.method_matches(method) {
                return Some((route.clone(), HashMap::new()));
            }
        }

        None
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
            && self.params.is_empty()
            && self.regexes.is_empty()
            && self.wildcards.is_empty()
    }
}

fn match_segments(segments: &[Segment], path: &[&str]) -> Option<HashMap<String, String>> {
    if segments.len() != path.len() {
        return None;
    }
    let mut params = HashMap::new();
    for (segment, part) in segments.iter().zip(path) {
        match segment {
            Segment::Literal(lit) => {
                if lit != part {
                    return None;
                }
            }
            Segment::Param(name) => {
                params.insert(name.clone(), (*part).to_string());
            }
        }
    }
    Some(params)
}

/// The router: registration is additive and serialized; matching reads a
/// lock-free snapshot that is swapped whole on every change.
pub struct Router {
    registered: Mutex<Vec<Arc<Route>>>,
    table: ArcSwap<RouterTable>,
    seq: AtomicU64,
}

impl Default for Router {
    fn default() -> Self {
        Self {
            registered: Mutex::new(Vec::new()),
            table: ArcSwap::from_pointee(RouterTable::build(&[])),
            seq: AtomicU64::new(0),
        }
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one route. Fails with `Duplicate` on an exact
    /// (method, pattern) collision.
    pub fn register(&self, config: &RouteConfig) -> Result<(), RouteError> {
        let method = config.method.to_uppercase();
        let mut registered = self.registered.lock().unwrap();

        if registered
            .iter()
            .any(|r| r.method == method && r.pattern == config.pattern)
        {
            return Err(RouteError::Duplicate {
                method,
                pattern: config.pattern.clone(),
            });
        }

        let compiled = compile(&config.pattern, &config.kind)?;
        let route = Arc::new(Route {
            method,
            pattern: config.pattern.clone(),
            compiled,
            target: RouteTarget::from(&config.target),
            registration: self.seq.fetch_add(1, Ordering::Relaxed),
        });
        registered.push(route);
        self.table.store(Arc::new(RouterTable::build(&registered)));
        Ok(())
    }

    /// Merge a worker-claimed route (always a worker target). A pattern the
    /// worker already claimed is ignored — workers resync on reconnect.
    /// Returns `true` when the table changed.
    pub fn merge_worker_route(&self, method: &str, path: &str) -> bool {
        let config = RouteConfig {
            method: method.to_string(),
            pattern: path.to_string(),
            kind: "literal".to_string(),
            target: RouteTargetConfig::Worker,
        };
        match self.register(&config) {
            Ok(()) => true,
            Err(RouteError::Duplicate { .. }) => false,
            Err(e) => {
                tracing::warn!("router: worker route rejected, {}", e);
                false
            }
        }
    }

    /// Lock-free lookup against the current snapshot.
    pub fn match_route(
        &self,
        method: &str,
        path: &str,
    ) -> Option<(Arc<Route>, HashMap<String, String>)> {
        self.table.load().match_route(method, path)
    }

    /// Whether any generic route would claim this (method, path) — the
    /// fast-route conflict probe.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        self.table.load().match_route(method, path).is_some()
    }

    pub fn route_count(&self) -> usize {
        self.registered.lock().unwrap().len()
    }
}
