use crate::config::{EdgeConfig, RouteConfig};
use crate::routing::{RouteError, Router};
use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Everything a listener needs per request: its own router plus the
/// effective limits after overlay resolution.
pub struct ListenerScope {
    pub name: String,
    pub router: Arc<Router>,
    pub timeout: Duration,
    pub max_body_bytes: u64,
}

/// One listener managed by the coordinator.
pub struct ChildServer {
    pub addr: String,
    pub scope: Arc<ListenerScope>,
    /// Routes are assigned to the child with the longest matching prefix.
    prefix: String,
    /// Optional glob allow-list narrowing what the child accepts.
    allowed: Option<GlobSet>,
}

/// Multi-server coordinator: one process, N listeners, each with its own
/// route scope and config overlay. The primary listener owns prefix `/`
/// and absorbs everything the overlays do not claim.
pub struct Coordinator {
    children: Vec<ChildServer>,
}

impl Coordinator {
    pub fn new(config: &EdgeConfig) -> Result<Self> {
        let base = &config.server;
        let mut children = vec![ChildServer {
            addr: format!("{}:{}", base.host, base.port),
            scope: Arc::new(ListenerScope {
                name: "primary".to_string(),
                router: Arc::new(Router::new()),
                timeout: Duration::from_secs(base.timeout_secs),
                max_body_bytes: base.max_body_bytes,
            }),
            prefix: "/".to_string(),
            allowed: None,
        }];

        for overlay in &config.servers {
            let allowed = if overlay.allowed_routes.is_empty() {
                None
            } else {
                let mut builder = GlobSetBuilder::new();
                for pattern in &overlay.allowed_routes {
                    builder.add(Glob::new(pattern).map_err(|e| {
                        anyhow::anyhow!("server '{}': bad glob '{}': {}", overlay.name, pattern, e)
                    })?);
                }
                Some(builder.build()?)
            };

            let host = overlay.host.as_deref().unwrap_or(&base.host);
            children.push(ChildServer {
                addr: format!("{}:{}", host, overlay.port),
                scope: Arc::new(ListenerScope {
                    name: overlay.name.clone(),
                    router: Arc::new(Router::new()),
                    timeout: Duration::from_secs(
                        overlay.timeout_secs.unwrap_or(base.timeout_secs),
                    ),
                    max_body_bytes: overlay.max_body_bytes.unwrap_or(base.max_body_bytes),
                }),
                prefix: overlay.route_prefix.clone(),
                allowed,
            });
        }

        Ok(Self { children })
    }

    pub fn children(&self) -> &[ChildServer] {
        &self.children
    }

    pub fn primary(&self) -> &ChildServer {
        &self.children[0]
    }

    /// The child whose prefix best matches `pattern` — longest prefix wins.
    fn child_for(&self, pattern: &str) -> &ChildServer {
        self.children
            .iter()
            .filter(|c| pattern.starts_with(&c.prefix))
            .max_by_key(|c| c.prefix.len())
            // Non-path patterns ("*", bare regexes) land on the primary.
            .unwrap_or(&self.children[0])
    }

    /// Register a route against whichever child claims its prefix.
    /// Returns `false` when the route was dropped by the child's
    /// allow-list (a warning is logged).
    pub fn register_route(&self, route: &RouteConfig) -> Result<bool, RouteError> {
        let child = self.child_for(&route.pattern);
        if let Some(allowed) = &child.allowed {
            if !allowed.is_match(&route.pattern) {
                warn!(
                    "coordinator: route {} {} dropped, not in '{}' allow-list",
                    route.method, route.pattern, child.scope.name
                );
                return Ok(false);
            }
        }
        child.scope.router.register(route)?;
        Ok(true)
    }

    /// Merge a worker-claimed route into the matching child's router.
    pub fn register_worker_route(&self, method: &str, path: &str) -> bool {
        let child = self.child_for(path);
        if let Some(allowed) = &child.allowed {
            if !allowed.is_match(path) {
                warn!(
                    "coordinator: worker route {} {} dropped, not in '{}' allow-list",
                    method, path, child.scope.name
                );
                return false;
            }
        }
        child.scope.router.merge_worker_route(method, path)
    }

    pub fn total_routes(&self) -> usize {
        self.children.iter().map(|c| c.scope.router.route_count()).sum()
    }
}
