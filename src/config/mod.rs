pub mod types;


pub use types::*;

use anyhow::Result;
use std::path::Path;

pub const BALANCE_STRATEGIES: &[&str] = &[
    "round-robin",
    "least-connections",
    "weighted",
    "hash",
    "least-latency",
];

impl EdgeConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — the edge can start with zero configuration for local
    /// development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: EdgeConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            EdgeConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variable overrides for deployment-level settings.
    /// Route tables and admission rules come from the file only.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("XYPRISS_HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("XYPRISS_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.server.port = n;
            }
        }
        if let Ok(v) = std::env::var("XYPRISS_IPC") {
            self.ipc.socket_path = v;
        }
        if let Ok(v) = std::env::var("XYPRISS_IPC_TOKEN") {
            self.ipc.auth_token = Some(v);
        }
        if let Ok(v) = std::env::var("XYPRISS_ENTRY_POINT") {
            self.cluster.entry_point = v;
        }
        if let Ok(v) = std::env::var("XYPRISS_WORKERS") {
            if let Ok(n) = v.parse::<usize>() {
                self.cluster.workers = n;
            }
        }
        if let Ok(v) = std::env::var("XYPRISS_STATUS_LISTEN") {
            self.server.status_listen = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster.workers == 0 && self.ipc.upstreams.is_empty() {
            anyhow::bail!("cluster.workers must be > 0 unless ipc.upstreams is set");
        }
        if !BALANCE_STRATEGIES.contains(&self.cluster.strategy.as_str()) {
            anyhow::bail!(
                "unknown cluster.strategy '{}', expected one of {:?}",
                self.cluster.strategy,
                BALANCE_STRATEGIES
            );
        }
        if self.breaker.scope != "worker" && self.breaker.scope != "route" {
            anyhow::bail!(
                "breaker.scope must be 'worker' or 'route', got '{}'",
                self.breaker.scope
            );
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            anyhow::bail!("retry.jitter must be within [0, 1]");
        }
        if self.autoscaler.min_workers > self.autoscaler.max_workers {
            anyhow::bail!(
                "autoscaler.min_workers ({}) exceeds max_workers ({})",
                self.autoscaler.min_workers,
                self.autoscaler.max_workers
            );
        }
        if self.autoscaler.down_threshold >= self.autoscaler.up_threshold {
            anyhow::bail!("autoscaler.down_threshold must be below up_threshold");
        }
        for rule in &self.admission.rules {
            match rule.scope.as_str() {
                "global" | "per_ip" | "per_user" => {}
                "per_route" => {
                    if rule.route.is_none() {
                        anyhow::bail!("per_route rate-limit rule requires a 'route' pattern");
                    }
                }
                other => anyhow::bail!("unknown rate-limit scope '{}'", other),
            }
            if rule.strategy != "fixed" && rule.strategy != "sliding" {
                anyhow::bail!("rate-limit strategy must be 'fixed' or 'sliding'");
            }
            if rule.limit == 0 || rule.window_secs == 0 {
                anyhow::bail!("rate-limit rules require limit > 0 and window_secs > 0");
            }
        }
        for alg in &self.compression.algorithms {
            if !matches!(alg.as_str(), "br" | "gzip" | "deflate") {
                anyhow::bail!("unsupported compression algorithm '{}'", alg);
            }
        }
        for overlay in &self.servers {
            if overlay.route_prefix.is_empty() {
                anyhow::bail!("server overlay '{}' has an empty route_prefix", overlay.name);
            }
            if overlay.port == self.server.port {
                anyhow::bail!(
                    "server overlay '{}' reuses the primary port {}",
                    overlay.name,
                    overlay.port
                );
            }
        }
        Ok(())
    }
}
