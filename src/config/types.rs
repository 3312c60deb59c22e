use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Deserialize a `T` that implements `Default` — treats JSON/TOML `null` the
/// same as a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level edge configuration.
///
/// Loaded once at startup, then published behind an `ArcSwap` snapshot —
/// hot updates swap the whole value; readers never see a partial config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub ipc: IpcConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub autoscaler: AutoscalerConfig,

    #[serde(default)]
    pub network_quality: NetworkQualityConfig,

    /// Statically registered routes. Workers may add more via `sync_routes`.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteConfig>,

    /// Hot-path routes that bypass the generic router.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub fast_routes: Vec<FastRouteConfig>,

    /// Additional listeners, each with its own router scope.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub servers: Vec<ServerOverlay>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-request deadline in seconds, measured from ingress.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Idle keep-alive timeout for downstream connections.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Connections are closed after serving this many requests.
    #[serde(default = "default_max_requests_per_conn")]
    pub max_requests_per_connection: u64,

    #[serde(default = "default_max_body")]
    pub max_body_bytes: u64,

    #[serde(default = "default_max_url")]
    pub max_url_length: usize,

    /// Enable HTTP/2 on the listener (HTTP/1.1 is always on).
    #[serde(default)]
    pub http2: bool,

    /// Trusted proxy peers: IP/CIDR tokens or the literals
    /// `loopback`, `linklocal`, `uniquelocal`.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub trust_proxy: Vec<String>,

    /// When no route matches: respond 404 (`false`) or fall through to a
    /// worker dispatch (`true`).
    #[serde(default)]
    pub worker_fallback: bool,

    /// Listen address for the status/metrics listener.
    #[serde(default = "default_status_listen")]
    pub status_listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_secs: default_timeout(),
            keep_alive_secs: default_keep_alive(),
            max_requests_per_connection: default_max_requests_per_conn(),
            max_body_bytes: default_max_body(),
            max_url_length: default_max_url(),
            http2: false,
            trust_proxy: Vec::new(),
            worker_fallback: false,
            status_listen: default_status_listen(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4349
}

fn default_timeout() -> u64 {
    30
}

fn default_keep_alive() -> u64 {
    30
}

fn default_max_requests_per_conn() -> u64 {
    100
}

fn default_max_body() -> u64 {
    10 * 1024 * 1024
}

fn default_max_url() -> usize {
    2048
}

fn default_status_listen() -> String {
    "127.0.0.1:9349".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Unix-domain socket path the workers connect to.
    #[serde(default = "default_ipc_path")]
    pub socket_path: String,

    /// Remote worker endpoints the edge connects out to (host:port).
    /// Used on platforms without UDS or for off-host workers.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub upstreams: Vec<String>,

    /// Shared token expected in `register_worker` from TCP upstreams.
    #[serde(default)]
    pub auth_token: Option<String>,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// A worker missing a pong for this long is marked dead.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,

    /// Bound of each worker's outbound frame queue.
    #[serde(default = "default_send_queue")]
    pub send_queue_capacity: usize,

    #[serde(default = "default_max_frame")]
    pub max_frame_bytes: u32,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: default_ipc_path(),
            upstreams: Vec::new(),
            auth_token: None,
            ping_interval_secs: default_ping_interval(),
            ping_timeout_secs: default_ping_timeout(),
            send_queue_capacity: default_send_queue(),
            max_frame_bytes: default_max_frame(),
        }
    }
}

fn default_ipc_path() -> String {
    "/tmp/xypriss.sock".to_string()
}

fn default_ping_interval() -> u64 {
    10
}

fn default_ping_timeout() -> u64 {
    30
}

fn default_send_queue() -> usize {
    128
}

fn default_max_frame() -> u32 {
    100 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of worker processes to maintain.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Worker entry point. Empty means the edge does not spawn workers
    /// (they connect on their own, e.g. in tests or remote-upstream mode).
    #[serde(default)]
    pub entry_point: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub args: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub env: HashMap<String, String>,

    #[serde(default = "default_true")]
    pub respawn: bool,

    /// Maximum restarts per worker slot within a 60 s window.
    #[serde(default = "default_restart_budget")]
    pub restart_budget: u32,

    /// Per-worker RSS cap in MB. `None` disables the check.
    #[serde(default)]
    pub max_memory_mb: Option<u64>,

    /// Soft CPU cap in percent — de-prioritizes selection, no OS enforcement.
    #[serde(default)]
    pub max_cpu_percent: Option<u32>,

    #[serde(default = "default_mem_check_interval")]
    pub mem_check_interval_secs: u64,

    /// Grace between a `shutdown` frame and a kill.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Fork all workers at boot and gate on readiness.
    #[serde(default)]
    pub pre_allocate: bool,

    /// Balancer strategy: round-robin | least-connections | weighted | hash | least-latency.
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            entry_point: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            respawn: true,
            restart_budget: default_restart_budget(),
            max_memory_mb: None,
            max_cpu_percent: None,
            mem_check_interval_secs: default_mem_check_interval(),
            shutdown_grace_secs: default_shutdown_grace(),
            pre_allocate: false,
            strategy: default_strategy(),
        }
    }
}

fn default_workers() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_restart_budget() -> u32 {
    5
}

fn default_mem_check_interval() -> u64 {
    5
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_strategy() -> String {
    "round-robin".to_string()
}

/// One rate-limit rule. Every rule whose scope applies to a request is
/// enforced; the first exceeded rule rejects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// "global" | "per_ip" | "per_user" | "per_route".
    pub scope: String,

    /// "fixed" | "sliding".
    #[serde(default = "default_rl_strategy")]
    pub strategy: String,

    /// Maximum requests per window.
    pub limit: u64,

    #[serde(default = "default_rl_window")]
    pub window_secs: u64,

    /// Route pattern this rule is bound to (per_route scope only).
    #[serde(default)]
    pub route: Option<String>,
}

fn default_rl_strategy() -> String {
    "sliding".to_string()
}

fn default_rl_window() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub rules: Vec<RateLimitRule>,

    /// Header carrying the user identity for per_user scope.
    /// Requests without it fall back to the per-IP key.
    #[serde(default)]
    pub user_header: Option<String>,

    /// Path prefixes exempt from rate limiting.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub excluded_paths: Vec<String>,

    /// Hard cap on tracked buckets; oldest entries are evicted beyond it.
    #[serde(default = "default_max_buckets")]
    pub max_buckets: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            user_header: None,
            excluded_paths: Vec::new(),
            max_buckets: default_max_buckets(),
        }
    }
}

fn default_max_buckets() -> usize {
    100_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,

    /// Failures older than this do not count toward the threshold.
    #[serde(default = "default_breaker_window")]
    pub window_secs: u64,

    #[serde(default = "default_breaker_open")]
    pub open_duration_secs: u64,

    /// Concurrent probes allowed in half-open.
    #[serde(default = "default_probe_count")]
    pub probe_count: u32,

    /// "worker" (default) or "route".
    #[serde(default = "default_breaker_scope")]
    pub scope: String,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_breaker_threshold(),
            window_secs: default_breaker_window(),
            open_duration_secs: default_breaker_open(),
            probe_count: default_probe_count(),
            scope: default_breaker_scope(),
        }
    }
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_window() -> u64 {
    60
}

fn default_breaker_open() -> u64 {
    30
}

fn default_probe_count() -> u32 {
    3
}

fn default_breaker_scope() -> String {
    "worker".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts after the initial dispatch.
    #[serde(default = "default_retry_max")]
    pub max: u32,

    #[serde(default = "default_retry_base")]
    pub base_delay_ms: u64,

    #[serde(default = "default_retry_cap")]
    pub max_delay_ms: u64,

    /// Fractional jitter applied to each delay (0.25 → ±25%).
    #[serde(default = "default_retry_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max: default_retry_max(),
            base_delay_ms: default_retry_base(),
            max_delay_ms: default_retry_cap(),
            jitter: default_retry_jitter(),
        }
    }
}

fn default_retry_max() -> u32 {
    2
}

fn default_retry_base() -> u64 {
    50
}

fn default_retry_cap() -> u64 {
    1_000
}

fn default_retry_jitter() -> f64 {
    0.25
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Bodies at or below this size are sent uncompressed.
    #[serde(default = "default_compress_threshold")]
    pub threshold_bytes: u64,

    /// Allowed algorithms in preference order subset: br, gzip, deflate.
    #[serde(default = "default_compress_algs")]
    pub algorithms: Vec<String>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_bytes: default_compress_threshold(),
            algorithms: default_compress_algs(),
        }
    }
}

fn default_compress_threshold() -> u64 {
    1024
}

fn default_compress_algs() -> Vec<String> {
    vec!["br".to_string(), "gzip".to_string(), "deflate".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscalerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,

    /// Minimum spacing between scaling decisions.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Scale up when avg(in-flight/worker) exceeds this fraction of capacity.
    #[serde(default = "default_up_threshold")]
    pub up_threshold: f64,

    #[serde(default = "default_down_threshold")]
    pub down_threshold: f64,

    /// System memory usage fraction that forces a scale-down.
    #[serde(default = "default_critical_memory")]
    pub critical_memory: f64,

    #[serde(default = "default_true")]
    pub rescue_enabled: bool,

    /// Zero ready workers for this long → rescue mode.
    #[serde(default = "default_rescue_timeout")]
    pub rescue_timeout_secs: u64,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            sample_interval_secs: default_sample_interval(),
            cooldown_secs: default_cooldown(),
            up_threshold: default_up_threshold(),
            down_threshold: default_down_threshold(),
            critical_memory: default_critical_memory(),
            rescue_enabled: true,
            rescue_timeout_secs: default_rescue_timeout(),
        }
    }
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    8
}

fn default_sample_interval() -> u64 {
    5
}

fn default_cooldown() -> u64 {
    45
}

fn default_up_threshold() -> f64 {
    0.8
}

fn default_down_threshold() -> f64 {
    0.25
}

fn default_critical_memory() -> f64 {
    0.9
}

fn default_rescue_timeout() -> u64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkQualityConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Minimum client downlink in kbit/s; below this the request is rejected.
    #[serde(default)]
    pub min_bandwidth_kbps: Option<u64>,

    /// Maximum tolerated client RTT in milliseconds.
    #[serde(default)]
    pub max_latency_ms: Option<u64>,
}

impl Default for NetworkQualityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_bandwidth_kbps: None,
            max_latency_ms: None,
        }
    }
}

/// A registered route. Patterns are exact (`/a/b`), parameterized
/// (`/a/:id`), regex (`regex` kind), or the `*` catch-all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// HTTP method; "*" means any.
    #[serde(default = "default_any_method")]
    pub method: String,

    pub pattern: String,

    /// "literal" (default, covers exact/param/wildcard) or "regex".
    #[serde(default = "default_pattern_kind")]
    pub kind: String,

    #[serde(default)]
    pub target: RouteTargetConfig,
}

fn default_any_method() -> String {
    "*".to_string()
}

fn default_pattern_kind() -> String {
    "literal".to_string()
}

/// Where a matched request goes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteTargetConfig {
    /// Dispatch to a worker over the IPC bridge.
    #[default]
    Worker,
    /// Serve a file from disk.
    Static { path: String },
    /// Redirect with the given status code.
    Redirect { code: u16, url: String },
    /// Handled by the edge itself (status/health endpoints).
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastRouteConfig {
    pub method: String,
    pub path: String,

    /// When true, a hit bypasses the admission layer too.
    #[serde(default)]
    pub skip_admission: bool,

    /// Cache the worker response body for this long. `None` disables caching.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    /// Extra response headers added on a hit.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub headers: HashMap<String, String>,
}

/// Per-listener overlay for the multi-server coordinator. Unset fields
/// inherit from the base [`ServerConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOverlay {
    pub name: String,

    pub port: u16,

    #[serde(default)]
    pub host: Option<String>,

    /// Routes whose pattern starts with this prefix are registered here.
    pub route_prefix: String,

    /// Glob patterns further restricting which routes the listener accepts.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub allowed_routes: Vec<String>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub max_body_bytes: Option<u64>,
}
