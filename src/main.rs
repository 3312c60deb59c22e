#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use xypriss_edge::config::EdgeConfig;
use xypriss_edge::server::{bootstrap, runtime};

#[derive(Parser)]
#[command(name = "xypriss", about = "XyPriss edge dispatch and cluster orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Server lifecycle commands.
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },
}

#[derive(Subcommand)]
enum ServerAction {
    /// Start the edge and its worker fleet.
    Start(StartArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Path to the config file (.toml or .json).
    #[arg(short, long, default_value = "xypriss.toml")]
    config: PathBuf,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// IPC socket path workers connect to.
    #[arg(long)]
    ipc: Option<String>,

    /// Per-request deadline in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Enable clustering (spawn workers from --entry-point).
    #[arg(long)]
    cluster: bool,

    #[arg(long)]
    cluster_workers: Option<usize>,

    #[arg(long)]
    cluster_respawn: Option<bool>,

    /// Worker entry point executable.
    #[arg(long)]
    entry_point: Option<String>,

    #[arg(long)]
    max_body_size: Option<u64>,

    #[arg(long)]
    max_url_length: Option<usize>,

    /// Per-worker RSS cap in MB.
    #[arg(long)]
    cluster_max_memory: Option<u64>,

    /// Soft per-worker CPU cap in percent.
    #[arg(long)]
    cluster_max_cpu: Option<u32>,

    #[arg(long)]
    cluster_strategy: Option<String>,

    #[arg(long)]
    rescue_mode: Option<bool>,

    #[arg(long)]
    perf_compression: Option<bool>,

    /// CSV subset of gzip,br,deflate.
    #[arg(long)]
    perf_compression_algs: Option<String>,

    /// CSV of remote worker endpoints (host:port).
    #[arg(long)]
    proxy_upstreams: Option<String>,

    #[arg(long)]
    proxy_strategy: Option<String>,
}

fn apply_overrides(config: &mut EdgeConfig, args: &StartArgs) {
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(ipc) = &args.ipc {
        config.ipc.socket_path = ipc.clone();
    }
    if let Some(timeout) = args.timeout {
        config.server.timeout_secs = timeout;
    }
    if args.cluster || args.cluster_workers.is_some() {
        config.cluster.workers = args.cluster_workers.unwrap_or(config.cluster.workers.max(1));
    }
    if let Some(respawn) = args.cluster_respawn {
        config.cluster.respawn = respawn;
    }
    if let Some(entry) = &args.entry_point {
        config.cluster.entry_point = entry.clone();
    }
    if let Some(max_body) = args.max_body_size {
        config.server.max_body_bytes = max_body;
    }
    if let Some(max_url) = args.max_url_length {
        config.server.max_url_length = max_url;
    }
    if let Some(memory) = args.cluster_max_memory {
        config.cluster.max_memory_mb = Some(memory);
    }
    if let Some(cpu) = args.cluster_max_cpu {
        config.cluster.max_cpu_percent = Some(cpu);
    }
    if let Some(strategy) = &args.cluster_strategy {
        config.cluster.strategy = strategy.clone();
    }
    if let Some(rescue) = args.rescue_mode {
        config.autoscaler.rescue_enabled = rescue;
    }
    if let Some(compression) = args.perf_compression {
        config.compression.enabled = compression;
    }
    if let Some(algs) = &args.perf_compression_algs {
        config.compression.algorithms =
            algs.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Some(upstreams) = &args.proxy_upstreams {
        config.ipc.upstreams = upstreams.split(',').map(|s| s.trim().to_string()).collect();
    }
    if let Some(strategy) = &args.proxy_strategy {
        config.cluster.strategy = strategy.clone();
    }
}

fn main() {
    let cli = Cli::parse();
    let Command::Server {
        action: ServerAction::Start(args),
    } = cli.command;

    let mut config = match EdgeConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("xypriss: configuration error: {}", e);
            std::process::exit(1);
        }
    };
    apply_overrides(&mut config, &args);
    if let Err(e) = config.validate() {
        eprintln!("xypriss: configuration error: {}", e);
        std::process::exit(1);
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(runtime::worker_threads())
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("xypriss: runtime build failed: {}", e);
            std::process::exit(1);
        }
    };

    match rt.block_on(bootstrap::run(config)) {
        Ok(()) => {}
        Err(fatal) => {
            eprintln!("xypriss: {}", fatal);
            std::process::exit(fatal.exit_code());
        }
    }
}
