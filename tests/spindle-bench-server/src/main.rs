//! Echo/task benchmark server
//!
//! Runs the spindle-test echo application on a real port so it can be driven
//! by external load generators. See `spindle_test::echo_server` for the
//! request protocol.
//!
//! # Usage
//!
//! ```bash
//! # 4 event workers, 2 task workers, round-robin dispatch
//! spindle-bench-server --addr 0.0.0.0:9501 --workers 4 --task-workers 2 --dispatch round-robin
//!
//! # Settings from a JSON file, flags are ignored
//! spindle-bench-server --config server.json
//!
//! # Reload workers / stop
//! kill -USR1 <pid>
//! kill -TERM <pid>
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use spindle::ServerConfig;
use spindle::dispatch::DispatchMode;
use spindle::server::ListenerConfig;
use spindle_test::echo_server::echo_server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Dispatch {
    RoundRobin,
    FdMod,
    LeastBusy,
    IpMod,
    UidMod,
    CoConnLb,
    CoReqLb,
}

impl From<Dispatch> for DispatchMode {
    fn from(d: Dispatch) -> Self {
        match d {
            Dispatch::RoundRobin => DispatchMode::RoundRobin,
            Dispatch::FdMod => DispatchMode::FdMod,
            Dispatch::LeastBusy => DispatchMode::LeastBusy,
            Dispatch::IpMod => DispatchMode::IpMod,
            Dispatch::UidMod => DispatchMode::UidMod,
            Dispatch::CoConnLb => DispatchMode::CoConnLb,
            Dispatch::CoReqLb => DispatchMode::CoReqLb,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "spindle-bench-server")]
#[command(about = "Echo/task benchmark server built on spindle")]
struct Args {
    /// TCP listen address
    #[arg(short, long, default_value = "0.0.0.0:9501")]
    addr: SocketAddr,

    /// Also echo datagrams on this UDP address
    #[arg(long)]
    udp: Option<SocketAddr>,

    /// Event workers, 0 for one per CPU
    #[arg(short, long, default_value = "0")]
    workers: u32,

    /// Task workers
    #[arg(short, long, default_value = "2")]
    task_workers: u32,

    #[arg(short, long, value_enum, default_value = "fd-mod")]
    dispatch: Dispatch,

    /// Recycle an event worker after this many requests, 0 disables
    #[arg(long, default_value = "0")]
    max_request: u64,

    #[arg(long, default_value = "10000")]
    max_connection: usize,

    /// Pin workers to CPUs
    #[arg(long)]
    affinity: bool,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<ServerConfig, String> {
    if let Some(path) = &args.config {
        let json = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
        return ServerConfig::from_json(&json).map_err(|e| format!("{}: {e}", path.display()));
    }
    let mut config = ServerConfig::new()
        .listen_tcp(args.addr)
        .worker_num(args.workers)
        .task_worker_num(args.task_workers)
        .dispatch_mode(args.dispatch.into())
        .max_request(args.max_request)
        .max_connection(args.max_connection);
    if let Some(udp) = args.udp {
        config = config.listen(ListenerConfig::udp(udp));
    }
    if args.affinity {
        config = config.cpu_affinity(Vec::new());
    }
    Ok(config)
}

fn main() {
    // Initialize tracing - respects RUST_LOG, defaults to info if not set
    // Disable ANSI colors for clean log output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .init();

    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    info!(
        addr = %args.addr,
        udp = ?args.udp,
        workers = config.worker_num,
        task_workers = config.task_worker_num,
        dispatch = ?config.dispatch_mode,
        "Starting echo benchmark server"
    );
    let (mut server, stats) = echo_server(config);
    if let Err(e) = server.start() {
        error!(error = %e, "server failed");
        std::process::exit(1);
    }
    info!(?stats, "server stopped");
}
