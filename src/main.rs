use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use octavius::config::ControllerConfig;
use octavius::node::Controller;
use octavius::shutdown::install_shutdown_handler;

const EXIT_CONFIG: i32 = 1;
const EXIT_STORE_UNREACHABLE: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "octavius")]
#[command(about = "Control plane dispatch engine for containerized jobs")]
struct Args {
    /// Address to listen on for gRPC
    #[arg(long, default_value = "0.0.0.0:5050")]
    listen_addr: String,

    /// Store endpoints (comma-separated, host:port)
    #[arg(long, default_value = "localhost:2379")]
    store_endpoints: String,

    /// Store connection timeout in seconds
    #[arg(long, default_value = "5")]
    store_connect_timeout_secs: u64,

    /// Deadline for single-shot client RPCs in seconds
    #[arg(long, default_value = "5")]
    request_deadline_secs: u64,

    /// Executor liveness lease TTL in seconds
    #[arg(long, default_value = "10")]
    ping_ttl_secs: i64,

    /// Consecutive missed pings after which an executor counts as lost
    #[arg(long, default_value = "3")]
    missed_ping_threshold: u32,

    /// Token required by the operator surface (approve/reject)
    #[arg(long, default_value = "")]
    admin_token: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let listen_addr: SocketAddr = match args.listen_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(listen_addr = %args.listen_addr, error = %e, "Invalid listen address");
            std::process::exit(EXIT_CONFIG);
        }
    };
    let store_endpoints: Vec<String> = args
        .store_endpoints
        .split(',')
        .map(|endpoint| endpoint.trim().to_string())
        .filter(|endpoint| !endpoint.is_empty())
        .collect();
    if store_endpoints.is_empty() {
        tracing::error!("No store endpoints configured");
        std::process::exit(EXIT_CONFIG);
    }

    let config = ControllerConfig {
        listen_addr,
        store_endpoints,
        store_connect_timeout: Duration::from_secs(args.store_connect_timeout_secs),
        request_deadline: Duration::from_secs(args.request_deadline_secs),
        ping_ttl_secs: args.ping_ttl_secs,
        missed_ping_threshold: args.missed_ping_threshold,
        admin_token: args.admin_token,
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        store_endpoints = ?config.store_endpoints,
        ping_ttl_secs = config.ping_ttl_secs,
        "Starting octavius control plane"
    );

    let shutdown = install_shutdown_handler();

    let controller = match Controller::bootstrap(config).await {
        Ok(controller) => controller,
        Err(e) => {
            tracing::error!(error = %e, "Store unreachable at bootstrap");
            std::process::exit(EXIT_STORE_UNREACHABLE);
        }
    };

    if let Err(e) = controller.run(shutdown).await {
        tracing::error!(error = %e, "Controller failed");
        std::process::exit(EXIT_CONFIG);
    }
}
