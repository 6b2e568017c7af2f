//! Worker binary: resolves brokerage configuration and announces availability
//! on a fixed tick until `ctrl_c`, deregistering on shutdown.

use clap::Parser;
use tracing::{info, warn};
use worker_brokerage::brokerage::config::resolve;
use worker_brokerage::brokerage::rendezvous::WorkerMode;
use worker_brokerage::{BrokerageArgs, BrokerageServer, WorkerSettings};

#[derive(Parser)]
#[command(name = "worker", version, about = "FASTBuild compile worker")]
struct Args {
    #[command(flatten)]
    brokerage: BrokerageArgs,

    /// Protocol version this worker speaks.
    #[arg(long, default_value_t = 1)]
    protocol_version: u32,

    /// Platform identifier (opaque to the brokerage layer).
    #[arg(long, default_value_t = 0)]
    platform: u8,

    /// Number of CPUs this worker makes available to the build.
    #[arg(long, default_value_t = num_cpus_fallback())]
    available_cpus: u32,

    /// Total CPUs on this machine.
    #[arg(long, default_value_t = num_cpus_fallback())]
    total_cpus: u32,

    /// Memory to advertise, in MiB.
    #[arg(long, default_value_t = 8192)]
    memory_mib: u32,
}

fn num_cpus_fallback() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("worker=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let config = resolve(|k| std::env::var(k).ok(), &args.brokerage);
    info!(?config, "resolved brokerage configuration");

    let settings = WorkerSettings {
        version: env!("CARGO_PKG_VERSION").to_string(),
        user: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
        mode: WorkerMode::Dedicated,
        available_cpus: args.available_cpus,
        total_cpus: args.total_cpus,
        memory_mib: args.memory_mib,
    };

    let server = BrokerageServer::new(config, args.protocol_version, args.platform, settings);

    let mut ticks = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticks.tick() => {
                if let Err(e) = server.set_availability(true).await {
                    warn!(error = %e, "failed to announce availability");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down, deregistering");
                let _ = server.set_availability(false).await;
                server.shutdown().await;
                break;
            }
        }
    }
}
