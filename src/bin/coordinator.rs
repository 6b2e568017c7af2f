//! Coordinator binary: runs the coordinator service until `ctrl_c`.

use clap::Parser;
use tracing::{error, info};
use worker_brokerage::{CoordinatorService, EXIT_CODE_BIND_FAILED};

#[derive(Parser)]
#[command(name = "coordinator", version, about = "FASTBuild worker coordinator")]
struct Args {}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("coordinator=info".parse().unwrap()),
        )
        .init();

    let _args = Args::parse();

    info!("starting coordinator");
    let coordinator = CoordinatorService::new();

    tokio::select! {
        result = coordinator.run() => {
            if let Err(e) = result {
                error!(error = %e, "coordinator failed to bind");
                std::process::exit(EXIT_CODE_BIND_FAILED);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
}
