//! Client binary: a one-shot `find_workers` query, useful for operators
//! diagnosing discovery configuration.

use clap::Parser;
use worker_brokerage::brokerage::config::resolve;
use worker_brokerage::find_workers;
use worker_brokerage::BrokerageArgs;

#[derive(Parser)]
#[command(name = "client", version, about = "Query FASTBuild worker discovery")]
struct Args {
    #[command(flatten)]
    brokerage: BrokerageArgs,

    /// Protocol version to query for.
    #[arg(long, default_value_t = 1)]
    protocol_version: u32,

    /// Platform identifier to query for.
    #[arg(long, default_value_t = 0)]
    platform: u8,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = resolve(|k| std::env::var(k).ok(), &args.brokerage);

    let workers = find_workers(&config, args.protocol_version, args.platform).await;
    if workers.is_empty() {
        println!("no workers found");
    } else {
        for w in &workers {
            println!("{w}");
        }
    }
}
