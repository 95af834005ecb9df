//! Shard node binary

use anyhow::Result;
use clap::Parser;
use shardkv::{Config, ShardServer};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shardkv-shard")]
#[command(about = "shardkv shard node - 2PC participant owning key mod N")]
#[command(version)]
struct Args {
    /// Shard ID (index into cluster.shards)
    shard_id: u32,

    /// Config file (defaults to ./shardkv.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    // Initialize tracing
    let level = args.log_level.unwrap_or_else(|| config.log_level.clone());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let server = ShardServer::open(&config, args.shard_id).await?;

    tokio::select! {
        res = server.serve() => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shard {} shutting down", args.shard_id);
        }
    }

    Ok(())
}
