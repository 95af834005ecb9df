//! Router binary

use anyhow::Result;
use clap::Parser;
use shardkv::{Config, RouterServer};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shardkv-router")]
#[command(about = "shardkv router - 2PC coordinator and scatter-gather reads")]
#[command(version)]
struct Args {
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

    let level = args.log_level.unwrap_or_else(|| config.log_level.clone());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let server = RouterServer::open(&config).await?;

    tokio::select! {
        res = server.serve() => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Router shutting down");
        }
    }

    Ok(())
}
