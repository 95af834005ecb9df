//! CLI for talking to a shardkv router

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shardkv::common::protocol::{ClientRequest, ClientResponse};
use shardkv::common::transport::{connect, read_frame, write_frame};
use shardkv::common::{timestamp_now_micros, Key, KeySet, Payload};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "shardkv")]
#[command(about = "shardkv sharded key-value store CLI")]
#[command(version)]
struct Cli {
    /// Router address
    #[arg(long, default_value = "127.0.0.1:12350")]
    router: SocketAddr,

    /// Give up waiting for the router after this many seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Atomically write one or more keys
    Put {
        /// KEY=VALUE pairs (keys are unsigned integers)
        #[arg(required = true, value_parser = parse_pair)]
        pairs: Vec<(Key, String)>,
    },

    /// Read one or more keys
    Get {
        /// Keys to read
        #[arg(required = true)]
        keys: Vec<Key>,
    },
}

fn parse_pair(s: &str) -> std::result::Result<(Key, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    let key = key
        .trim()
        .parse::<Key>()
        .map_err(|e| format!("invalid key '{}': {}", key, e))?;
    Ok((key, value.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client_tx_id = timestamp_now_micros();

    let request = match cli.command {
        Commands::Put { pairs } => ClientRequest::Put {
            client_tx_id,
            values: pairs
                .into_iter()
                .map(|(key, value)| (key, value.into_bytes()))
                .collect::<Payload>(),
        },
        Commands::Get { keys } => ClientRequest::Get {
            client_tx_id,
            keys: keys.into_iter().collect::<KeySet>(),
        },
    };

    let mut stream = connect(cli.router, Duration::from_secs(5))
        .await
        .with_context(|| format!("connecting to router at {}", cli.router))?;
    write_frame(&mut stream, &request).await?;

    let response = tokio::time::timeout(Duration::from_secs(cli.timeout), async {
        loop {
            match read_frame::<_, ClientResponse>(&mut stream).await? {
                Some(response) if response.client_tx_id() == client_tx_id => {
                    return Ok::<_, shardkv::Error>(response)
                }
                Some(_) => continue,
                None => {
                    let reason = "router closed the connection".to_string();
                    return Err(shardkv::Error::ConnectionFailed(reason));
                }
            }
        }
    })
    .await
    .context("timed out waiting for the router")??;

    match response {
        ClientResponse::Put { success, .. } => {
            println!("{}", serde_json::json!({ "success": success }));
            if !success {
                bail!("write aborted");
            }
        }
        ClientResponse::Get { values, .. } => {
            let values: BTreeMap<Key, String> = values
                .into_iter()
                .map(|(key, value)| (key, String::from_utf8_lossy(&value).into_owned()))
                .collect();
            println!("{}", serde_json::to_string_pretty(&values)?);
        }
    }

    Ok(())
}
