//! cellsync relay daemon.
//!
//! ```text
//! cellsync-relay --bind 0.0.0.0:9090 --storage ./cellsync_data
//! ```
//!
//! Log level comes from `RUST_LOG` (default `info`).

use std::path::PathBuf;

use cellsync::{Relay, RelayConfig};
use clap::Parser;

/// Command line interface for the relay
#[derive(Parser, Debug)]
#[command(name = "cellsync-relay")]
#[command(about = "Last-writer-wins key/value relay over WebSocket")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "CELLSYNC_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory for the durable mirror (in-memory only if omitted)
    #[arg(long, env = "CELLSYNC_STORAGE")]
    storage: Option<PathBuf>,

    /// Messages buffered per session before a slow session starts losing them
    #[arg(long, env = "CELLSYNC_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = RelayConfig {
        bind_addr: cli.bind,
        broadcast_capacity: cli.broadcast_capacity,
        storage_path: cli.storage,
    };
    let relay = Relay::new(config)?;
    let handle = relay.bind().await?;
    log::info!("Serving on {}", handle.url());

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {e}");
    }
    log::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}
