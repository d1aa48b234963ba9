// CLI entry point for the rendezvous broker.
//
// Starts a standalone broker that board participants connect to. The broker
// only hands out addresses and forwards bytes between linked sessions; it
// never sees a board. See `server.rs` for the networking architecture and
// `registry.rs` for the bookkeeping.
//
// Usage:
//   broker [--port <PORT>] [--bind <ADDR>]
//
// Logging is controlled with `RUST_LOG` (default `info`).

use anyhow::Context;
use clap::Parser;
use dangeros_broker::{BrokerConfig, start_broker};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "broker", about = "Rendezvous broker for the shared board")]
struct Args {
    /// Listen port.
    #[arg(long, default_value_t = BrokerConfig::default().port)]
    port: u16,
    /// Interface to bind.
    #[arg(long, default_value_t = BrokerConfig::default().bind)]
    bind: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = BrokerConfig {
        port: args.port,
        bind: args.bind,
    };
    let (handle, addr) = start_broker(config.clone())
        .with_context(|| format!("failed to bind {}:{}", config.bind, config.port))?;

    info!(%addr, "broker ready; stop with Ctrl+C");
    handle.wait();
    Ok(())
}
