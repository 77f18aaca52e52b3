//! Standalone signaling server binary
//!
//! Run with:
//!   cargo run --bin signaling-server -- --port 8080

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use pairlink::SignalingServer;

/// Signaling server for pairlink peer sessions
#[derive(Parser, Debug)]
#[command(name = "signaling-server")]
#[command(about = "Two-party room signaling server for pairlink sessions")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let addr = format!("{}:{}", args.host, args.port);
    info!("starting signaling server on {}", addr);

    let server = SignalingServer::new();
    server.run(&addr).await?;

    Ok(())
}
