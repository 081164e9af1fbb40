mod server;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use duet_core::{bootstrap::load_config, logging};

use server::DuetServer;

/// Two-party call signaling server
#[derive(Debug, Parser)]
#[command(name = "duet", version, about)]
struct Args {
    /// Path to a YAML config file
    #[arg(short, long, env = "DUET_CONFIG_PATH")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = load_config(args.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("duet signaling server starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Serve until a shutdown signal arrives
    DuetServer::new(config).start().await
}
