mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use duocast_core::{logging, Config, SessionRegistry, SignalHub};

#[derive(Debug, Parser)]
#[command(name = "duocast", about = "LAN screen-sharing coordinator")]
struct Args {
    /// Path to a config file (without extension), e.g. config/duocast
    #[arg(long, env = "DUOCAST_CONFIG")]
    config: Option<String>,

    /// Run the in-process host engine regardless of config
    #[arg(long)]
    host_engine: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if args.host_engine {
        config.host.enabled = true;
    }

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    let instance_id = nanoid::nanoid!(6);
    info!(instance_id = %instance_id, "Duocast server starting...");
    info!(
        "HTTP address: {}:{}",
        config.server.host, config.server.http_port
    );

    // 4. Construct the single per-process coordination state
    let hub = SignalHub::new();
    let registry = Arc::new(SessionRegistry::new(hub));

    // 5. Serve until shutdown
    server::run(&config, registry).await
}
