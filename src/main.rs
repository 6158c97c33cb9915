//! Rulemock - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use rulemock::{server, MockConfig, MockEngine};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "rulemock",
    about = "Configuration-driven HTTP mock server with ordered rule matching",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override the listen host
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        let default_config = include_str!("../config/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    let level = if wants_debug(&args.config) {
        Level::DEBUG
    } else {
        args.log_level
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        MockConfig::from_file(&args.config)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no endpoints)");
        let mut config = MockConfig::default();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    };

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let engine = MockEngine::from_config(&config)?;

    if args.validate {
        println!(
            "Configuration is valid ({} endpoints defined)",
            engine.registry().len()
        );
        return Ok(());
    }

    server::serve(Arc::new(engine), &config.server.address()).await
}

/// Whether the config file (or its environment override) enables debug logging.
fn wants_debug(path: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(path) else {
        return false;
    };
    match MockConfig::parse(&content, path) {
        Ok(mut config) => {
            config.apply_env_overrides(|key| std::env::var(key).ok());
            config.debug
        }
        Err(_) => false,
    }
}
