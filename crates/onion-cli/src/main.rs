//! onion-cli: Headless Onion Client
//!
//! Starts the client daemon through the connection manager, logs bootstrap
//! progress and tears everything down on Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use onion_core::{
    BridgeSettings, BridgeType, Collaborators, ConnectionDelegate, ConnectionManager,
    ConnectionState, OnionConfig, RouteProbe,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "onion-cli", version, about = "Run an onion-routing client daemon")]
struct Args {
    /// Configuration file (.toml or .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bridge type: none, obfs4, custom, snowflake
    #[arg(short, long)]
    bridges: Option<BridgeType>,

    /// Custom bridge line (repeatable, implies --bridges custom)
    #[arg(long = "bridge", value_name = "LINE")]
    bridge_lines: Vec<String>,

    /// Seconds between network capability checks
    #[arg(long, default_value_t = 30)]
    probe_interval: u64,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Extra daemon arguments, passed through verbatim
    #[arg(last = true)]
    daemon_args: Vec<String>,
}

/// Logs delegate notifications
struct LoggingDelegate;

impl ConnectionDelegate for LoggingDelegate {
    fn progress(&self, percent: u8) {
        info!("Bootstrapped {}%", percent);
    }

    fn finished(&self) {
        info!("Connected");
    }

    fn difficulties(&self) {
        warn!("Connection is taking longer than expected; consider configuring bridges");
    }
}

fn init_logging(verbose: bool) {
    // RUST_LOG wins over --verbose
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .init();
}

fn load_config(args: &Args) -> Result<OnionConfig> {
    let mut config = match &args.config {
        Some(path) => OnionConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => OnionConfig::default(),
    };

    if !args.bridge_lines.is_empty() {
        config.bridges = BridgeSettings::new(BridgeType::Custom, Some(args.bridge_lines.clone()));
    } else if let Some(bridge_type) = args.bridges {
        config.bridges = BridgeSettings::new(bridge_type, config.bridges.custom_bridges.take());
    }
    if !args.daemon_args.is_empty() {
        config.extra_arguments = args.daemon_args.clone();
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(&args)?;
    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    info!("onion-cli starting (bridges: {})", config.bridges.bridge_type);

    let manager = ConnectionManager::spawn(config.clone(), Collaborators::system(&config));

    let probe = RouteProbe::spawn(Duration::from_secs(args.probe_interval.max(1)));
    manager.watch_capability(&probe);

    let delegate: Arc<dyn ConnectionDelegate> = Arc::new(LoggingDelegate);
    manager.start(None, delegate.clone()).await;

    let mut state = manager.subscribe_state();
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for Ctrl-C")?;
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                if current == ConnectionState::Connected {
                    match manager.circuits().await {
                        Ok(circuits) => info!("{} circuits built", circuits.len()),
                        Err(e) => warn!("Could not list circuits: {}", e),
                    }
                }
            }
        }
    }

    info!("Shutting down");
    manager.stop().await;
    Ok(())
}
