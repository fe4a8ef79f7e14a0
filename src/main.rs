//! IP blacklister CLI.

use anyhow::Result;
use clap::Parser;
use ip_blacklister::config::Mode;
use ip_blacklister::{trigger, Config, Cycle};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ip-blacklister")]
#[command(about = "Scan access logs, check client IPs against AbuseIPDB and ban abusive ones")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "ip-blacklister.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Run a single cycle regardless of the configured mode
    #[arg(long)]
    once: bool,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --print-config
    if args.print_config {
        println!("{}", Config::example());
        return Ok(());
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Load configuration
    info!(config = %args.config.display(), "Loading configuration");
    let config = Config::load(&args.config)?;

    // Handle --validate
    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    let cycle = Cycle::from_config(&config).await?;

    let mode = if args.once { Mode::SingleRun } else { config.mode };
    info!(mode = ?mode, logs = config.logs.len(), "Starting IP blacklister");

    match mode {
        Mode::SingleRun => trigger::run_once(&cycle).await,
        Mode::Schedule => {
            trigger::run_scheduled(&cycle, &config.schedule.cron, shutdown_signal()).await
        }
        Mode::Watchdog => trigger::run_watch(&cycle, &config, shutdown_signal()).await,
    }
}
