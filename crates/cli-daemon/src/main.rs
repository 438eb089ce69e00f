use anyhow::Result;
use capsat_daemon::config::{ConfigOverrides, UploadEncoding};
use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "capsat_watcher")]
#[command(about = "Capsat beacon watcher and uploader", long_about = None)]
#[command(version)]
struct Args {
    /// Auth token for the target server
    #[arg(long)]
    token: Option<String>,

    /// Directory containing existing/new beacons
    #[arg(long, value_name = "DIR")]
    path: Option<PathBuf>,

    /// URL prefix to post beacons to
    #[arg(long, value_name = "URL")]
    target: Option<String>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Ledger file (defaults to <path>/.processed_beacons)
    #[arg(long, value_name = "FILE")]
    ledger: Option<PathBuf>,

    /// Seconds between polling passes
    #[arg(long, value_name = "SECS")]
    interval: Option<u64>,

    /// Upload endpoint path on the target
    #[arg(long, value_name = "PATH")]
    upload_path: Option<String>,

    /// Body encoding: multipart or raw
    #[arg(long)]
    encoding: Option<UploadEncoding>,

    /// Poll only, ignore filesystem events
    #[arg(long)]
    no_watch_events: bool,

    /// Check the target's record sources before watching
    #[arg(long)]
    preflight: bool,

    /// Record source the target must provide (repeatable, implies --preflight)
    #[arg(long = "expect-source", value_name = "SUFFIX")]
    expect_sources: Vec<String>,

    /// Write the body of failed uploads to this file
    #[arg(long, value_name = "FILE")]
    error_dump: Option<PathBuf>,

    /// Enable debugging
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            token: self.token.clone(),
            watch_path: self.path.clone(),
            target_base_url: self.target.clone(),
            ledger_path: self.ledger.clone(),
            upload_path: self.upload_path.clone(),
            encoding: self.encoding,
            scan_interval_secs: self.interval,
            watch_events: self.no_watch_events.then_some(false),
            error_dump_path: self.error_dump.clone(),
            expected_sources: (!self.expect_sources.is_empty()).then(|| self.expect_sources.clone()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Initialize logging with timestamps and levels
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_ansi(true)
        .init();

    info!("Capsat beacon watcher v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = match capsat_daemon::config::load_config(args.config.as_deref(), args.overrides()) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    info!("Watch path: {:?}", config.watch_path);
    info!("Target: {}", config.target_base_url);
    info!("Upload path: {}", config.upload_path);
    info!("Encoding: {:?}", config.encoding);
    info!("Beacon pattern: {}", config.beacon_pattern);
    info!("Settle time: {} seconds", config.settle_secs);

    // Run startup validation
    if let Err(e) = capsat_daemon::startup::check_watch_path(&config.watch_path) {
        error!("{:#}", e);
        return Err(e);
    }

    match capsat_daemon::startup::resolve_ledger_path(&config) {
        Ok(path) => info!("Ledger file: {:?}", path),
        Err(e) => {
            error!("{:#}", e);
            return Err(e);
        }
    }

    if let Some(dump) = &config.error_dump_path {
        info!("Failed upload bodies go to {:?}", dump);
    }

    if args.preflight || !config.expected_sources.is_empty() {
        info!("Checking the target has the record sources we need...");
        match capsat_daemon::startup::preflight(&config).await {
            Ok(sources) => info!("Target knows {} record sources: {:?}", sources.len(), sources),
            Err(e) => {
                error!("Preflight failed: {:#}", e);
                return Err(e);
            }
        }
    }

    info!("Startup validation complete");

    if let Err(e) = capsat_daemon::run_watch_loop(config, shutdown_signal()).await {
        error!("Watch loop error: {:#}", e);
        return Err(e);
    }

    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl+C received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}
