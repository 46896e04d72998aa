//! Multi-trader copy-trading engine for Polymarket.
//!
//! Watches a configured set of leader wallets and mirrors their fills with
//! proportional sizing under global and per-leader risk limits.

use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use polycopy::config::{LoggingConfig, Settings};
use polycopy::engine::{Engine, RunError};
use polycopy::errors::ConfigError;
use polycopy::polymarket::{ClobClient, DataClient, PolymarketVenue, VenueCredentials};
use polycopy::services::TradeRecorder;
use polycopy::state::{
    read_json, ControlAction, ControlCommand, ControlFile, StatePaths, StatusFile,
};

/// Polymarket multi-trader copytrading CLI.
#[derive(Parser)]
#[command(name = "polycopy")]
#[command(about = "Copy trades from configured Polymarket traders", long_about = None)]
struct Cli {
    /// State directory shared between the engine and control commands.
    #[arg(long, default_value = "state")]
    state_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start monitoring and copying all enabled traders.
    Start {
        /// Config file path
        #[arg(long, default_value = "config/settings.yaml")]
        config: String,
    },

    /// Show per-trader exposure and stats from the running engine.
    Status,

    /// Pause copying a specific trader.
    Pause {
        #[arg(long)]
        trader_name: String,
    },

    /// Resume copying a paused trader.
    Resume {
        #[arg(long)]
        trader_name: String,
    },

    /// Ask the running engine to shut down gracefully.
    Stop,

    /// Record leader trade history to CSV without placing orders.
    TrackTrades {
        /// Config file path
        #[arg(long, default_value = "config/settings.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let paths = StatePaths::new(&cli.state_dir);

    match cli.command {
        Commands::Start { config } => run_engine(&config).await,
        Commands::Status => show_status(&paths),
        Commands::Pause { trader_name } => {
            send_leader_command(&paths, ControlAction::Pause, &trader_name)
        }
        Commands::Resume { trader_name } => {
            send_leader_command(&paths, ControlAction::Resume, &trader_name)
        }
        Commands::Stop => send_stop(&paths),
        Commands::TrackTrades { config } => run_recorder(&config).await,
    }
}

async fn run_engine(config_path: &str) -> ExitCode {
    let settings = match Settings::load(config_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Config error: {e}");
            return ExitCode::from(1);
        }
    };

    init_tracing(&settings.logging);

    let metrics_listen = settings
        .monitoring
        .metrics_listen
        .as_deref()
        .and_then(|s| s.parse::<SocketAddr>().ok());
    polycopy::metrics::init_metrics(metrics_listen);

    let venue = match build_venue(&settings) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, "Failed to construct venue client");
            return ExitCode::from(3);
        }
    };

    let mut engine = Engine::new(settings, venue);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received SIGINT, starting graceful shutdown");
            let _ = shutdown_tx.send(true);
        }
    });

    match engine.run(shutdown_rx).await {
        Ok(()) => {
            tracing::info!("Engine stopped cleanly");
            ExitCode::SUCCESS
        }
        Err(RunError::AuthFailure) => {
            tracing::error!("Stopping: venue rejected our credentials");
            ExitCode::from(2)
        }
        Err(e) => {
            tracing::error!(error = %e, "Engine halted on fatal error");
            ExitCode::from(3)
        }
    }
}

async fn run_recorder(config_path: &str) -> ExitCode {
    let settings = match Settings::load(config_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Config error: {e}");
            return ExitCode::from(1);
        }
    };
    init_tracing(&settings.logging);

    let http = match http_client() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build HTTP client");
            return ExitCode::from(3);
        }
    };
    let paths = StatePaths::new(&settings.state_dir);
    let mut recorder = TradeRecorder::new(DataClient::new(http), &settings, paths.recorder());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    match recorder.run(shutdown_rx).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Recorder stopped on error");
            ExitCode::from(3)
        }
    }
}

fn show_status(paths: &StatePaths) -> ExitCode {
    let Some(status) = read_json::<StatusFile>(&paths.status()) else {
        println!("No runtime state found. Is the engine running?");
        return ExitCode::SUCCESS;
    };

    if status.observe_mode {
        println!("MODE: observe-only (ledger/venue divergence at startup)\n");
    }

    println!(
        "{:<14} {:<10} {:>10} {:>10} {:>7} {:>10} {:>7}",
        "NAME", "STATE", "ALLOCATED", "EXPOSED", "UTIL%", "PNL", "TRADES"
    );
    println!("{}", "-".repeat(76));
    for leader in &status.leaders {
        println!(
            "{:<14} {:<10} {:>10.2} {:>10.2} {:>6.1}% {:>10.2} {:>7}",
            leader.name,
            leader.state,
            leader.allocated_capital,
            leader.exposure,
            leader.utilization_pct,
            leader.stats.realized_pnl,
            leader.stats.copied_trades,
        );
    }
    println!("{}", "-".repeat(76));
    println!(
        "Global exposure: ${:.2} / ${:.2} (updated {})",
        status.global_exposure,
        status.max_total_exposure,
        status.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
    );
    if !status.is_fresh() {
        println!("Warning: status is stale; the engine may not be running.");
    }
    ExitCode::SUCCESS
}

fn send_leader_command(paths: &StatePaths, action: ControlAction, trader_name: &str) -> ExitCode {
    let Some(status) = read_json::<StatusFile>(&paths.status()) else {
        eprintln!("Engine is not running (no status file).");
        return ExitCode::from(4);
    };
    if !status.is_fresh() {
        eprintln!("Engine is not running (stale status file).");
        return ExitCode::from(4);
    }
    if !status.leaders.iter().any(|l| l.name == trader_name) {
        eprintln!("Trader '{trader_name}' not found.");
        return ExitCode::from(5);
    }

    let command = ControlCommand {
        action,
        trader_name: Some(trader_name.to_string()),
        issued_at: Utc::now(),
    };
    match ControlFile::append(&paths.control(), command) {
        Ok(()) => {
            println!("Command sent; applied on the engine's next tick.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to write control file: {e}");
            ExitCode::from(3)
        }
    }
}

fn send_stop(paths: &StatePaths) -> ExitCode {
    let command = ControlCommand {
        action: ControlAction::Stop,
        trader_name: None,
        issued_at: Utc::now(),
    };
    match ControlFile::append(&paths.control(), command) {
        Ok(()) => {
            println!("Stop requested.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to write control file: {e}");
            ExitCode::from(3)
        }
    }
}

fn build_venue(settings: &Settings) -> Result<Arc<PolymarketVenue>, ConfigError> {
    let http = http_client().map_err(|e| ConfigError::Invalid(e.to_string()))?;
    let creds = VenueCredentials::new(
        settings.your_account.api_key.clone(),
        settings.your_account.api_secret.clone(),
        settings.your_account.api_passphrase.clone(),
    );
    let data = DataClient::new(http.clone());
    let clob = ClobClient::new(http, creds);
    Ok(Arc::new(PolymarketVenue::new(data, clob)))
}

fn http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
}

fn init_tracing(logging: &LoggingConfig) {
    let default_level = logging.level.clone().unwrap_or_else(|| "info".into());
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = logging.file.as_deref().and_then(|path| {
        if let Some(parent) = std::path::Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file))),
            Err(e) => {
                eprintln!("Could not open log file {path}: {e}");
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
}
