use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use alerter::{run_alerter_service, TelegramAlerter};
use api_client::{BinanceClient, Venue, VenueCredentials};
use clap::{Parser, Subcommand};
use configuration::load_config;
use core_types::CircuitLevel;
use database::{connect, run_migrations, PostgresStateStore};
use engine::{EngineError, EngineRuntime};
use tokio::sync::broadcast;

/// Aegis: an autonomous multi-strategy crypto futures trading engine.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, short, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile against the venue and run the engine in the foreground
    /// until a shutdown signal is received.
    Start,
    /// Send a graceful shutdown request to a running engine process.
    Stop {
        /// Path to the PID file written by `start`.
        #[arg(long, default_value = "aegis.pid")]
        pid_file: PathBuf,
    },
    /// Print the current circuit breaker level, kill flag, equity, and drawdown.
    Status,
    /// Acknowledge recovery out of a circuit breaker level back toward Normal.
    AckRecovery {
        /// The level being acknowledged out of: caution, warning, or alert.
        level: String,
    },
    /// Clear a persisted L4 kill flag. The only way out of Emergency.
    ClearKillFlag,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    configuration::init_tracing();

    let cli = Cli::parse();
    let config_path = cli.config.to_string_lossy().into_owned();

    let config = match load_config(Some(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration invalid; refusing to start");
            return Ok(ExitCode::from(2));
        }
    };

    match cli.command {
        Commands::Start => handle_start(config).await,
        Commands::Stop { pid_file } => handle_stop(pid_file),
        Commands::Status => handle_status(config).await,
        Commands::AckRecovery { level } => handle_ack_recovery(config, &level).await,
        Commands::ClearKillFlag => handle_clear_kill_flag(config).await,
    }
}

async fn handle_start(config: configuration::AegisConfig) -> anyhow::Result<ExitCode> {
    write_pid_file()?;

    let db_pool = connect().await?;
    run_migrations(&db_pool).await?;
    let store: Arc<dyn database::StateStore> = Arc::new(PostgresStateStore::new(db_pool));

    let credentials = VenueCredentials {
        api_key: std::env::var("BINANCE_API_KEY").unwrap_or_default(),
        api_secret: std::env::var("BINANCE_API_SECRET").unwrap_or_default(),
    };
    let live_mode = std::env::var("AEGIS_LIVE_TRADING").as_deref() == Ok("true");
    let venue: Arc<dyn Venue> = Arc::new(BinanceClient::new(live_mode, &config.venue, credentials));

    let (event_tx, _) = broadcast::channel(1024);

    if let Some(alerter) = TelegramAlerter::new(&config.alerting) {
        tokio::spawn(run_alerter_service(alerter, event_tx.subscribe()));
        tracing::info!("Telegram alerter service started.");
    }

    let mut runtime = EngineRuntime::new(config, venue, store, event_tx, None).await?;

    let shutdown = runtime.shutdown_handle();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received; requesting graceful stop");
        shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
    });

    let result = runtime.run().await;
    remove_pid_file();

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(EngineError::KillFlagSet) => {
            tracing::error!("the L4 kill flag is set; refusing to start strategies");
            Ok(ExitCode::from(4))
        }
        Err(e @ EngineError::ReconcileMismatch(_)) => {
            tracing::error!(error = %e, "startup reconciliation failed");
            Ok(ExitCode::from(3))
        }
        Err(e) => {
            tracing::error!(error = %e, "engine exited with an error");
            Ok(ExitCode::from(1))
        }
    }
}

/// `start` runs as a foreground daemon; `stop` is a thin wrapper that sends
/// the recorded PID a `SIGTERM`, which `start`'s signal handler translates
/// into a graceful shutdown via the engine's shutdown flag.
fn handle_stop(pid_file: PathBuf) -> anyhow::Result<ExitCode> {
    let pid = std::fs::read_to_string(&pid_file)
        .map_err(|e| anyhow::anyhow!("could not read pid file {:?}: {e}", pid_file))?;
    let pid = pid.trim();

    let status = std::process::Command::new("kill").arg("-TERM").arg(pid).status()?;
    if status.success() {
        tracing::info!(pid, "sent SIGTERM to running engine process");
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}

async fn handle_status(config: configuration::AegisConfig) -> anyhow::Result<ExitCode> {
    let db_pool = connect().await?;
    let store: Arc<dyn database::StateStore> = Arc::new(PostgresStateStore::new(db_pool));
    let (event_tx, _) = broadcast::channel(16);

    let report = EngineRuntime::status(store, config, event_tx).await?;
    println!("circuit level: {:?}", report.circuit_level);
    println!("kill flag:     {}", report.kill_flag);
    println!("equity (usd):  {}", report.equity_usd);
    println!("drawdown:      {:.4}", report.drawdown);
    Ok(ExitCode::SUCCESS)
}

async fn handle_ack_recovery(config: configuration::AegisConfig, level: &str) -> anyhow::Result<ExitCode> {
    let target = parse_circuit_level(level)?;

    let db_pool = connect().await?;
    let store: Arc<dyn database::StateStore> = Arc::new(PostgresStateStore::new(db_pool));
    let (event_tx, _) = broadcast::channel(16);

    match EngineRuntime::ack_recovery(store, config, event_tx, target).await {
        Ok(()) => {
            tracing::info!(level = %level, "recovery acknowledged");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            tracing::error!(error = %e, "recovery acknowledgement refused");
            Ok(ExitCode::from(1))
        }
    }
}

async fn handle_clear_kill_flag(config: configuration::AegisConfig) -> anyhow::Result<ExitCode> {
    let db_pool = connect().await?;
    let store: Arc<dyn database::StateStore> = Arc::new(PostgresStateStore::new(db_pool));
    let (event_tx, _) = broadcast::channel(16);

    EngineRuntime::clear_kill_flag(store, config, event_tx).await?;
    tracing::info!("kill flag cleared");
    Ok(ExitCode::SUCCESS)
}

fn parse_circuit_level(level: &str) -> anyhow::Result<CircuitLevel> {
    match level.to_lowercase().as_str() {
        "caution" => Ok(CircuitLevel::Caution),
        "warning" => Ok(CircuitLevel::Warning),
        "alert" => Ok(CircuitLevel::Alert),
        "emergency" => Ok(CircuitLevel::Emergency),
        other => anyhow::bail!("unrecognized circuit level `{other}` (expected caution, warning, alert, or emergency)"),
    }
}

fn write_pid_file() -> anyhow::Result<()> {
    std::fs::write("aegis.pid", std::process::id().to_string())?;
    Ok(())
}

fn remove_pid_file() {
    let _ = std::fs::remove_file("aegis.pid");
}

/// Waits for either `Ctrl+C` or `SIGTERM`, whichever arrives first.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
