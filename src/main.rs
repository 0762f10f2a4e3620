//! # Time Capsule
//!
//! Schedule a message (with attachments) for delivery at a future moment.
//!
//! Usage:
//!   timecapsule serve                    # HTTP API + timers + periodic sweep
//!   timecapsule serve --port 8080        # Custom port
//!   timecapsule serve --ephemeral        # In-memory store, nothing persisted
//!   timecapsule sweep                    # One reconciliation pass, prints the report

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use timecapsule_core::{AppConfig, CapsuleStore};
use timecapsule_gateway::AppState;
use timecapsule_scheduler::{
    CapsuleService, DeliveryProcessor, MemoryStore, ReconciliationSweep, SqliteStore,
    TaskScheduler,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "timecapsule",
    version,
    about = "💊 Time Capsule — messages delivered at a future moment"
)]
struct Cli {
    /// Config file (default: ~/.timecapsule/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API with live timers and the periodic sweep
    Serve {
        /// Override `server.port`
        #[arg(short, long)]
        port: Option<u16>,

        /// Keep capsules in memory only
        #[arg(long)]
        ephemeral: bool,
    },
    /// Run one reconciliation sweep and print the report as JSON
    Sweep,
}

struct Runtime {
    service: Arc<CapsuleService>,
    sweep: Arc<ReconciliationSweep>,
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let config = match path {
        Some(p) => AppConfig::load_from(p)
            .with_context(|| format!("loading {}", p.display()))?
            .with_env_overrides(),
        None => AppConfig::load()?,
    };
    Ok(config)
}

fn build_runtime(config: &AppConfig, ephemeral: bool) -> Result<Runtime> {
    let store: Arc<dyn CapsuleStore> = if ephemeral {
        tracing::warn!("⚠️ Ephemeral mode: capsules are lost on exit");
        Arc::new(MemoryStore::new())
    } else {
        let path = config.database.resolved_path();
        tracing::info!("🗄️ Database: {}", path.display());
        Arc::new(SqliteStore::open(&path)?)
    };

    let gateway = timecapsule_channels::gateway_from_config(&config.smtp, &config.delivery)?;
    let processor = Arc::new(
        DeliveryProcessor::new(store, gateway).with_timeout(config.delivery.timeout()),
    );
    let sweep = Arc::new(ReconciliationSweep::new(
        processor.clone(),
        config.sweep.concurrency,
    ));
    let service = Arc::new(CapsuleService::new(TaskScheduler::new(processor)));

    Ok(Runtime { service, sweep })
}

async fn serve(config: AppConfig, port: Option<u16>, ephemeral: bool) -> Result<()> {
    let runtime = build_runtime(&config, ephemeral)?;

    let restored = runtime.service.restore().await?;
    if restored > 0 {
        tracing::info!("⏰ {} capsule(s) waiting for delivery", restored);
    }

    // Overdue capsules are not armed by restore; a sweep picks them up.
    let sweeper = if config.sweep.interval_secs > 0 {
        Some(tokio::spawn(timecapsule_scheduler::spawn_sweeper(
            runtime.sweep.clone(),
            std::time::Duration::from_secs(config.sweep.interval_secs),
        )))
    } else {
        let sweep = runtime.sweep.clone();
        tokio::spawn(async move {
            if let Err(e) = sweep.sweep(chrono::Utc::now()).await {
                tracing::error!("💥 Startup sweep failed: {e}");
            }
        });
        None
    };

    let scheduler = runtime.service.scheduler().clone();
    let state = AppState::new(
        runtime.service.clone(),
        runtime.sweep.clone(),
        config.sweep.cron_secret.clone(),
    );
    let port = port.unwrap_or(config.server.port);

    println!("💊 Time Capsule v{}", env!("CARGO_PKG_VERSION"));
    println!("   🌐 API:   http://{}:{}/api/v1/capsules", config.server.host, port);
    println!("   🧹 Cron:  http://{}:{}/api/cron", config.server.host, port);
    println!();

    timecapsule_gateway::start(state, &config.server.host, port, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("💥 Failed to listen for shutdown signal: {e}");
        }
        tracing::info!("👋 Shutting down");
    })
    .await?;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    scheduler.shutdown();
    Ok(())
}

async fn sweep_once(config: AppConfig) -> Result<()> {
    let runtime = build_runtime(&config, false)?;
    let report = runtime.sweep.sweep(chrono::Utc::now()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "timecapsule=debug,timecapsule_scheduler=debug,timecapsule_channels=debug,timecapsule_gateway=debug,tower_http=debug"
    } else {
        "timecapsule=info,timecapsule_scheduler=info,timecapsule_channels=info,timecapsule_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Serve { port, ephemeral } => serve(config, port, ephemeral).await,
        Command::Sweep => sweep_once(config).await,
    }
}
