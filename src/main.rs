use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use clipflow::api::{start_server, ApiState};
use clipflow::{
    CommandDownloader, CommandTransformer, EventBus, LoggingHandler, Orchestrator,
    OrchestratorConfig, RetentionReaper, SqliteStore,
};

#[derive(Parser)]
#[command(name = "clipflow", version, about = "Media-processing task orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator and its HTTP API.
    Serve {
        /// Address to bind the API on.
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,

        /// SQLite database file.
        #[arg(long, default_value = "./data/tasks.db")]
        db: PathBuf,

        /// Directory holding finished artifacts.
        #[arg(long, default_value = "./data/artifacts")]
        artifact_dir: PathBuf,

        /// Scratch directory for downloads and intermediates.
        #[arg(long, default_value = "./data/work")]
        work_dir: PathBuf,

        /// Maximum pipeline runs executing at once.
        #[arg(long, default_value_t = 2)]
        max_concurrent: usize,

        /// Hours to keep finished tasks before reaping.
        #[arg(long, default_value_t = 24)]
        retention_hours: u64,

        /// Seconds between retention sweeps.
        #[arg(long, default_value_t = 3600)]
        sweep_interval_secs: u64,

        /// Fetcher binary for the acquisition stage.
        #[arg(long, default_value = "yt-dlp")]
        fetcher: String,

        /// Encoder binary for the transform stage.
        #[arg(long, default_value = "ffmpeg")]
        encoder: String,
    },

    /// Run one retention sweep against the database and exit.
    Sweep {
        /// SQLite database file.
        #[arg(long, default_value = "./data/tasks.db")]
        db: PathBuf,

        /// Hours to keep finished tasks.
        #[arg(long, default_value_t = 24)]
        retention_hours: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Serve {
            bind,
            db,
            artifact_dir,
            work_dir,
            max_concurrent,
            retention_hours,
            sweep_interval_secs,
            fetcher,
            encoder,
        } => {
            if let Some(parent) = db.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let store = Arc::new(SqliteStore::open(&db).await?);

            let config = OrchestratorConfig::default()
                .with_max_concurrent_runs(max_concurrent)
                .with_retention(Duration::from_secs(retention_hours * 3600))
                .with_sweep_interval(Duration::from_secs(sweep_interval_secs))
                .with_artifact_dir(&artifact_dir)
                .with_work_dir(&work_dir);

            let downloader = Arc::new(CommandDownloader::new(&work_dir).with_program(fetcher));
            let transformer =
                Arc::new(CommandTransformer::new(&artifact_dir).with_program(encoder));

            let mut events = EventBus::new();
            events.register(Arc::new(LoggingHandler));

            let orchestrator =
                Orchestrator::start(config, store.clone(), downloader, transformer, events)
                    .await?;

            let state = ApiState {
                orchestrator: Arc::clone(&orchestrator),
            };
            tokio::select! {
                result = start_server(bind, state) => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested");
                }
            }

            orchestrator.shutdown();
            store.close().await;
        }

        Command::Sweep {
            db,
            retention_hours,
        } => {
            let store = Arc::new(SqliteStore::open(&db).await?);
            let reaper = RetentionReaper::new(store.clone());
            let removed = reaper
                .sweep(
                    SystemTime::now(),
                    Duration::from_secs(retention_hours * 3600),
                )
                .await?;
            tracing::info!(removed, "sweep finished");
            store.close().await;
        }
    }

    Ok(())
}
