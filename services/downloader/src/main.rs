//! Wind dataset downloader service.
//!
//! Downloads GFS pressure-level builds with:
//! - One worker pool per build, pinned across the source's addresses
//! - Retry with per-file delays and per-worker server backoff
//! - Atomic commit of finished builds into the data directory
//! - Daemon mode following each new model run
//! - HTTP status API for monitoring

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::broadcast;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use wind_common::{BuildTime, GridAxes, SUFFIX_GRIBMIRROR};

use downloader::server::{self, ServerState};
use downloader::{build_once, DownloadDaemon, DownloaderConfig, FileSource, HttpSource, StatusBoard};

/// Suffix of a grid store rebuilt from its mirror.
const SUFFIX_REBUILT: &str = ".rebuilt";

#[derive(Parser, Debug)]
#[command(name = "downloader")]
#[command(about = "Wind dataset downloader")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Data directory holding committed builds
    #[arg(short, long, global = true, env = "WIND_DATA_DIR", default_value = "/srv/wind")]
    directory: PathBuf,

    /// YAML configuration file (defaults are used if absent)
    #[arg(short, long, global = true, env = "DOWNLOADER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Port for status HTTP server
    #[arg(long, global = true, env = "STATUS_PORT", default_value = "8081")]
    status_port: u16,

    /// Disable status HTTP server
    #[arg(long, global = true)]
    no_status_server: bool,

    /// Serve Prometheus metrics on their own port instead of /metrics
    #[arg(long, global = true, env = "METRICS_PORT")]
    metrics_port: Option<u16>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a single build (YYYYMMDDHH) and commit it on success
    Download { build_time: BuildTime },

    /// Download each new build as it is issued
    Daemon {
        /// Committed builds to keep on disk
        #[arg(short, long)]
        num_datasets: Option<usize>,
    },

    /// Rebuild a grid store from a committed build's mirror
    UnpackMirror { build_time: BuildTime },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => DownloaderConfig::load(path)?,
        None => DownloaderConfig::default(),
    };
    if let Command::Daemon {
        num_datasets: Some(n),
    } = args.command
    {
        config.daemon.num_datasets = n;
    }
    config.validate()?;
    let config = Arc::new(config);
    let axes = Arc::new(GridAxes::gfs_half_degree());

    std::fs::create_dir_all(&args.directory).with_context(|| {
        format!(
            "Failed to create data directory: {}",
            args.directory.display()
        )
    })?;

    if let Command::UnpackMirror { build_time } = args.command {
        let mirror = build_time.artifact_path(&args.directory, SUFFIX_GRIBMIRROR);
        let rebuilt = build_time.artifact_path(&args.directory, SUFFIX_REBUILT);
        info!(mirror = %mirror.display(), output = %rebuilt.display(), "Rebuilding grid store from mirror");

        let summary = tokio::task::spawn_blocking(move || {
            ingestion::unpack_mirror(&mirror, &rebuilt, axes)
        })
        .await?
        .with_context(|| format!("Failed to rebuild {} from its mirror", build_time))?;
        info!(records = summary.records, "Rebuild complete");
        return Ok(());
    }

    info!(directory = %args.directory.display(), host = %config.source.host, "Starting wind dataset downloader");

    // Initialize Prometheus metrics exporter
    let metrics = match args.metrics_port {
        Some(port) => {
            PrometheusBuilder::new()
                .with_http_listener(([0, 0, 0, 0], port))
                .install()
                .context("Failed to install Prometheus exporter")?;
            None
        }
        None => Some(
            PrometheusBuilder::new()
                .install_recorder()
                .context("Failed to install Prometheus recorder")?,
        ),
    };

    let board = Arc::new(StatusBoard::new());
    if !args.no_status_server {
        let server_state = Arc::new(ServerState {
            board: board.clone(),
            metrics,
        });
        let status_port = args.status_port;
        tokio::spawn(async move {
            if let Err(e) = server::run_server(server_state, status_port).await {
                error!(error = %e, "Status server failed");
            }
        });
    }

    let source: Arc<dyn FileSource> = Arc::new(HttpSource::new(
        config.source.clone(),
        config.timing.attempt_timeout(),
    ));

    // Shutdown signal
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        shutdown_tx_clone.send(()).ok();
    });

    match args.command {
        Command::Download { build_time } => {
            let mut shutdown = shutdown_tx.subscribe();
            tokio::select! {
                result = build_once(config, axes, source, build_time, &args.directory, &board) => {
                    let files = result.with_context(|| format!("Failed to download build {}", build_time))?;
                    info!(build = %build_time, store = ?files.store, mirror = ?files.mirror, "Build committed");
                }
                _ = shutdown.recv() => {
                    info!(build = %build_time, "Interrupted, build discarded");
                }
            }
        }
        Command::Daemon { .. } => {
            let daemon = DownloadDaemon::new(config, axes, source, args.directory.clone(), board);
            daemon.run(shutdown_tx.subscribe()).await?;
        }
        Command::UnpackMirror { .. } => {}
    }

    Ok(())
}
