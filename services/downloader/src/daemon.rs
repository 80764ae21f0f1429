//! Continuous download of each new build as it is issued.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ingestion::SinkFiles;
use metrics::counter;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};
use wind_common::{list_artifacts, BuildTime, GridAxes};

use crate::config::DownloaderConfig;
use crate::error::{DownloadError, Result};
use crate::orchestrator::{DatasetDownloader, TEMP_DIR_PREFIX};
use crate::server::StatusBoard;
use crate::source::FileSource;

/// The most recent build that should have started appearing by `now`.
pub fn latest_build_time(now: DateTime<Utc>, availability_delay: chrono::Duration) -> BuildTime {
    BuildTime::floor(now - availability_delay)
}

/// Open, download and close one build, reporting it on `board`.
///
/// The build is committed only if the download succeeded. Returns the
/// committed artifact paths.
pub async fn build_once(
    config: Arc<DownloaderConfig>,
    axes: Arc<GridAxes>,
    source: Arc<dyn FileSource>,
    build_time: BuildTime,
    directory: &Path,
    board: &StatusBoard,
) -> Result<SinkFiles> {
    let mut downloader = DatasetDownloader::new(config, axes, source, build_time, directory);
    board
        .build_started(build_time, downloader.deadline(), downloader.progress())
        .await;

    let downloaded = match downloader.open() {
        Ok(()) => downloader.download().await,
        Err(e) => Err(e),
    };
    let closed = downloader.close(None).await;

    let outcome = match (downloaded, closed) {
        (Ok(()), Ok(Some(files))) => Ok(files),
        (Ok(()), Ok(None)) => Err(DownloadError::State(format!(
            "build {} was not committed",
            build_time
        ))),
        (Ok(()), Err(e)) => Err(e),
        (Err(e), closed) => {
            if let Err(close_error) = closed {
                warn!(build = %build_time, error = %close_error, "Failed to discard build");
            }
            Err(e)
        }
    };

    match &outcome {
        Ok(_) => {
            counter!("downloader_builds_total", "outcome" => "committed").increment(1);
            board.build_finished(build_time, None).await;
        }
        Err(e) => {
            counter!("downloader_builds_total", "outcome" => e.kind()).increment(1);
            board.build_finished(build_time, Some(e.to_string())).await;
        }
    }
    outcome
}

/// Downloads every build in turn, keeping the newest few on disk.
pub struct DownloadDaemon {
    config: Arc<DownloaderConfig>,
    axes: Arc<GridAxes>,
    source: Arc<dyn FileSource>,
    directory: PathBuf,
    board: Arc<StatusBoard>,
}

impl DownloadDaemon {
    pub fn new(
        config: Arc<DownloaderConfig>,
        axes: Arc<GridAxes>,
        source: Arc<dyn FileSource>,
        directory: impl Into<PathBuf>,
        board: Arc<StatusBoard>,
    ) -> Self {
        Self {
            config,
            axes,
            source,
            directory: directory.into(),
            board,
        }
    }

    /// Keep the newest `num_datasets` committed builds and remove every
    /// other artifact and leftover temporary directory.
    ///
    /// Returns the newest build kept.
    pub fn clean_directory(&self) -> std::io::Result<Option<BuildTime>> {
        let committed = list_artifacts(&self.directory, Some(&[""]))?;
        let keep: Vec<BuildTime> = committed
            .iter()
            .rev()
            .map(|artifact| artifact.build_time)
            .take(self.config.daemon.num_datasets)
            .collect();

        let mut kept = Vec::new();
        let mut removed = Vec::new();
        for artifact in list_artifacts(&self.directory, None)? {
            if keep.contains(&artifact.build_time) {
                kept.push(artifact.file_name);
            } else {
                std::fs::remove_file(&artifact.path)?;
                removed.push(artifact.file_name);
            }
        }
        info!(?kept, ?removed, "Cleaned data directory");

        for entry in std::fs::read_dir(&self.directory)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(TEMP_DIR_PREFIX) && entry.file_type()?.is_dir() {
                warn!(path = %entry.path().display(), "Removing stale temporary directory");
                std::fs::remove_dir_all(entry.path())?;
            }
        }

        if let Some(newest) = keep.first() {
            debug!(build = %newest, "Newest build on disk");
        }
        Ok(keep.first().copied())
    }

    /// Download builds until `shutdown` fires.
    #[instrument(skip_all, fields(directory = %self.directory.display()))]
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let delay = self.config.daemon.availability_delay();
        let newest = self.clean_directory()?;
        let latest = latest_build_time(Utc::now(), delay);

        let mut next = match newest {
            Some(newest) if newest >= latest => newest.next(),
            _ => latest,
        };

        loop {
            let expected = next.time() + delay;
            let wait = (expected - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if wait > Duration::ZERO {
                info!(build = %next, until = %expected, wait_secs = wait.as_secs(), "Waiting for build");
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.recv() => {
                        info!("Shutting down daemon");
                        return Ok(());
                    }
                }
            }

            info!(build = %next, "Downloading build");
            tokio::select! {
                outcome = build_once(
                    self.config.clone(),
                    self.axes.clone(),
                    self.source.clone(),
                    next,
                    &self.directory,
                    &self.board,
                ) => match outcome {
                    Ok(files) => info!(build = %next, store = ?files.store, "Build committed"),
                    Err(e) => error!(build = %next, error = %e, "Failed to download build"),
                },
                _ = shutdown.recv() => {
                    info!(build = %next, "Shutting down daemon, abandoning build");
                    return Ok(());
                }
            }

            if let Err(e) = self.clean_directory() {
                warn!(error = %e, "Failed to clean data directory");
            }
            next = next.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::net::SocketAddr;

    use crate::source::SourceConnection;

    struct NoSource;

    #[async_trait]
    impl FileSource for NoSource {
        async fn resolve(&self) -> Result<Vec<SocketAddr>> {
            Ok(Vec::new())
        }

        fn connect(&self, _address: SocketAddr) -> Result<Box<dyn SourceConnection>> {
            Err(DownloadError::Transport("no source".to_string()))
        }
    }

    fn daemon(directory: &Path, num_datasets: usize) -> DownloadDaemon {
        let mut config = DownloaderConfig::default();
        config.daemon.num_datasets = num_datasets;
        DownloadDaemon::new(
            Arc::new(config),
            Arc::new(test_utils::tiny_axes()),
            Arc::new(NoSource),
            directory,
            Arc::new(StatusBoard::new()),
        )
    }

    #[test]
    fn test_latest_build_time() {
        let delay = chrono::Duration::minutes(210);
        let at = |h, m| Utc.with_ymd_and_hms(2014, 6, 3, h, m, 0).unwrap();

        assert_eq!(latest_build_time(at(15, 30), delay).to_string(), "2014060312");
        assert_eq!(latest_build_time(at(15, 29), delay).to_string(), "2014060306");
        assert_eq!(latest_build_time(at(2, 0), delay).to_string(), "2014060218");
    }

    #[test]
    fn test_clean_directory_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "2014060300",
            "2014060300.gribmirror",
            "2014060306",
            "2014060312",
            "2014060312.gribmirror",
            "2014060318.gribmirror",
            "README",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("download.abc123")).unwrap();
        std::fs::write(dir.path().join("download.abc123").join("dataset"), b"").unwrap();

        let newest = daemon(dir.path(), 2).clean_directory().unwrap();
        assert_eq!(newest.map(|b| b.to_string()), Some("2014060312".to_string()));

        let mut remaining: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        remaining.sort();
        assert_eq!(
            remaining,
            vec!["2014060306", "2014060312", "2014060312.gribmirror", "README"]
        );
    }

    #[test]
    fn test_clean_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(daemon(dir.path(), 1).clean_directory().unwrap(), None);
    }

    #[tokio::test]
    async fn test_build_once_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let board = StatusBoard::new();
        let build_time = BuildTime::parse("2014060312").unwrap();
        let mut config = DownloaderConfig::default();
        config.deadline.at = Some(Utc::now() + chrono::Duration::hours(1));

        let result = build_once(
            Arc::new(config),
            Arc::new(test_utils::tiny_axes()),
            Arc::new(NoSource),
            build_time,
            dir.path(),
            &board,
        )
        .await;

        assert!(matches!(result, Err(DownloadError::Transport(_))));
        let outcome = board.last_outcome().await.unwrap();
        assert!(!outcome.succeeded);
        assert_eq!(outcome.build_time, "2014060312");
        // The temporary directory is gone and nothing was committed.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
