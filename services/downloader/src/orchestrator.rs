//! One dataset build from start to commit.
//!
//! A [`DatasetDownloader`] owns a temporary `download.*` directory inside
//! the data directory, fills the build sink there with a pool of
//! [`Worker`]s and, on [`close`](DatasetDownloader::close), either renames
//! the finished artifacts into place or throws them away.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ingestion::{BuildSink, SinkFiles, Unpacker};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use wind_common::{BuildTime, GridAxes, SUFFIX_GRIBMIRROR};

use crate::config::DownloaderConfig;
use crate::error::{DownloadError, Result};
use crate::progress::BuildProgress;
use crate::queue::{WorkItem, WorkQueue};
use crate::source::FileSource;
use crate::worker::{BuildContext, Worker};

/// Prefix of temporary build directories.
pub const TEMP_DIR_PREFIX: &str = "download.";

pub struct DatasetDownloader {
    config: Arc<DownloaderConfig>,
    axes: Arc<GridAxes>,
    source: Arc<dyn FileSource>,
    build_time: BuildTime,
    directory: PathBuf,
    deadline: DateTime<Utc>,
    progress: Arc<BuildProgress>,
    sink: Arc<Mutex<Option<BuildSink>>>,
    temp_dir: Option<TempDir>,
    success: bool,
}

impl DatasetDownloader {
    pub fn new(
        config: Arc<DownloaderConfig>,
        axes: Arc<GridAxes>,
        source: Arc<dyn FileSource>,
        build_time: BuildTime,
        directory: impl Into<PathBuf>,
    ) -> Self {
        let deadline = config.deadline.deadline(&build_time, Utc::now());
        let files_total = axes.hours().count * axes.families().len();
        Self {
            config,
            axes,
            source,
            build_time,
            directory: directory.into(),
            deadline,
            progress: Arc::new(BuildProgress::new(files_total)),
            sink: Arc::new(Mutex::new(None)),
            temp_dir: None,
            success: false,
        }
    }

    pub fn build_time(&self) -> BuildTime {
        self.build_time
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn progress(&self) -> Arc<BuildProgress> {
        self.progress.clone()
    }

    /// Whether [`download`](Self::download) completed the build.
    pub fn succeeded(&self) -> bool {
        self.success
    }

    /// Create the temporary directory and the build outputs inside it.
    pub fn open(&mut self) -> Result<()> {
        if self.temp_dir.is_some() {
            return Err(DownloadError::State(format!(
                "build {} is already open",
                self.build_time
            )));
        }

        let temp_dir = tempfile::Builder::new()
            .prefix(TEMP_DIR_PREFIX)
            .tempdir_in(&self.directory)?;
        let sink = BuildSink::create(temp_dir.path(), self.axes.clone(), self.config.outputs)?;
        info!(
            build = %self.build_time,
            temp_dir = %temp_dir.path().display(),
            deadline = %self.deadline,
            "Opened build"
        );

        self.sink = Arc::new(Mutex::new(Some(sink)));
        self.temp_dir = Some(temp_dir);
        Ok(())
    }

    /// Fetch and unpack every file of the build.
    ///
    /// Succeeds only if every record arrived before the deadline. A fatal
    /// error from any worker stops them all and is returned.
    pub async fn download(&mut self) -> Result<()> {
        if Utc::now() >= self.deadline {
            return Err(DownloadError::DeadlinePassed(self.deadline));
        }
        if self.temp_dir.is_none() {
            return Err(DownloadError::State("download before open".to_string()));
        }

        let context = Arc::new(BuildContext {
            build_time: self.build_time,
            timing: self.config.timing.clone(),
            queue: WorkQueue::new(),
            sink: self.sink.clone(),
            progress: self.progress.clone(),
            unpacker: Unpacker::new(self.axes.clone()),
        });
        for hour in self.axes.hour_values() {
            for family in self.axes.families() {
                let file_name = self.config.source.file_name(&self.build_time, hour, family);
                context
                    .queue
                    .push(WorkItem::new(hour, file_name, family.flag.clone()))
                    .await;
            }
        }

        let addresses = self.source.resolve().await?;
        if addresses.is_empty() {
            return Err(DownloadError::Transport(
                "source host resolved to no addresses".to_string(),
            ));
        }

        let mut workers = JoinSet::new();
        let per_address = self.config.workers_per_address;
        for (id, address) in addresses
            .iter()
            .flat_map(|address| std::iter::repeat(*address).take(per_address))
            .enumerate()
        {
            let worker = Worker::new(id, address, self.source.clone(), context.clone());
            workers.spawn(worker.run());
        }
        info!(
            build = %self.build_time,
            files = self.progress.files_total(),
            addresses = addresses.len(),
            workers = workers.len(),
            "Started download"
        );

        let remaining = (self.deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        let outcome = tokio::select! {
            _ = self.progress.wait_complete() => Ok(()),
            _ = tokio::time::sleep(remaining) => {
                warn!(build = %self.build_time, deadline = %self.deadline, "Deadline reached");
                Ok(())
            }
            joined = workers.join_next() => match joined {
                Some(Ok(Err(e))) => Err(e),
                Some(Ok(Ok(()))) | None => {
                    Err(DownloadError::Worker("worker exited unexpectedly".to_string()))
                }
                Some(Err(e)) => Err(DownloadError::Worker(format!("worker task failed: {}", e))),
            },
        };

        workers.abort_all();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    warn!(error = %e, "Worker panicked");
                }
            }
        }
        if let Err(e) = outcome {
            warn!(build = %self.build_time, error = %e, "Download failed");
            return Err(e);
        }

        // Waits for an unpack still running on the blocking pool.
        let sink = self.sink.lock().await;
        let sink = sink
            .as_ref()
            .ok_or_else(|| DownloadError::State("build sink closed during download".to_string()))?;
        let records_missing = sink.coverage().missing().len();
        if records_missing > 0 || !self.progress.is_complete() {
            return Err(DownloadError::IncompleteBuild {
                build_time: self.build_time,
                files_complete: self.progress.files_complete(),
                files_total: self.progress.files_total(),
                records_missing,
            });
        }

        self.success = true;
        info!(
            build = %self.build_time,
            records = sink.coverage().count(),
            "Download complete"
        );
        Ok(())
    }

    /// Finish the build, consuming the downloader.
    ///
    /// With `commit` the artifacts are renamed to their final names and
    /// their paths returned; otherwise they are deleted. `None` commits
    /// only if [`download`](Self::download) succeeded. The temporary
    /// directory is removed either way.
    pub async fn close(mut self, commit: Option<bool>) -> Result<Option<SinkFiles>> {
        let commit = commit.unwrap_or(self.success);
        let sink = self.sink.lock().await.take();
        let temp_dir = self.temp_dir.take();

        let committed = match (sink, commit) {
            (Some(sink), true) => {
                let files = sink.close()?;
                let committed = SinkFiles {
                    store: self.move_into_place(files.store.as_deref(), "")?,
                    mirror: self.move_into_place(files.mirror.as_deref(), SUFFIX_GRIBMIRROR)?,
                };
                info!(build = %self.build_time, store = ?committed.store, mirror = ?committed.mirror, "Committed build");
                Some(committed)
            }
            (None, true) => {
                return Err(DownloadError::State(format!(
                    "build {} was never opened",
                    self.build_time
                )))
            }
            (sink, false) => {
                drop(sink);
                info!(build = %self.build_time, "Discarded build");
                None
            }
        };

        if let Some(temp_dir) = temp_dir {
            debug!(path = %temp_dir.path().display(), "Removing temporary directory");
            temp_dir.close()?;
        }
        Ok(committed)
    }

    fn move_into_place(&self, from: Option<&Path>, suffix: &str) -> Result<Option<PathBuf>> {
        let Some(from) = from else {
            return Ok(None);
        };
        let to = self.build_time.artifact_path(&self.directory, suffix);
        std::fs::rename(from, &to)?;
        Ok(Some(to))
    }
}

impl Drop for DatasetDownloader {
    fn drop(&mut self) {
        if self.temp_dir.is_some() {
            warn!(build = %self.build_time, "Build dropped without close, discarding");
            if let Ok(mut sink) = self.sink.try_lock() {
                sink.take();
            }
        }
    }
}
