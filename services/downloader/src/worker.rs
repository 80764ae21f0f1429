//! Download workers.
//!
//! Each worker is pinned to one source address and loops over the shared
//! [`WorkQueue`]: fetch a file, unpack it into the build sink, and on
//! failure put it back with a delay. Workers never exit on their own
//! except with a fatal error; the orchestrator aborts them when the build
//! finishes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ingestion::{BuildSink, FileExpectation, UnpackError, UnpackEvent, Unpacker};
use metrics::counter;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use wind_common::BuildTime;

use crate::config::TimingConfig;
use crate::error::{DownloadError, Result};
use crate::progress::BuildProgress;
use crate::queue::{WorkItem, WorkQueue};
use crate::source::{FileSource, SourceConnection};

/// State shared by every worker of one build.
pub struct BuildContext {
    pub build_time: BuildTime,
    pub timing: TimingConfig,
    pub queue: WorkQueue,
    /// `None` once the build has been closed.
    pub sink: Arc<Mutex<Option<BuildSink>>>,
    pub progress: Arc<BuildProgress>,
    pub unpacker: Unpacker,
}

pub struct Worker {
    id: usize,
    address: SocketAddr,
    source: Arc<dyn FileSource>,
    context: Arc<BuildContext>,
    connection: Option<Box<dyn SourceConnection>>,
    /// Server sleeps last `backoff_base * 2^backoff`.
    backoff: u32,
}

impl Worker {
    pub fn new(
        id: usize,
        address: SocketAddr,
        source: Arc<dyn FileSource>,
        context: Arc<BuildContext>,
    ) -> Self {
        Self {
            id,
            address,
            source,
            context,
            connection: None,
            backoff: 0,
        }
    }

    /// Work through the queue until aborted. Returns only on a fatal error.
    #[instrument(name = "worker", skip(self), fields(worker_id = self.id, address = %self.address))]
    pub async fn run(mut self) -> Result<()> {
        loop {
            let item = self.context.queue.pop().await;

            if let Some(until) = item.sleep_until {
                if until > Instant::now() {
                    debug!(file = %item.file_name, "Sleeping before retry");
                    self.close_connection();
                    tokio::time::sleep_until(until).await;
                }
            }

            let server_sleep = self.run_item(item).await?;
            if server_sleep > Duration::ZERO {
                self.close_connection();
                tokio::time::sleep(server_sleep).await;
            } else {
                // Let another worker pick up a file that was just requeued.
                tokio::task::yield_now().await;
            }
        }
    }

    /// Handle one item. Returns how long this worker should leave the
    /// server alone afterwards.
    async fn run_item(&mut self, item: WorkItem) -> Result<Duration> {
        let context = self.context.clone();
        let timing = &context.timing;
        debug!(file = %item.file_name, attempt = item.bad_downloads, "Downloading");

        let data = match self.fetch(&item).await {
            Ok(data) => data,
            Err(DownloadError::NotFound(file)) => {
                counter!("downloader_fetch_failures_total", "kind" => "not_found").increment(1);
                let delay = timing.not_found_delay(context.progress.have_first_file());
                info!(file = %file, delay_secs = delay.as_secs_f64(), "Not found, will retry");
                context.queue.push(item.delayed(Instant::now() + delay)).await;
                return Ok(Duration::ZERO);
            }
            Err(DownloadError::Timeout(file)) => {
                counter!("downloader_fetch_failures_total", "kind" => "timeout").increment(1);
                self.backoff = self.backoff.max(timing.timeout_exponent());
                let sleep = timing.server_sleep(self.backoff);
                warn!(file = %file, server_sleep_secs = sleep.as_secs_f64(), "Timed out");
                context.queue.push(item).await;
                return Ok(sleep);
            }
            Err(e @ (DownloadError::Transport(_) | DownloadError::Io(_))) => {
                counter!("downloader_fetch_failures_total", "kind" => e.kind()).increment(1);
                if self.backoff < timing.max_backoff_exponent {
                    self.backoff += 1;
                }
                let sleep = timing.server_sleep(self.backoff);
                if self.backoff >= 5 {
                    warn!(file = %item.file_name, error = %e, server_sleep_secs = sleep.as_secs_f64(), "Fetch failed");
                } else {
                    info!(file = %item.file_name, error = %e, server_sleep_secs = sleep.as_secs_f64(), "Fetch failed");
                }
                context.queue.push(item).await;
                return Ok(sleep);
            }
            Err(e) => return Err(e),
        };

        context.progress.add_bytes(data.len() as u64);
        counter!("downloader_bytes_fetched_total").increment(data.len() as u64);

        match self.unpack(&item, data).await? {
            Ok(()) => {
                self.backoff = 0;
                let complete = context.progress.file_complete();
                counter!("downloader_files_completed_total").increment(1);
                info!(
                    file = %item.file_name,
                    files_complete = complete,
                    files_total = context.progress.files_total(),
                    "File complete"
                );
            }
            Err(e) if e.is_fatal() => {
                warn!(file = %item.file_name, error = %e, "Fatal unpack error");
                return Err(DownloadError::Unpack(e));
            }
            Err(e) => {
                counter!("downloader_fetch_failures_total", "kind" => "bad_file").increment(1);
                if item.bad_downloads >= timing.bad_download_retry_limit {
                    warn!(file = %item.file_name, error = %e, "Bad file, retry limit reached");
                    return Err(DownloadError::BadFile {
                        file: item.file_name,
                        source: e,
                    });
                }
                let delay = timing.retry_delay();
                warn!(
                    file = %item.file_name,
                    error = %e,
                    attempt = item.bad_downloads + 1,
                    delay_secs = delay.as_secs_f64(),
                    "Bad file, will retry"
                );
                let retry = WorkItem {
                    bad_downloads: item.bad_downloads + 1,
                    ..item
                };
                context.queue.push(retry.delayed(Instant::now() + delay)).await;
            }
        }
        Ok(Duration::ZERO)
    }

    async fn fetch(&mut self, item: &WorkItem) -> Result<Bytes> {
        if self.connection.is_none() {
            debug!("Connecting");
            self.connection = Some(self.source.connect(self.address)?);
        }
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| DownloadError::State("no open connection".to_string()))?;

        let attempt = connection.fetch(&self.context.build_time, &item.file_name);
        match tokio::time::timeout(self.context.timing.attempt_timeout(), attempt).await {
            Ok(result) => result,
            Err(_) => Err(DownloadError::Timeout(item.file_name.clone())),
        }
    }

    /// Unpack `data` while holding the sink. The outer error is a failure
    /// of the worker itself; the inner one is the unpacker's verdict.
    async fn unpack(
        &mut self,
        item: &WorkItem,
        data: Bytes,
    ) -> Result<std::result::Result<(), UnpackError>> {
        let context = &self.context;
        let family = context
            .unpacker
            .axes()
            .family(&item.family)
            .ok_or_else(|| DownloadError::State(format!("unknown pressure family {:?}", item.family)))?;
        let expectation = FileExpectation::for_file(context.unpacker.axes(), item.hour, family);

        // The guard moves into the blocking task so that an aborted worker
        // still releases the sink only once unpacking has finished.
        let mut sink = context.sink.clone().lock_owned().await;
        let unpacker = context.unpacker.clone();
        let progress = context.progress.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            sink.as_mut().map(|sink| {
                unpacker
                    .unpack(data, sink, Some(&expectation), &mut |event| {
                        if let UnpackEvent::Committed(_) = event {
                            progress.record_processed();
                        }
                    })
                    .map(|_| ())
            })
        })
        .await
        .map_err(|e| DownloadError::Worker(format!("unpack task failed: {}", e)))?;

        outcome.ok_or_else(|| DownloadError::State("build already closed".to_string()))
    }

    fn close_connection(&mut self) {
        if self.connection.take().is_some() {
            debug!("Closed connection");
        }
    }
}
