//! Whole builds against an in-memory source serving fixture files.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use downloader::config::TimingConfig;
use downloader::{DatasetDownloader, DownloadError, DownloaderConfig, FileSource, SourceConnection};
use grid_store::GridStore;
use ingestion::UnpackError;
use test_utils::{
    file_bytes, file_bytes_without, fixture_build_time, fixture_value, gfs_file_name,
    record_message, tiny_axes,
};
use wind_common::{BuildTime, GridAxes, GridIndex, RecordName, Variable};

// ============================================================================
// Fake source
// ============================================================================

/// How a scripted fetch fails.
#[derive(Debug, Clone, Copy)]
enum Failure {
    /// Never answers, so the attempt times out.
    Hang,
    /// Connection reset.
    Transport,
}

#[derive(Default)]
struct SourceState {
    files: HashMap<String, Bytes>,
    /// Fetches answered "not found" before a file appears.
    hidden: HashMap<String, usize>,
    /// Failures of the first fetches of a file, in order.
    failures: HashMap<String, Vec<Failure>>,
    /// Every fetch, in order.
    fetches: Mutex<Vec<(String, Instant)>>,
    connects: AtomicUsize,
}

impl SourceState {
    /// The answer to a fetch, or `None` if the source never answers.
    fn fetch(&self, file_name: &str) -> Option<downloader::Result<Bytes>> {
        let mut fetches = self.fetches.lock().unwrap();
        let previous = fetches.iter().filter(|(name, _)| name == file_name).count();
        fetches.push((file_name.to_string(), Instant::now()));

        match self.failures.get(file_name).and_then(|f| f.get(previous)) {
            Some(Failure::Hang) => return None,
            Some(Failure::Transport) => {
                return Some(Err(DownloadError::Transport(format!(
                    "connection reset fetching {}",
                    file_name
                ))))
            }
            None => {}
        }
        if previous < self.hidden.get(file_name).copied().unwrap_or(0) {
            return Some(Err(DownloadError::NotFound(file_name.to_string())));
        }
        Some(
            self.files
                .get(file_name)
                .cloned()
                .ok_or_else(|| DownloadError::NotFound(file_name.to_string())),
        )
    }

    /// Gaps between consecutive fetches of `file_name`.
    fn fetch_gaps(&self, file_name: &str) -> Vec<Duration> {
        self.fetch_times(file_name)
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }

    fn fetch_times(&self, file_name: &str) -> Vec<Instant> {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == file_name)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[derive(Clone)]
struct FakeSource {
    state: Arc<SourceState>,
    addresses: usize,
}

struct FakeConnection {
    state: Arc<SourceState>,
}

#[async_trait]
impl FileSource for FakeSource {
    async fn resolve(&self) -> downloader::Result<Vec<SocketAddr>> {
        Ok((0..self.addresses)
            .map(|i| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 2100 + i as u16))
            .collect())
    }

    fn connect(&self, _address: SocketAddr) -> downloader::Result<Box<dyn SourceConnection>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            state: self.state.clone(),
        }))
    }
}

#[async_trait]
impl SourceConnection for FakeConnection {
    async fn fetch(&mut self, _build_time: &BuildTime, file_name: &str) -> downloader::Result<Bytes> {
        match self.state.fetch(file_name) {
            Some(answer) => answer,
            None => std::future::pending().await,
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Every file of the fixture build, complete.
fn all_files(axes: &GridAxes) -> HashMap<String, Bytes> {
    let build_time = fixture_build_time();
    let mut files = HashMap::new();
    for hour in axes.hour_values() {
        for family in axes.families() {
            files.insert(
                gfs_file_name(&build_time, hour, family),
                Bytes::from(file_bytes(axes, hour, family)),
            );
        }
    }
    files
}

fn file_name(axes: &GridAxes, hour: u32, flag: &str) -> String {
    gfs_file_name(&fixture_build_time(), hour, axes.family(flag).unwrap())
}

fn test_config(deadline: Duration, workers_per_address: usize) -> DownloaderConfig {
    let mut config = DownloaderConfig::default();
    config.timing = TimingConfig {
        attempt_timeout_secs: 5.0,
        first_file_delay_secs: 1.0,
        retry_delay_secs: 0.1,
        backoff_base_secs: 0.01,
        max_backoff_exponent: 4,
        bad_download_retry_limit: 1,
    };
    config.deadline.at = Some(Utc::now() + chrono::Duration::from_std(deadline).unwrap());
    config.workers_per_address = workers_per_address;
    config
}

fn new_downloader(
    config: DownloaderConfig,
    state: SourceState,
    addresses: usize,
    directory: &Path,
) -> (DatasetDownloader, Arc<SourceState>) {
    let state = Arc::new(state);
    let source = FakeSource {
        state: state.clone(),
        addresses,
    };
    let downloader = DatasetDownloader::new(
        Arc::new(config),
        Arc::new(tiny_axes()),
        Arc::new(source),
        fixture_build_time(),
        directory,
    );
    (downloader, state)
}

fn directory_entries(directory: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(directory)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_full_build_commits_store_and_mirror() {
    let dir = tempfile::tempdir().unwrap();
    let axes = tiny_axes();
    let state = SourceState {
        files: all_files(&axes),
        ..Default::default()
    };
    let (mut downloader, _) = new_downloader(test_config(Duration::from_secs(30), 2), state, 2, dir.path());

    downloader.open().unwrap();
    downloader.download().await.unwrap();
    assert!(downloader.succeeded());

    let progress = downloader.progress().snapshot();
    assert_eq!(progress.files_total, 6);
    assert_eq!(progress.files_complete, 6);
    assert_eq!(progress.records_processed, 27);
    assert!(progress.have_first_file);

    let files = downloader.close(None).await.unwrap().unwrap();
    assert_eq!(files.store, Some(dir.path().join("2014060312")));
    assert_eq!(files.mirror, Some(dir.path().join("2014060312.gribmirror")));
    assert_eq!(
        directory_entries(dir.path()),
        vec!["2014060312", "2014060312.gribmirror"]
    );

    let axes = Arc::new(axes);
    let store = GridStore::open_read_only(dir.path().join("2014060312"), axes.clone()).unwrap();
    let [hours, levels, _, nlat, nlon] = axes.shape();
    for hour in 0..hours {
        for level in 0..levels {
            for variable in Variable::ALL {
                for lat in 0..nlat {
                    for lon in 0..nlon {
                        let index = GridIndex {
                            hour,
                            level,
                            variable,
                            lat,
                            lon,
                        };
                        assert_eq!(
                            store.read(&index).unwrap(),
                            fixture_value(hour, level, variable, lat, lon) as f64
                        );
                    }
                }
            }
        }
    }
}

#[tokio::test]
async fn test_missing_record_is_incomplete_at_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let axes = tiny_axes();
    let mut files = all_files(&axes);
    let omit: BTreeSet<RecordName> = [RecordName::new(6, 850, Variable::Height)].into();
    files.insert(
        file_name(&axes, 6, "b"),
        Bytes::from(file_bytes_without(&axes, 6, axes.family("b").unwrap(), &omit)),
    );

    let mut config = test_config(Duration::from_millis(1500), 2);
    config.timing.bad_download_retry_limit = 1000;
    let (mut downloader, _) = new_downloader(config, SourceState { files, ..Default::default() }, 1, dir.path());

    downloader.open().unwrap();
    match downloader.download().await {
        Err(DownloadError::IncompleteBuild {
            files_complete,
            files_total,
            records_missing,
            ..
        }) => {
            assert_eq!(files_complete, 5);
            assert_eq!(files_total, 6);
            // The short file is rejected whole.
            assert_eq!(records_missing, 3);
        }
        other => panic!("expected IncompleteBuild, got {:?}", other),
    }
    assert!(!downloader.succeeded());

    assert_eq!(downloader.close(None).await.unwrap(), None);
    assert!(directory_entries(dir.path()).is_empty());
}

#[tokio::test]
async fn test_bad_file_retry_limit_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let axes = tiny_axes();
    let bad = file_name(&axes, 3, "");
    let mut files = all_files(&axes);
    let omit: BTreeSet<RecordName> = [RecordName::new(3, 500, Variable::WindV)].into();
    files.insert(
        bad.clone(),
        Bytes::from(file_bytes_without(&axes, 3, axes.family("").unwrap(), &omit)),
    );

    let (mut downloader, state) = new_downloader(
        test_config(Duration::from_secs(30), 2),
        SourceState { files, ..Default::default() },
        1,
        dir.path(),
    );

    downloader.open().unwrap();
    match downloader.download().await {
        Err(DownloadError::BadFile { file, source }) => {
            assert_eq!(file, bad);
            assert!(matches!(source, UnpackError::MissingRecords(_)));
        }
        other => panic!("expected BadFile, got {:?}", other),
    }
    // One first attempt plus one retry.
    assert_eq!(state.fetch_times(&bad).len(), 2);

    assert_eq!(downloader.close(None).await.unwrap(), None);
    assert!(directory_entries(dir.path()).is_empty());
}

#[tokio::test]
async fn test_not_found_retried_with_shorter_delay_after_first_file() {
    let dir = tempfile::tempdir().unwrap();
    let axes = tiny_axes();
    let late = file_name(&axes, 0, "");
    let state = SourceState {
        files: all_files(&axes),
        hidden: [(late.clone(), 2)].into(),
        ..Default::default()
    };

    // A single worker takes files strictly in queue order: the hour 0
    // file of the default family is missing before anything has arrived,
    // and again after its sibling has.
    let (mut downloader, state) = new_downloader(test_config(Duration::from_secs(30), 1), state, 1, dir.path());
    downloader.open().unwrap();
    downloader.download().await.unwrap();

    let times = state.fetch_times(&late);
    assert_eq!(times.len(), 3);
    let before_first_file = times[1] - times[0];
    let after_first_file = times[2] - times[1];
    assert!(before_first_file >= Duration::from_secs(1));
    assert!(after_first_file >= Duration::from_millis(100));
    assert!(after_first_file < before_first_file);

    assert!(downloader.close(Some(true)).await.unwrap().is_some());
}

#[tokio::test]
async fn test_timeout_backs_off_at_least_one_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let axes = tiny_axes();
    let slow = file_name(&axes, 0, "");
    let state = SourceState {
        files: all_files(&axes),
        failures: [(slow.clone(), vec![Failure::Hang, Failure::Hang])].into(),
        ..Default::default()
    };

    // 0.25 s attempts over a 1/16 s base: exponent ceil(log2 4) + 1 = 3,
    // which the transport cap does not limit, so each timeout is followed
    // by a 0.5 s server sleep.
    let mut config = test_config(Duration::from_secs(30), 1);
    config.timing.attempt_timeout_secs = 0.25;
    config.timing.backoff_base_secs = 0.0625;
    config.timing.max_backoff_exponent = 1;
    let (mut downloader, state) = new_downloader(config, state, 1, dir.path());
    downloader.open().unwrap();
    downloader.download().await.unwrap();

    let gaps = state.fetch_gaps(&slow);
    assert_eq!(gaps.len(), 2);
    for gap in gaps {
        assert!(gap >= Duration::from_millis(750), "gap {:?}", gap);
        // The exponent is not raised again by a repeated timeout.
        assert!(gap < Duration::from_millis(1100), "gap {:?}", gap);
    }
    // Each timeout drops the connection.
    assert_eq!(state.connects.load(Ordering::SeqCst), 3);
    assert_eq!(downloader.progress().files_complete(), 6);

    assert!(downloader.close(None).await.unwrap().is_some());
}

#[tokio::test]
async fn test_transport_backoff_grows_to_cap_and_resets_after_success() {
    let dir = tempfile::tempdir().unwrap();
    let axes = tiny_axes();
    let flaky = file_name(&axes, 0, "");
    let next = file_name(&axes, 0, "b");
    let state = SourceState {
        files: all_files(&axes),
        failures: [
            (flaky.clone(), vec![Failure::Transport; 3]),
            (next.clone(), vec![Failure::Transport]),
        ]
        .into(),
        ..Default::default()
    };

    // Server sleeps of 0.125 s * 2^exponent, with the exponent capped at 2.
    let mut config = test_config(Duration::from_secs(30), 1);
    config.timing.backoff_base_secs = 0.125;
    config.timing.max_backoff_exponent = 2;
    let (mut downloader, state) = new_downloader(config, state, 1, dir.path());
    downloader.open().unwrap();
    downloader.download().await.unwrap();

    let gaps = state.fetch_gaps(&flaky);
    assert_eq!(gaps.len(), 3);
    assert!(gaps[0] >= Duration::from_millis(250) && gaps[0] < Duration::from_millis(500));
    assert!(gaps[1] >= Duration::from_millis(500));
    assert!(gaps[2] >= Duration::from_millis(500) && gaps[2] < Duration::from_millis(1000));

    // The next file starts again from the first step.
    let gaps = state.fetch_gaps(&next);
    assert_eq!(gaps.len(), 1);
    assert!(gaps[0] >= Duration::from_millis(250) && gaps[0] < Duration::from_millis(500));

    // One connection per failure plus the first.
    assert_eq!(state.connects.load(Ordering::SeqCst), 5);
    assert!(downloader.close(None).await.unwrap().is_some());
}

#[tokio::test]
async fn test_duplicate_record_from_another_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let axes = tiny_axes();
    let mut files = all_files(&axes);

    // The hour 3 "b" file repeats a record of the hour 3 default file,
    // which a single worker has already committed.
    let repeated = RecordName::new(3, 1000, Variable::Height);
    let mut bytes = file_bytes(&axes, 3, axes.family("b").unwrap());
    bytes.extend(record_message(&axes, &repeated));
    files.insert(file_name(&axes, 3, "b"), Bytes::from(bytes));

    let (mut downloader, _) = new_downloader(
        test_config(Duration::from_secs(30), 1),
        SourceState { files, ..Default::default() },
        1,
        dir.path(),
    );
    downloader.open().unwrap();
    match downloader.download().await {
        Err(DownloadError::Unpack(UnpackError::DuplicateRecord(name))) => {
            assert_eq!(name, repeated);
        }
        other => panic!("expected DuplicateRecord, got {:?}", other),
    }
    assert_eq!(downloader.progress().files_complete(), 3);

    assert_eq!(downloader.close(None).await.unwrap(), None);
    assert!(directory_entries(dir.path()).is_empty());
}

#[tokio::test]
async fn test_deadline_already_passed() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(Duration::from_secs(30), 2);
    config.deadline.at = Some(Utc::now() - chrono::Duration::seconds(1));
    let (mut downloader, state) = new_downloader(config, SourceState::default(), 1, dir.path());

    downloader.open().unwrap();
    assert!(matches!(
        downloader.download().await,
        Err(DownloadError::DeadlinePassed(_))
    ));
    assert!(state.fetches.lock().unwrap().is_empty());
    assert_eq!(downloader.close(None).await.unwrap(), None);
}

#[tokio::test]
async fn test_drop_without_close_discards() {
    let dir = tempfile::tempdir().unwrap();
    let (mut downloader, _) = new_downloader(
        test_config(Duration::from_secs(30), 1),
        SourceState::default(),
        1,
        dir.path(),
    );

    downloader.open().unwrap();
    let entries = directory_entries(dir.path());
    assert_eq!(entries.len(), 1);
    assert!(entries[0].starts_with("download."));

    drop(downloader);
    assert!(directory_entries(dir.path()).is_empty());
}
