//! Build progress, readable while the build runs.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::Notify;

/// Counters updated by workers and read by the orchestrator and the
/// status API.
#[derive(Debug, Default)]
pub struct BuildProgress {
    files_total: AtomicUsize,
    files_complete: AtomicUsize,
    records_processed: AtomicU64,
    bytes_fetched: AtomicU64,
    have_first_file: AtomicBool,
    completed: Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub files_total: usize,
    pub files_complete: usize,
    pub percent: f64,
    pub records_processed: u64,
    pub bytes_fetched: u64,
    pub have_first_file: bool,
}

impl BuildProgress {
    pub fn new(files_total: usize) -> Self {
        let progress = Self::default();
        progress.files_total.store(files_total, Ordering::SeqCst);
        progress
    }

    pub fn set_total(&self, files_total: usize) {
        self.files_total.store(files_total, Ordering::SeqCst);
    }

    /// Record one more file unpacked. Returns the number complete.
    pub fn file_complete(&self) -> usize {
        self.have_first_file.store(true, Ordering::SeqCst);
        let complete = self.files_complete.fetch_add(1, Ordering::SeqCst) + 1;
        if self.is_complete() {
            self.completed.notify_one();
        }
        complete
    }

    pub fn record_processed(&self) {
        self.records_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_fetched.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn have_first_file(&self) -> bool {
        self.have_first_file.load(Ordering::SeqCst)
    }

    pub fn files_total(&self) -> usize {
        self.files_total.load(Ordering::SeqCst)
    }

    pub fn files_complete(&self) -> usize {
        self.files_complete.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        self.files_complete() >= self.files_total()
    }

    /// Wait until every file is complete.
    pub async fn wait_complete(&self) {
        loop {
            let completed = self.completed.notified();
            if self.is_complete() {
                return;
            }
            completed.await;
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let files_total = self.files_total();
        let files_complete = self.files_complete();
        let percent = if files_total == 0 {
            0.0
        } else {
            files_complete as f64 / files_total as f64 * 100.0
        };
        ProgressSnapshot {
            files_total,
            files_complete,
            percent,
            records_processed: self.records_processed.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            have_first_file: self.have_first_file(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_snapshot_percent() {
        let progress = BuildProgress::new(4);
        assert!(!progress.have_first_file());
        progress.file_complete();
        progress.record_processed();

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.files_complete, 1);
        assert_eq!(snapshot.percent, 25.0);
        assert_eq!(snapshot.records_processed, 1);
        assert!(snapshot.have_first_file);
    }

    #[tokio::test]
    async fn test_wait_complete_wakes_on_last_file() {
        let progress = Arc::new(BuildProgress::new(2));
        let waiter = {
            let progress = progress.clone();
            tokio::spawn(async move { progress.wait_complete().await })
        };

        progress.file_complete();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        progress.file_complete();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
