//! Priority queue of files still to fetch.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// One file of a build, with its retry state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub hour: u32,
    /// Not to be fetched before this instant. `None` sorts first.
    pub sleep_until: Option<Instant>,
    pub file_name: String,
    /// Pressure family flag of the file.
    pub family: String,
    /// Bad copies of this file seen so far.
    pub bad_downloads: u32,
}

impl WorkItem {
    pub fn new(hour: u32, file_name: impl Into<String>, family: impl Into<String>) -> Self {
        Self {
            hour,
            sleep_until: None,
            file_name: file_name.into(),
            family: family.into(),
            bad_downloads: 0,
        }
    }

    pub fn delayed(self, until: Instant) -> Self {
        Self {
            sleep_until: Some(until),
            ..self
        }
    }
}

/// Earlier hours first; within an hour, files without a pending delay
/// first.
impl Ord for WorkItem {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.hour, self.sleep_until, &self.file_name, &self.family, self.bad_downloads).cmp(&(
            other.hour,
            other.sleep_until,
            &other.file_name,
            &other.family,
            other.bad_downloads,
        ))
    }
}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Shared min-queue of [`WorkItem`]s. Popping waits while it is empty.
#[derive(Debug, Default)]
pub struct WorkQueue {
    items: Mutex<BinaryHeap<Reverse<WorkItem>>>,
    available: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, item: WorkItem) {
        self.items.lock().await.push(Reverse(item));
        self.available.notify_one();
    }

    /// Remove the smallest item, waiting for one if the queue is empty.
    pub async fn pop(&self) -> WorkItem {
        loop {
            let available = self.available.notified();
            if let Some(Reverse(item)) = self.items.lock().await.pop() {
                return item;
            }
            available.await;
        }
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }
}
