//! Error types for the downloader.

use chrono::{DateTime, Utc};
use ingestion::UnpackError;
use thiserror::Error;
use wind_common::BuildTime;

/// Errors raised while fetching files or running a build.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("File not found on source: {0}")]
    NotFound(String),

    #[error("Timed out fetching {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Bad file {file}: {source}")]
    BadFile {
        file: String,
        #[source]
        source: UnpackError,
    },

    #[error("Build {build_time} incomplete: {files_complete}/{files_total} files, {records_missing} records missing")]
    IncompleteBuild {
        build_time: BuildTime,
        files_complete: usize,
        files_total: usize,
        records_missing: usize,
    },

    #[error("Deadline {0} already passed")]
    DeadlinePassed(DateTime<Utc>),

    #[error("Build state error: {0}")]
    State(String),

    #[error("Unpacking failed: {0}")]
    Unpack(#[from] UnpackError),

    #[error("Worker failed: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    /// Failure kind, as used in metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            DownloadError::NotFound(_) => "not_found",
            DownloadError::Timeout(_) => "timeout",
            DownloadError::Transport(_) => "transport",
            DownloadError::BadFile { .. } => "bad_file",
            DownloadError::IncompleteBuild { .. } => "incomplete_build",
            DownloadError::DeadlinePassed(_) => "deadline_passed",
            DownloadError::State(_) => "state",
            DownloadError::Unpack(_) => "unpack",
            DownloadError::Worker(_) => "worker",
            DownloadError::Io(_) => "io",
        }
    }
}

/// Result type for downloader operations.
pub type Result<T> = std::result::Result<T, DownloadError>;
