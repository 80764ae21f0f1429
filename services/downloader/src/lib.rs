//! Wind dataset downloader library.
//!
//! This crate fetches the GFS pressure-level files of one model run from a
//! remote source, unpacks them into a grid store build and commits the
//! build into the data directory. The [`daemon`] follows new runs as they
//! are issued.

pub mod config;
pub mod daemon;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod server;
pub mod source;
pub mod worker;

pub use config::DownloaderConfig;
pub use daemon::{build_once, latest_build_time, DownloadDaemon};
pub use error::{DownloadError, Result};
pub use orchestrator::DatasetDownloader;
pub use progress::{BuildProgress, ProgressSnapshot};
pub use server::StatusBoard;
pub use source::{FileSource, HttpSource, SourceConnection};
