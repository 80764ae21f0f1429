//! Wind dataset ingestion.
//!
//! Turns downloaded GRIB2 source files into records of a dataset build:
//!
//! - [`Unpacker`] checks a file against the build's axes, the coverage
//!   bitmap and the file's [`FileExpectation`], then copies its records
//! - [`BuildSink`] holds the outputs a build writes to: the grid store,
//!   the GRIB mirror and the coverage bitmap
//! - [`unpack_mirror`] rebuilds a grid store from a mirror file

pub mod error;
pub mod mirror;
pub mod outputs;
pub mod unpacker;

// Re-exports
pub use error::{Result, UnpackError};
pub use mirror::Mirror;
pub use outputs::{BuildOutputs, BuildSink, SinkFiles, STORE_FILE_NAME};
pub use unpacker::{unpack_mirror, FileExpectation, UnpackEvent, UnpackSummary, Unpacker};
