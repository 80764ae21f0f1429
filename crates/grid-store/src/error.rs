//! Error types for the grid store.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using StoreError.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while creating, opening or writing a store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The file on disk does not have the size the axes require.
    #[error("store size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// A write was attempted on a read-only handle.
    #[error("store is read-only")]
    ReadOnly,

    /// The mapping cannot be viewed as 64-bit floats.
    #[error("invalid store layout: {0}")]
    Layout(String),

    /// A field does not have one value per lat/lon grid point.
    #[error("field has {actual} values, expected {expected}")]
    FieldLength { expected: usize, actual: usize },

    /// A record's coverage bit was already set.
    #[error("record {0} is already present")]
    DuplicateRecord(String),

    /// No committed store exists in the directory.
    #[error("no dataset found in {0}")]
    NoDataset(PathBuf),

    /// Storage/IO error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by [`GridStore::query`](crate::GridStore::query).
#[derive(Error, Debug)]
pub enum QueryError {
    /// The coordinate lies outside the declared range of an axis.
    #[error("{axis} {value} is outside the dataset")]
    OutOfRange { axis: &'static str, value: f64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}
