//! Error types for the ingestion crate.

use thiserror::Error;
use wind_common::RecordName;

/// Errors raised while validating or unpacking a source file.
#[derive(Error, Debug)]
pub enum UnpackError {
    #[error("Record {0} already unpacked")]
    DuplicateRecord(RecordName),

    #[error("Record {record} has forecast hour {actual}, file is for hour {expected}")]
    HourMismatch {
        record: String,
        expected: u32,
        actual: u32,
    },

    #[error("Unexpected record: {0}")]
    UnexpectedRecord(String),

    #[error("{} records missing from file", .0.len())]
    MissingRecords(Vec<RecordName>),

    #[error("Unexpected axes on record {record}: {reason}")]
    AxisMismatch { record: RecordName, reason: String },

    #[error("Record {record} has {actual} values, expected {expected}")]
    ShapeMismatch {
        record: RecordName,
        expected: usize,
        actual: usize,
    },

    #[error("Failed to decode GRIB2 data: {0}")]
    Decode(String),

    #[error("No build outputs enabled")]
    NoOutputs,

    #[error("Validated record failed to unpack: {0}")]
    Inconsistent(String),

    #[error("Grid store error: {0}")]
    Store(#[from] grid_store::StoreError),

    #[error("Failed to write file: {0}")]
    Io(#[from] std::io::Error),
}

impl UnpackError {
    /// Whether the error leaves the build in a state no retry can repair.
    ///
    /// Everything else describes a bad source file, which may be fetched
    /// again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            UnpackError::DuplicateRecord(_)
                | UnpackError::NoOutputs
                | UnpackError::Inconsistent(_)
                | UnpackError::Store(_)
                | UnpackError::Io(_)
        )
    }
}

impl From<grib2_parser::Grib2Error> for UnpackError {
    fn from(err: grib2_parser::Grib2Error) -> Self {
        UnpackError::Decode(err.to_string())
    }
}

/// Result type for ingestion operations.
pub type Result<T> = std::result::Result<T, UnpackError>;
