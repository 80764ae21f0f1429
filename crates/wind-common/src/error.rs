//! Error types for shared geometry and naming.

use thiserror::Error;

/// Result type alias using CommonError.
pub type CommonResult<T> = Result<T, CommonError>;

#[derive(Debug, Error)]
pub enum CommonError {
    #[error("Invalid build time: {0}")]
    InvalidBuildTime(String),

    #[error("Invalid grid axes: {0}")]
    InvalidAxes(String),
}
