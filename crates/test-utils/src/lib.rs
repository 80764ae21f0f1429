//! Shared test utilities for the wind dataset workspace.
//!
//! This crate provides common testing infrastructure including:
//! - A synthetic GRIB2 message builder with simple and complex packing
//! - A tiny grid geometry with deterministic field values
//! - Temporary data directories
//!
//! # Usage
//!
//! Add to your crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { path = "../test-utils" }
//! ```

pub mod fixtures;
pub mod grib;

// Re-export commonly used items at the crate root
pub use fixtures::*;
pub use grib::{Grib2Builder, Packing};

/// A temporary data directory, removed when dropped.
pub fn temp_data_dir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("wind-data-")
        .tempdir()
        .unwrap()
}

/// Assert two floating point values are within `tolerance`.
#[macro_export]
macro_rules! assert_close {
    ($left:expr, $right:expr) => {
        $crate::assert_close!($left, $right, 1e-9)
    };
    ($left:expr, $right:expr, $tolerance:expr) => {{
        let (left, right) = ($left as f64, $right as f64);
        assert!(
            (left - right).abs() <= $tolerance,
            "assertion failed: {} is not within {} of {}",
            left,
            $tolerance,
            right
        );
    }};
}
