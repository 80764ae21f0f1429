//! Dense on-disk wind tensor.
//!
//! A [`GridStore`] maps one file holding every (hour, level, variable,
//! latitude, longitude) cell of a build as native-endian `f64`. Builds are
//! written through a writable handle inside a temporary directory, then
//! renamed into place and opened read-only by consumers, who call
//! [`GridStore::query`] for interpolated wind.
//!
//! ```ignore
//! let store = GridStore::open_latest("/srv/wind", Arc::new(GridAxes::gfs_half_degree()))?;
//! let wind = store.query(12.0, 10_000.0, 52.2, 0.1)?;
//! ```

pub mod coverage;
pub mod error;
pub mod query;
pub mod store;

pub use coverage::CoverageBitmap;
pub use error::{QueryError, StoreError, StoreResult};
pub use query::WindSample;
pub use store::GridStore;
