//! Common types shared across the wind dataset crates.
//!
//! The grid geometry ([`GridAxes`]) is constructed once and shared by `Arc`
//! between the downloader, the unpacker and the grid store. Build times and
//! artifact naming live in [`time`].

pub mod axes;
pub mod error;
pub mod time;

pub use axes::{
    GridAxes, GridAxesBuilder, GridIndex, PressureFamily, RecordKey, RecordName, RegularAxis,
    Variable,
};
pub use error::{CommonError, CommonResult};
pub use time::{list_artifacts, Artifact, BuildTime, SUFFIX_GRIBMIRROR};
