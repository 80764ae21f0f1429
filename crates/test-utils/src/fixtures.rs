//! Common test fixtures for the wind dataset.
//!
//! A tiny grid keeps store files a few kilobytes while still exercising
//! two pressure families, several forecast hours and interpolation in
//! every axis.

use std::collections::BTreeSet;

use chrono::{TimeZone, Utc};
use wind_common::{BuildTime, GridAxes, PressureFamily, RecordName, Variable};

use crate::grib::Grib2Builder;

/// Build time used by fixtures: 2014-06-03 12Z.
pub fn fixture_build_time() -> BuildTime {
    BuildTime::floor(Utc.with_ymd_and_hms(2014, 6, 3, 12, 0, 0).unwrap())
}

/// Hours 0, 3, 6; families `""` = [1000, 500] and `"b"` = [850];
/// latitude -1.0..=1.0 and longitude 0.0..=1.5, both at 0.5 degrees.
pub fn tiny_axes() -> GridAxes {
    GridAxes::builder()
        .hours(3, 3)
        .family("", vec![1000, 500])
        .family("b", vec![850])
        .latitude(-1.0, 0.5, 5)
        .longitude(0.0, 0.5, 4)
        .build()
        .unwrap()
}

/// Deterministic integer value for a cell, indexed by axis positions.
///
/// Heights increase with the level index so they are monotone along the
/// pressure axis, as real geopotential heights are.
pub fn fixture_value(hour: usize, level: usize, variable: Variable, lat: usize, lon: usize) -> f32 {
    let (h, l, i, j) = (hour as f32, level as f32, lat as f32, lon as f32);
    match variable {
        Variable::Height => 1000.0 * l + 10.0 * h + i + 2.0 * j,
        Variable::WindU => 10.0 * l + h + 2.0 * i + j,
        Variable::WindV => l - h - i + 3.0 * j,
    }
}

/// Field values of a record in GRIB scan order (north to south rows).
pub fn fixture_field(axes: &GridAxes, name: &RecordName) -> Vec<f32> {
    let key = axes.record_key(name).unwrap();
    let (nlat, nlon) = (axes.latitude().count, axes.longitude().count);
    let mut values = Vec::with_capacity(nlat * nlon);
    for row in 0..nlat {
        let lat = nlat - 1 - row;
        for lon in 0..nlon {
            values.push(fixture_value(key.hour, key.level, key.variable, lat, lon));
        }
    }
    values
}

/// One GRIB2 message holding the fixture field of `name`.
pub fn record_message(axes: &GridAxes, name: &RecordName) -> Vec<u8> {
    Grib2Builder::for_axes(axes)
        .with_reference_time(fixture_build_time().time())
        .with_record(name)
        .with_data(fixture_field(axes, name))
        .build()
}

/// A record the unpacker should skip: 2 m temperature above ground.
pub fn uninteresting_message(axes: &GridAxes, hour: u32) -> Vec<u8> {
    Grib2Builder::for_axes(axes)
        .with_reference_time(fixture_build_time().time())
        .with_parameter(0, 0)
        .with_level(103, 2)
        .with_forecast_hour(hour)
        .with_constant_value(288.0)
        .build()
}

/// A complete source file for `hour` and `family`, including one record
/// outside the dataset.
pub fn file_bytes(axes: &GridAxes, hour: u32, family: &PressureFamily) -> Vec<u8> {
    file_bytes_without(axes, hour, family, &BTreeSet::new())
}

/// A source file with the records in `omit` left out.
pub fn file_bytes_without(
    axes: &GridAxes,
    hour: u32,
    family: &PressureFamily,
    omit: &BTreeSet<RecordName>,
) -> Vec<u8> {
    let mut bytes = uninteresting_message(axes, hour);
    for name in axes.file_records(hour, family) {
        if !omit.contains(&name) {
            bytes.extend(record_message(axes, &name));
        }
    }
    bytes
}

/// Remote file name used by the downloader for `hour` and `family`.
pub fn gfs_file_name(build_time: &BuildTime, hour: u32, family: &PressureFamily) -> String {
    format!(
        "gfs.t{:02}z.pgrb2{}.0p50.f{:03}",
        build_time.cycle(),
        family.flag,
        hour
    )
}
