//! Grid geometry of the wind dataset.
//!
//! The dataset is a dense 5-axis lattice: forecast hour, pressure level,
//! variable, latitude and longitude. Every coordinate used by the unpacker,
//! the coverage bitmap and the store is expressed against one immutable
//! [`GridAxes`] value.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};

/// Pressure levels (mb) carried by the primary `pgrb2` files.
pub const GFS_PRIMARY_PRESSURES: [u32; 26] = [
    10, 20, 30, 50, 70, 100, 150, 200, 250, 300, 350, 400, 450, 500, 550, 600, 650, 700, 750, 800,
    850, 900, 925, 950, 975, 1000,
];

/// Pressure levels (mb) carried by the secondary `pgrb2b` files.
pub const GFS_SECONDARY_PRESSURES: [u32; 21] = [
    1, 2, 3, 5, 7, 125, 175, 225, 275, 325, 375, 425, 475, 525, 575, 625, 675, 725, 775, 825, 875,
];

/// Tolerance used when locating a coordinate at the very end of an axis.
const AXIS_EPSILON: f64 = 1e-9;

/// Atmospheric variables stored per (hour, level).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variable {
    /// Geopotential height (gpm)
    Height,
    /// Eastward wind component (m/s)
    WindU,
    /// Northward wind component (m/s)
    WindV,
}

impl Variable {
    pub const ALL: [Variable; 3] = [Variable::Height, Variable::WindU, Variable::WindV];

    /// Position of this variable on the variable axis.
    pub fn index(self) -> usize {
        match self {
            Self::Height => 0,
            Self::WindU => 1,
            Self::WindV => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Height => "height",
            Self::WindU => "wind_u",
            Self::WindV => "wind_v",
        }
    }

    /// GRIB2 (discipline, category, number) of this variable.
    pub fn grib_parameter(self) -> (u8, u8, u8) {
        match self {
            Self::Height => (0, 3, 5),
            Self::WindU => (0, 2, 2),
            Self::WindV => (0, 2, 3),
        }
    }

    /// Identify a variable from its GRIB2 (discipline, category, number).
    pub fn from_grib(discipline: u8, category: u8, number: u8) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.grib_parameter() == (discipline, category, number))
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An evenly spaced axis: `start + i * step` for `i` in `0..count`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegularAxis {
    pub start: f64,
    pub step: f64,
    pub count: usize,
}

impl RegularAxis {
    pub fn new(start: f64, step: f64, count: usize) -> Self {
        Self { start, step, count }
    }

    pub fn value(&self, index: usize) -> f64 {
        self.start + self.step * index as f64
    }

    pub fn last(&self) -> f64 {
        self.value(self.count - 1)
    }

    /// Axis value in GRIB2 micro-degrees.
    pub fn micro_degrees(&self, index: usize) -> i64 {
        (self.value(index) * 1e6).round() as i64
    }

    /// Locate `value` between two grid points.
    ///
    /// Returns the lower index and the fractional distance to the next
    /// point. A value on the final grid point resolves to the last pair
    /// with a fraction of one. Values outside the axis return `None`.
    pub fn locate(&self, value: f64) -> Option<(usize, f64)> {
        let position = (value - self.start) / self.step;
        let end = (self.count - 1) as f64;
        if !position.is_finite() || position < -AXIS_EPSILON || position > end + AXIS_EPSILON {
            return None;
        }
        let position = position.clamp(0.0, end);
        let lower = (position.floor() as usize).min(self.count - 2);
        Some((lower, position - lower as f64))
    }

    /// Index of a value lying exactly on the axis.
    pub fn index_of(&self, value: f64) -> Option<usize> {
        let position = (value - self.start) / self.step;
        let rounded = position.round();
        if (position - rounded).abs() > AXIS_EPSILON || rounded < 0.0 {
            return None;
        }
        let index = rounded as usize;
        (index < self.count).then_some(index)
    }
}

/// A family of pressure levels delivered together in one source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PressureFamily {
    /// File-name flag identifying the family (`""` or `"b"` for GFS).
    pub flag: String,
    /// Pressure levels in millibars.
    pub levels: Vec<u32>,
}

/// Position of a single cell in the dense tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridIndex {
    pub hour: usize,
    pub level: usize,
    pub variable: Variable,
    pub lat: usize,
    pub lon: usize,
}

/// Position of one record (a full lat/lon field) on the first three axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub hour: usize,
    pub level: usize,
    pub variable: Variable,
}

/// Axis values identifying a record: forecast hour, pressure (mb), variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordName {
    pub hour: u32,
    pub pressure: u32,
    pub variable: Variable,
}

impl RecordName {
    pub fn new(hour: u32, pressure: u32, variable: Variable) -> Self {
        Self {
            hour,
            pressure,
            variable,
        }
    }
}

impl fmt::Display for RecordName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.hour, self.pressure, self.variable)
    }
}

/// The immutable lattice definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridAxes {
    hours: RegularAxis,
    pressures: Vec<u32>,
    families: Vec<PressureFamily>,
    latitude: RegularAxis,
    longitude: RegularAxis,
}

impl GridAxes {
    /// GFS 0.5 degree pressure-level geometry: 65 × 47 × 3 × 361 × 720.
    pub fn gfs_half_degree() -> Self {
        let families = vec![
            PressureFamily {
                flag: String::new(),
                levels: GFS_PRIMARY_PRESSURES.to_vec(),
            },
            PressureFamily {
                flag: "b".to_string(),
                levels: GFS_SECONDARY_PRESSURES.to_vec(),
            },
        ];
        let mut pressures: Vec<u32> = families.iter().flat_map(|f| f.levels.clone()).collect();
        pressures.sort_unstable_by(|a, b| b.cmp(a));

        Self {
            hours: RegularAxis::new(0.0, 3.0, 65),
            pressures,
            families,
            latitude: RegularAxis::new(-90.0, 0.5, 361),
            longitude: RegularAxis::new(0.0, 0.5, 720),
        }
    }

    pub fn builder() -> GridAxesBuilder {
        GridAxesBuilder::default()
    }

    pub fn hours(&self) -> &RegularAxis {
        &self.hours
    }

    /// Forecast hour values in axis order.
    pub fn hour_values(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.hours.count).map(|i| self.hours.value(i) as u32)
    }

    /// Pressure levels in axis order (descending pressure, ascending height).
    pub fn pressures(&self) -> &[u32] {
        &self.pressures
    }

    pub fn families(&self) -> &[PressureFamily] {
        &self.families
    }

    pub fn family(&self, flag: &str) -> Option<&PressureFamily> {
        self.families.iter().find(|f| f.flag == flag)
    }

    pub fn latitude(&self) -> &RegularAxis {
        &self.latitude
    }

    pub fn longitude(&self) -> &RegularAxis {
        &self.longitude
    }

    /// Tensor dimensions in storage order.
    pub fn shape(&self) -> [usize; 5] {
        [
            self.hours.count,
            self.pressures.len(),
            Variable::ALL.len(),
            self.latitude.count,
            self.longitude.count,
        ]
    }

    pub fn cell_count(&self) -> usize {
        self.shape().iter().product()
    }

    /// Exact size in bytes of a store file for this geometry.
    pub fn byte_len(&self) -> u64 {
        self.cell_count() as u64 * std::mem::size_of::<f64>() as u64
    }

    /// Number of cells in a single record (one lat/lon field).
    pub fn field_len(&self) -> usize {
        self.latitude.count * self.longitude.count
    }

    /// Number of records in a complete build.
    pub fn record_count(&self) -> usize {
        self.hours.count * self.pressures.len() * Variable::ALL.len()
    }

    pub fn hour_index(&self, hour: u32) -> Option<usize> {
        self.hours.index_of(hour as f64)
    }

    pub fn pressure_index(&self, pressure: u32) -> Option<usize> {
        self.pressures.iter().position(|&p| p == pressure)
    }

    pub fn record_key(&self, name: &RecordName) -> Option<RecordKey> {
        Some(RecordKey {
            hour: self.hour_index(name.hour)?,
            level: self.pressure_index(name.pressure)?,
            variable: name.variable,
        })
    }

    pub fn record_name(&self, key: &RecordKey) -> RecordName {
        RecordName {
            hour: self.hours.value(key.hour) as u32,
            pressure: self.pressures[key.level],
            variable: key.variable,
        }
    }

    /// Linear position of a record in the coverage bitmap.
    pub fn record_offset(&self, key: &RecordKey) -> usize {
        (key.hour * self.pressures.len() + key.level) * Variable::ALL.len() + key.variable.index()
    }

    /// Linear position of the first cell of a record in the tensor.
    pub fn field_offset(&self, key: &RecordKey) -> usize {
        self.record_offset(key) * self.field_len()
    }

    /// Linear position of a cell in the tensor.
    pub fn cell_offset(&self, index: &GridIndex) -> usize {
        let key = RecordKey {
            hour: index.hour,
            level: index.level,
            variable: index.variable,
        };
        self.field_offset(&key) + index.lat * self.longitude.count + index.lon
    }

    /// Records a single source file for `hour` and `family` must contain.
    pub fn file_records(&self, hour: u32, family: &PressureFamily) -> BTreeSet<RecordName> {
        family
            .levels
            .iter()
            .flat_map(|&pressure| {
                Variable::ALL
                    .iter()
                    .map(move |&variable| RecordName::new(hour, pressure, variable))
            })
            .collect()
    }

    /// Every record a complete build must contain.
    pub fn required_records(&self) -> BTreeSet<RecordName> {
        self.hour_values()
            .flat_map(|hour| {
                self.families
                    .iter()
                    .flat_map(move |family| self.file_records(hour, family))
            })
            .collect()
    }
}

/// Builder for [`GridAxes`]; validates the geometry once in `build`.
#[derive(Debug, Default)]
pub struct GridAxesBuilder {
    hour_step: u32,
    hour_count: usize,
    families: Vec<PressureFamily>,
    latitude: Option<RegularAxis>,
    longitude: Option<RegularAxis>,
}

impl GridAxesBuilder {
    /// Forecast hours `0, step, 2*step, ...` (`count` values).
    pub fn hours(mut self, step: u32, count: usize) -> Self {
        self.hour_step = step;
        self.hour_count = count;
        self
    }

    pub fn family(mut self, flag: impl Into<String>, levels: Vec<u32>) -> Self {
        self.families.push(PressureFamily {
            flag: flag.into(),
            levels,
        });
        self
    }

    pub fn latitude(mut self, start: f64, step: f64, count: usize) -> Self {
        self.latitude = Some(RegularAxis::new(start, step, count));
        self
    }

    pub fn longitude(mut self, start: f64, step: f64, count: usize) -> Self {
        self.longitude = Some(RegularAxis::new(start, step, count));
        self
    }

    pub fn build(self) -> CommonResult<GridAxes> {
        let invalid = |msg: &str| CommonError::InvalidAxes(msg.to_string());

        if self.hour_step == 0 || self.hour_count < 2 {
            return Err(invalid("need at least two forecast hours with a non-zero step"));
        }
        if self.families.is_empty() || self.families.iter().any(|f| f.levels.is_empty()) {
            return Err(invalid("every pressure family needs at least one level"));
        }

        let mut pressures: Vec<u32> = self
            .families
            .iter()
            .flat_map(|f| f.levels.iter().copied())
            .collect();
        pressures.sort_unstable_by(|a, b| b.cmp(a));
        let total = pressures.len();
        pressures.dedup();
        if pressures.len() != total {
            return Err(invalid("pressure families overlap"));
        }
        if pressures.len() < 2 {
            return Err(invalid("need at least two pressure levels"));
        }

        let latitude = self.latitude.ok_or_else(|| invalid("latitude axis missing"))?;
        let longitude = self.longitude.ok_or_else(|| invalid("longitude axis missing"))?;
        for (name, axis) in [("latitude", &latitude), ("longitude", &longitude)] {
            if axis.count < 2 || !(axis.step > 0.0) {
                return Err(CommonError::InvalidAxes(format!(
                    "{} axis needs at least two points and a positive step",
                    name
                )));
            }
        }

        Ok(GridAxes {
            hours: RegularAxis::new(0.0, self.hour_step as f64, self.hour_count),
            pressures,
            families: self.families,
            latitude,
            longitude,
        })
    }
}
