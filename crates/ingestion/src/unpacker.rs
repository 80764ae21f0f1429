//! Two-pass GRIB2 record unpacking.
//!
//! Pass one checks every record in a file against the build's axes, the
//! coverage bitmap and the file's expected contents. Only when the whole
//! file validates does pass two copy its records into the [`BuildSink`].

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use grib2_parser::{Grib2Message, Grib2Reader};
use tracing::{debug, info, trace};
use wind_common::{GridAxes, PressureFamily, RecordKey, RecordName, Variable};

use crate::error::{Result, UnpackError};
use crate::outputs::BuildSink;

/// The records a source file must contain, exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileExpectation {
    pub hour: u32,
    pub records: BTreeSet<RecordName>,
}

impl FileExpectation {
    pub fn for_file(axes: &GridAxes, hour: u32, family: &PressureFamily) -> Self {
        Self {
            hour,
            records: axes.file_records(hour, family),
        }
    }
}

/// Notification sent after each record is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackEvent {
    /// A message outside the dataset was passed over.
    Skipped,
    /// Pass one accepted a record.
    Checked(RecordName),
    /// Pass two wrote a record.
    Committed(RecordName),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackSummary {
    /// Every message in the file.
    pub messages: usize,
    /// Records written to the sink.
    pub records: usize,
    /// Messages outside the dataset.
    pub skipped: usize,
}

/// A record accepted by pass one.
struct Planned {
    message: Grib2Message,
    name: RecordName,
    key: RecordKey,
}

/// Validates source files against an axis configuration and unpacks them
/// into a [`BuildSink`].
#[derive(Debug, Clone)]
pub struct Unpacker {
    axes: Arc<GridAxes>,
}

impl Unpacker {
    pub fn new(axes: Arc<GridAxes>) -> Self {
        Self { axes }
    }

    pub fn axes(&self) -> &Arc<GridAxes> {
        &self.axes
    }

    /// Unpack one source file.
    ///
    /// On any validation error the sink is left untouched. Errors from the
    /// second pass leave it partially written and are always fatal.
    pub fn unpack(
        &self,
        data: Bytes,
        sink: &mut BuildSink,
        expectation: Option<&FileExpectation>,
        progress: &mut dyn FnMut(UnpackEvent),
    ) -> Result<UnpackSummary> {
        let (planned, mut summary) = self.check(data, sink, expectation, progress)?;

        for record in planned {
            let values = self.store_order(&record)?;
            sink.commit(&record.key, &values, &record.message.raw)?;
            summary.records += 1;
            trace!(record = %record.name, "Unpacked record");
            progress(UnpackEvent::Committed(record.name));
        }

        debug!(
            messages = summary.messages,
            records = summary.records,
            skipped = summary.skipped,
            "Unpacked file"
        );
        Ok(summary)
    }

    fn check(
        &self,
        data: Bytes,
        sink: &BuildSink,
        expectation: Option<&FileExpectation>,
        progress: &mut dyn FnMut(UnpackEvent),
    ) -> Result<(Vec<Planned>, UnpackSummary)> {
        let mut reader = Grib2Reader::new(data);
        let mut summary = UnpackSummary::default();
        let mut seen = BTreeSet::new();
        let mut planned = Vec::new();

        while let Some(message) = reader.next_message()? {
            summary.messages += 1;
            let Some((variable, pressure)) = self.interesting(&message) else {
                summary.skipped += 1;
                progress(UnpackEvent::Skipped);
                continue;
            };

            let hour = message.forecast_hours().ok_or_else(|| {
                UnpackError::UnexpectedRecord(format!(
                    "({}, {}) has a forecast time in fractional hours",
                    pressure,
                    variable.name()
                ))
            })?;
            let name = RecordName::new(hour, pressure, variable);

            if !seen.insert(name) {
                return Err(UnpackError::DuplicateRecord(name));
            }
            if let Some(expected) = expectation {
                if hour != expected.hour {
                    return Err(UnpackError::HourMismatch {
                        record: name.to_string(),
                        expected: expected.hour,
                        actual: hour,
                    });
                }
            }
            let key = self.axes.record_key(&name).ok_or_else(|| {
                UnpackError::UnexpectedRecord(format!("{} (hour not on axis)", name))
            })?;
            if sink.coverage.is_set(&key) {
                return Err(UnpackError::DuplicateRecord(name));
            }
            if let Some(expected) = expectation {
                if !expected.records.contains(&name) {
                    return Err(UnpackError::UnexpectedRecord(name.to_string()));
                }
            }
            if planned.is_empty() {
                self.check_axes(&message, name)?;
            }

            let values = message.unpack_data()?;
            if values.len() != self.axes.field_len() {
                return Err(UnpackError::ShapeMismatch {
                    record: name,
                    expected: self.axes.field_len(),
                    actual: values.len(),
                });
            }

            trace!(record = %name, "Checked record");
            progress(UnpackEvent::Checked(name));
            planned.push(Planned { message, name, key });
        }

        if let Some(expected) = expectation {
            let missing: Vec<RecordName> = expected
                .records
                .iter()
                .filter(|name| !seen.contains(*name))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(UnpackError::MissingRecords(missing));
            }
        }

        Ok((planned, summary))
    }

    /// The variable and pressure of a record the dataset stores.
    fn interesting(&self, message: &Grib2Message) -> Option<(Variable, u32)> {
        let (discipline, category, number) = message.parameter();
        let variable = Variable::from_grib(discipline, category, number)?;
        let pressure = message.pressure_mb()?;
        self.axes.pressure_index(pressure)?;
        Some((variable, pressure))
    }

    /// Rows must run north to south and columns west to east, covering
    /// exactly the latitude and longitude axes.
    fn check_axes(&self, message: &Grib2Message, record: RecordName) -> Result<()> {
        let grid = &message.grid_definition;
        let lat = self.axes.latitude();
        let lon = self.axes.longitude();
        let micro = |step: f64| (step * 1e6).round() as i64;

        let checks: [(&str, i64, i64); 9] = [
            ("ni", grid.ni as i64, lon.count as i64),
            ("nj", grid.nj as i64, lat.count as i64),
            ("la1", grid.la1 as i64, lat.micro_degrees(lat.count - 1)),
            ("la2", grid.la2 as i64, lat.micro_degrees(0)),
            ("lo1", grid.lo1 as i64, lon.micro_degrees(0)),
            ("lo2", grid.lo2 as i64, lon.micro_degrees(lon.count - 1)),
            ("di", grid.di as i64, micro(lon.step)),
            ("dj", grid.dj as i64, micro(lat.step)),
            ("scanning mode", grid.scanning_mode as i64, 0),
        ];
        for (field, actual, expected) in checks {
            if actual != expected {
                return Err(UnpackError::AxisMismatch {
                    record,
                    reason: format!("{} is {}, expected {}", field, actual, expected),
                });
            }
        }
        Ok(())
    }

    /// Field values with latitude rows reversed into ascending order.
    fn store_order(&self, record: &Planned) -> Result<Vec<f64>> {
        let values = record
            .message
            .unpack_data()
            .map_err(|e| UnpackError::Inconsistent(format!("{}: {}", record.name, e)))?;
        let nlon = self.axes.longitude().count;
        Ok(values.chunks_exact(nlon).rev().flatten().copied().collect())
    }
}

/// Rebuild a grid store from a mirror file.
///
/// The mirror is unpacked with no per-file expectation into a new store at
/// `store_path`; the build must come out complete.
pub fn unpack_mirror(mirror_path: &Path, store_path: &Path, axes: Arc<GridAxes>) -> Result<UnpackSummary> {
    let data = Bytes::from(std::fs::read(mirror_path)?);
    let store = grid_store::GridStore::create(store_path, axes.clone())?;
    let mut sink = BuildSink::new(axes.clone(), Some(store), None)?;

    let summary = Unpacker::new(axes).unpack(data, &mut sink, None, &mut |_| {})?;
    let missing = sink.coverage().missing();
    sink.close()?;
    if !missing.is_empty() {
        return Err(UnpackError::MissingRecords(missing));
    }

    info!(
        mirror = %mirror_path.display(),
        store = %store_path.display(),
        records = summary.records,
        "Rebuilt grid store from mirror"
    );
    Ok(summary)
}
