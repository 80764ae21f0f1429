//! GRIB2 parser implementation (WMO FM 92 GRIB Edition 2).
//!
//! This crate splits a GRIB2 file into messages, parses the sections the
//! wind dataset needs, and unpacks gridded values. Simple packing (5.0),
//! complex packing (5.2) and complex packing with spatial differencing
//! (5.3) are supported.

pub mod sections;
pub mod unpacking;

use bytes::Bytes;
use thiserror::Error;
use tracing::trace;

pub use sections::{
    Bitmap, DataRepresentation, DataSection, GridDefinition, Identification, Indicator,
    ProductDefinition,
};

/// Fixed surface type for isobaric levels (code table 4.5).
pub const SURFACE_ISOBARIC: u8 = 100;

#[derive(Debug, Error)]
pub enum Grib2Error {
    #[error("Invalid GRIB2 format: {0}")]
    InvalidFormat(String),

    #[error("Invalid section {section}: {reason}")]
    InvalidSection { section: u8, reason: String },

    #[error("Unsupported {what}: {value}")]
    Unsupported { what: &'static str, value: u32 },

    #[error("Unpacking error: {0}")]
    UnpackingError(String),
}

/// Iterates the messages of a GRIB2 file held in memory.
pub struct Grib2Reader {
    data: Bytes,
    offset: usize,
}

impl Grib2Reader {
    pub fn new(data: Bytes) -> Self {
        Self { data, offset: 0 }
    }

    /// Parse the next message, or `None` at the end of the file.
    pub fn next_message(&mut self) -> Result<Option<Grib2Message>, Grib2Error> {
        let remaining = &self.data[self.offset..];
        if remaining.is_empty() {
            return Ok(None);
        }

        let indicator = sections::parse_indicator(remaining)?;
        let length = usize::try_from(indicator.message_length).map_err(|_| {
            Grib2Error::InvalidFormat(format!(
                "message length {} does not fit in memory",
                indicator.message_length
            ))
        })?;
        if length < 16 + 4 || length > remaining.len() {
            return Err(Grib2Error::InvalidFormat(format!(
                "message at offset {} declares {} bytes but {} remain",
                self.offset,
                length,
                remaining.len()
            )));
        }
        if &remaining[length - 4..length] != b"7777" {
            return Err(Grib2Error::InvalidFormat(format!(
                "message at offset {} is missing its end marker",
                self.offset
            )));
        }

        let raw = self.data.slice(self.offset..self.offset + length);
        trace!(offset = self.offset, length, "Parsing GRIB2 message");
        self.offset += length;
        Grib2Message::parse(raw, indicator).map(Some)
    }
}

impl Iterator for Grib2Reader {
    type Item = Result<Grib2Message, Grib2Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_message() {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => None,
            Err(e) => {
                // Stop after the first malformed message.
                self.offset = self.data.len();
                Some(Err(e))
            }
        }
    }
}

/// A single parsed GRIB2 message.
///
/// Only the first field of a multi-field message is described.
#[derive(Debug, Clone)]
pub struct Grib2Message {
    /// The complete encoded message, section 0 through the end marker.
    pub raw: Bytes,
    pub indicator: Indicator,
    pub identification: Identification,
    pub grid_definition: GridDefinition,
    pub product_definition: ProductDefinition,
    pub data_representation: DataRepresentation,
    pub bitmap: Option<Bitmap>,
    pub data_section: DataSection,
}

impl Grib2Message {
    fn parse(raw: Bytes, indicator: Indicator) -> Result<Self, Grib2Error> {
        let identification = sections::parse_identification(&raw)?;
        let grid_definition = sections::parse_grid_definition(&raw)?;
        let product_definition = sections::parse_product_definition(&raw, indicator.discipline)?;
        let data_representation = sections::parse_data_representation(&raw)?;
        let bitmap = sections::parse_bitmap(&raw)?;
        let data_section = sections::parse_data_section(&raw)?;

        Ok(Self {
            raw,
            indicator,
            identification,
            grid_definition,
            product_definition,
            data_representation,
            bitmap,
            data_section,
        })
    }

    pub fn discipline(&self) -> u8 {
        self.indicator.discipline
    }

    pub fn parameter(&self) -> (u8, u8, u8) {
        (
            self.indicator.discipline,
            self.product_definition.parameter_category,
            self.product_definition.parameter_number,
        )
    }

    /// Forecast lead time in whole hours, if it is expressible as one.
    pub fn forecast_hours(&self) -> Option<u32> {
        self.product_definition.forecast_hours()
    }

    /// Pressure in millibars when the first fixed surface is an isobaric
    /// level expressed in whole millibars.
    pub fn pressure_mb(&self) -> Option<u32> {
        let pd = &self.product_definition;
        if pd.level_type != SURFACE_ISOBARIC {
            return None;
        }
        let pascals = pd.level_value?;
        let millibars = pascals / 100.0;
        (millibars >= 0.0 && millibars.fract() == 0.0).then_some(millibars as u32)
    }

    /// Number of points on the grid (`ni * nj`).
    pub fn grid_points(&self) -> usize {
        self.grid_definition.num_points()
    }

    /// Unpack the field into grid order; missing points become `None`.
    pub fn unpack(&self) -> Result<Vec<Option<f64>>, Grib2Error> {
        unpacking::unpack_field(
            &self.data_representation,
            &self.data_section.data,
            self.bitmap.as_ref(),
            self.grid_points(),
        )
    }

    /// Unpack the field, failing if any grid point is missing.
    pub fn unpack_data(&self) -> Result<Vec<f64>, Grib2Error> {
        self.unpack()?
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                v.ok_or_else(|| {
                    Grib2Error::UnpackingError(format!("grid point {} has no value", i))
                })
            })
            .collect()
    }
}
