//! GRIB2 data unpacking algorithms.
//!
//! Implements the packing methods used by GFS pressure-level products:
//! - Simple packing (template 5.0)
//! - Complex packing (template 5.2)
//! - Complex packing with spatial differencing (template 5.3)

mod complex;

use crate::sections::{Bitmap, DataRepresentation};
use crate::Grib2Error;

pub use complex::unpack_complex_integers;

/// Unpack a field into grid order.
///
/// Points not present in the bitmap, and points flagged missing by complex
/// packing, come back as `None`.
pub fn unpack_field(
    representation: &DataRepresentation,
    packed_data: &[u8],
    bitmap: Option<&Bitmap>,
    grid_points: usize,
) -> Result<Vec<Option<f64>>, Grib2Error> {
    if !matches!(representation.template_number, 0 | 2 | 3) {
        return Err(Grib2Error::Unsupported {
            what: "data representation template",
            value: representation.template_number as u32,
        });
    }
    if representation.original_data_type != 0 {
        return Err(Grib2Error::Unsupported {
            what: "original field type",
            value: representation.original_data_type as u32,
        });
    }

    let num_packed = representation.num_data_points as usize;
    let present = match bitmap {
        Some(bm) => (0..grid_points).filter(|&i| bm.is_set(i)).count(),
        None => grid_points,
    };
    if present != num_packed {
        return Err(Grib2Error::UnpackingError(format!(
            "{} packed values for {} grid points present",
            num_packed, present
        )));
    }

    let packed = match &representation.complex {
        None => unpack_simple(
            packed_data,
            num_packed,
            representation.bits_per_value,
            representation.reference_value,
            representation.binary_scale_factor,
            representation.decimal_scale_factor,
        )?
        .into_iter()
        .map(Some)
        .collect::<Vec<_>>(),
        Some(params) => {
            let scale = Scale::new(
                representation.reference_value,
                representation.binary_scale_factor,
                representation.decimal_scale_factor,
            );
            unpack_complex_integers(packed_data, params, representation.bits_per_value, num_packed)?
                .into_iter()
                .map(|v| v.map(|x| scale.apply(x)))
                .collect()
        }
    };

    match bitmap {
        None => Ok(packed),
        Some(bm) => {
            let mut values = packed.into_iter();
            Ok((0..grid_points)
                .map(|i| if bm.is_set(i) { values.next().flatten() } else { None })
                .collect())
        }
    }
}

/// Unpack simple packed GRIB2 data
///
/// Simple packing formula: value = (reference_value + packed_value * 2^E) * 10^(-D)
pub fn unpack_simple(
    packed_data: &[u8],
    num_values: usize,
    bits_per_value: u8,
    reference_value: f32,
    binary_scale_factor: i16,
    decimal_scale_factor: i16,
) -> Result<Vec<f64>, Grib2Error> {
    let scale = Scale::new(reference_value, binary_scale_factor, decimal_scale_factor);

    if bits_per_value == 0 {
        return Ok(vec![scale.apply(0); num_values]);
    }

    let needed_bits = num_values * bits_per_value as usize;
    if needed_bits > packed_data.len() * 8 {
        return Err(Grib2Error::UnpackingError(format!(
            "{} values of {} bits need {} bytes, section 7 has {}",
            num_values,
            bits_per_value,
            needed_bits.div_ceil(8),
            packed_data.len()
        )));
    }

    let mut reader = BitReader::new(packed_data);
    (0..num_values)
        .map(|_| reader.read(bits_per_value).map(|x| scale.apply(x as i64)))
        .collect()
}

/// Reference value and scale factors of a packed field.
#[derive(Debug, Clone, Copy)]
struct Scale {
    reference: f64,
    binary: f64,
    decimal: f64,
}

impl Scale {
    fn new(reference_value: f32, binary_scale_factor: i16, decimal_scale_factor: i16) -> Self {
        Self {
            reference: reference_value as f64,
            binary: 2f64.powi(binary_scale_factor as i32),
            decimal: 10f64.powi(-(decimal_scale_factor as i32)),
        }
    }

    fn apply(&self, packed: i64) -> f64 {
        (self.reference + packed as f64 * self.binary) * self.decimal
    }
}

/// MSB-first bit reader over section 7.
pub(crate) struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, bit: 0 }
    }

    /// Read `num_bits` (0..=32) as an unsigned integer.
    pub(crate) fn read(&mut self, num_bits: u8) -> Result<u32, Grib2Error> {
        let value = extract_bits(self.data, self.bit, num_bits as usize)?;
        self.bit += num_bits as usize;
        Ok(value)
    }

    /// Skip to the next octet boundary.
    pub(crate) fn align(&mut self) {
        self.bit = self.bit.div_ceil(8) * 8;
    }

    /// Read whole octets; the reader must be aligned.
    pub(crate) fn octets(&mut self, count: usize) -> Result<&'a [u8], Grib2Error> {
        let start = self.bit / 8;
        let end = start + count;
        if end > self.data.len() {
            return Err(Grib2Error::UnpackingError(
                "Not enough data to read octets".to_string(),
            ));
        }
        self.bit = end * 8;
        Ok(&self.data[start..end])
    }
}

/// Extract bits from a byte array, MSB first.
fn extract_bits(data: &[u8], start_bit: usize, num_bits: usize) -> Result<u32, Grib2Error> {
    if num_bits > 32 {
        return Err(Grib2Error::UnpackingError(format!(
            "Invalid number of bits: {}",
            num_bits
        )));
    }
    if start_bit + num_bits > data.len() * 8 {
        return Err(Grib2Error::UnpackingError(
            "Not enough data to extract bits".to_string(),
        ));
    }

    let mut result = 0u32;
    for i in 0..num_bits {
        let absolute_bit = start_bit + i;
        let bit = (data[absolute_bit / 8] >> (7 - absolute_bit % 8)) & 1;
        result = (result << 1) | bit as u32;
    }

    Ok(result)
}
