//! Complex packing (templates 5.2 and 5.3).
//!
//! Values are split into groups, each with its own reference, bit width and
//! length. Template 5.3 additionally stores first or second order spatial
//! differences, prefixed by the original first values and the overall
//! minimum of the differences.

use std::iter;

use super::BitReader;
use crate::sections::{sign_magnitude, ComplexPacking};
use crate::Grib2Error;

/// Decode the integer values of a complex packed field.
///
/// The result holds `num_values` entries before scaling; entries flagged
/// as missing are `None`.
pub fn unpack_complex_integers(
    packed_data: &[u8],
    params: &ComplexPacking,
    bits_per_value: u8,
    num_values: usize,
) -> Result<Vec<Option<i64>>, Grib2Error> {
    if params.group_splitting_method != 1 {
        return Err(Grib2Error::Unsupported {
            what: "group splitting method",
            value: params.group_splitting_method as u32,
        });
    }
    if params.missing_value_management > 2 {
        return Err(Grib2Error::Unsupported {
            what: "missing value management",
            value: params.missing_value_management as u32,
        });
    }

    let mut reader = BitReader::new(packed_data);

    let (first_values, minimum) = match params.spatial_differencing {
        None => (Vec::new(), 0),
        Some(sd) => {
            if !(1..=2).contains(&sd.order) {
                return Err(Grib2Error::Unsupported {
                    what: "spatial differencing order",
                    value: sd.order as u32,
                });
            }
            if !(1..=4).contains(&sd.descriptor_octets) {
                return Err(Grib2Error::Unsupported {
                    what: "spatial differencing descriptor size",
                    value: sd.descriptor_octets as u32,
                });
            }
            let octets = sd.descriptor_octets as usize;
            let mut first_values = Vec::with_capacity(sd.order as usize);
            for _ in 0..sd.order {
                first_values.push(descriptor(reader.octets(octets)?));
            }
            (first_values, descriptor(reader.octets(octets)?))
        }
    };

    let num_groups = params.num_groups as usize;
    if num_groups == 0 {
        return if num_values == 0 {
            Ok(Vec::new())
        } else {
            Err(Grib2Error::UnpackingError(
                "complex packing declares no groups".to_string(),
            ))
        };
    }

    let references = read_many(&mut reader, bits_per_value, num_groups)?;
    reader.align();
    let widths: Vec<u32> = read_many(&mut reader, params.group_width_bits, num_groups)?
        .into_iter()
        .map(|w| w + params.group_width_reference as u32)
        .collect();
    reader.align();
    // All NG scaled lengths are stored; the last is superseded by the true
    // length of the last group from section 5.
    let mut lengths: Vec<u32> = read_many(&mut reader, params.group_length_bits, num_groups)?
        .into_iter()
        .map(|l| l * params.group_length_increment as u32 + params.group_length_reference)
        .collect();
    reader.align();
    if let Some(last) = lengths.last_mut() {
        *last = params.group_length_last;
    }

    let total: usize = lengths.iter().map(|&l| l as usize).sum();
    if total != num_values {
        return Err(Grib2Error::UnpackingError(format!(
            "group lengths cover {} values, expected {}",
            total, num_values
        )));
    }

    let management = params.missing_value_management;
    let is_missing = |value: u64, bits: u32| {
        let primary = (1u64 << bits) - 1;
        (management >= 1 && value == primary) || (management == 2 && value + 1 == primary)
    };

    let mut values = Vec::with_capacity(num_values);
    for ((&reference, &width), &length) in references.iter().zip(&widths).zip(&lengths) {
        let length = length as usize;
        if width == 0 {
            let value = if is_missing(reference as u64, bits_per_value as u32) {
                None
            } else {
                Some(reference as i64 + minimum)
            };
            values.extend(iter::repeat(value).take(length));
            continue;
        }

        let width = u8::try_from(width)
            .ok()
            .filter(|&w| w <= 32)
            .ok_or_else(|| Grib2Error::UnpackingError(format!("group width {} too large", width)))?;
        for _ in 0..length {
            let x = reader.read(width)?;
            values.push(if is_missing(x as u64, width as u32) {
                None
            } else {
                Some(x as i64 + reference as i64 + minimum)
            });
        }
    }

    if let Some(sd) = params.spatial_differencing {
        undo_spatial_differencing(&mut values, sd.order, &first_values);
    }

    Ok(values)
}

/// Restore original values from first or second order differences.
/// Missing entries are skipped and do not take part in the recurrence.
fn undo_spatial_differencing(values: &mut [Option<i64>], order: u8, first_values: &[i64]) {
    let order = order as usize;
    let (mut prev1, mut prev2) = (0i64, 0i64);
    let mut seen = 0;

    for value in values.iter_mut() {
        let Some(x) = *value else { continue };
        let restored = if seen < order {
            first_values[seen]
        } else if order == 1 {
            x + prev1
        } else {
            x + 2 * prev1 - prev2
        };
        prev2 = prev1;
        prev1 = restored;
        seen += 1;
        *value = Some(restored);
    }
}

fn read_many(reader: &mut BitReader<'_>, bits: u8, count: usize) -> Result<Vec<u32>, Grib2Error> {
    (0..count).map(|_| reader.read(bits)).collect()
}

/// Sign-magnitude integer spanning 1 to 4 octets.
fn descriptor(octets: &[u8]) -> i64 {
    let raw = octets.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32);
    sign_magnitude(raw, octets.len() as u32 * 8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sections::SpatialDifferencing;

    fn params(num_groups: u32) -> ComplexPacking {
        ComplexPacking {
            group_splitting_method: 1,
            missing_value_management: 0,
            num_groups,
            group_width_reference: 0,
            group_width_bits: 0,
            group_length_reference: 0,
            group_length_increment: 1,
            group_length_last: 0,
            group_length_bits: 0,
            spatial_differencing: None,
        }
    }

    #[test]
    fn test_first_order_spatial_differencing() {
        // first value 10, minimum 1, one group of 2-bit values 0,0,1,2
        let mut p = params(1);
        p.group_width_reference = 2;
        p.group_length_last = 4;
        p.spatial_differencing = Some(SpatialDifferencing {
            order: 1,
            descriptor_octets: 2,
        });
        let data = [0x00, 0x0a, 0x00, 0x01, 0x00, 0b0000_0110];

        let values = unpack_complex_integers(&data, &p, 8, 4).unwrap();
        assert_eq!(values, vec![Some(10), Some(11), Some(13), Some(16)]);
    }

    #[test]
    fn test_second_order_spatial_differencing() {
        // first values 5, 7; second differences 1, -1 stored with minimum -1
        let mut p = params(1);
        p.group_width_reference = 2;
        p.group_length_last = 4;
        p.spatial_differencing = Some(SpatialDifferencing {
            order: 2,
            descriptor_octets: 1,
        });
        // descriptors: 5, 7, -1; values (after minimum) 0, 0, 2, 0
        let data = [0x05, 0x07, 0x81, 0x00, 0b0000_1000];

        let values = unpack_complex_integers(&data, &p, 8, 4).unwrap();
        // 5, 7, 7*2-5+1 = 10, 10*2-7-1 = 12
        assert_eq!(values, vec![Some(5), Some(7), Some(10), Some(12)]);
    }

    #[test]
    fn test_constant_groups_and_missing_values() {
        let mut p = params(2);
        p.missing_value_management = 1;
        p.group_length_bits = 8;
        p.group_length_last = 1;
        // references 5 and 255 (missing), group lengths 2 and a stored
        // placeholder for the last
        let data = [5, 255, 2, 0];

        let values = unpack_complex_integers(&data, &p, 8, 3).unwrap();
        assert_eq!(values, vec![Some(5), Some(5), None]);
    }

    #[test]
    fn test_values_follow_all_stored_group_lengths() {
        let mut p = params(2);
        p.group_width_bits = 4;
        p.group_length_bits = 8;
        p.group_length_last = 3;
        // references 10, 20; widths 2, 3; lengths 2 and 99 (superseded by 3);
        // values 1, 3 then 0, 5, 7
        let data = [10, 20, 0x23, 2, 99, 0b0111_0001, 0b0111_1000];

        let values = unpack_complex_integers(&data, &p, 8, 5).unwrap();
        assert_eq!(values, vec![Some(11), Some(13), Some(20), Some(25), Some(27)]);
    }

    #[test]
    fn test_length_mismatch_is_error() {
        let mut p = params(1);
        p.group_length_last = 3;
        assert!(unpack_complex_integers(&[0], &p, 8, 4).is_err());
    }

    #[test]
    fn test_unsupported_splitting_method() {
        let mut p = params(1);
        p.group_splitting_method = 0;
        assert!(matches!(
            unpack_complex_integers(&[0], &p, 8, 0),
            Err(Grib2Error::Unsupported { .. })
        ));
    }
}
