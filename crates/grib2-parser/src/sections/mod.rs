//! GRIB2 section parsing.
//!
//! Each GRIB2 message consists of multiple sections containing
//! metadata, grid information, and packed data. Offsets below are 0-based
//! indices into the section, including its 5-byte header.

use crate::Grib2Error;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};

/// Section 0: Indicator Section (16 bytes)
#[derive(Debug, Clone)]
pub struct Indicator {
    pub discipline: u8,
    pub edition: u8,
    pub message_length: u64,
}

/// Section 1: Identification Section
#[derive(Debug, Clone)]
pub struct Identification {
    pub center: u16,
    pub sub_center: u16,
    pub significance_of_reference_time: u8,
    pub reference_time: DateTime<Utc>,
}

/// Section 3: Grid Definition Section (template 3.0, regular lat/lon)
///
/// Coordinates are in micro-degrees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridDefinition {
    pub template_number: u16,
    pub ni: u32,
    pub nj: u32,
    pub la1: i32,
    pub lo1: i32,
    pub la2: i32,
    pub lo2: i32,
    pub di: u32,
    pub dj: u32,
    pub scanning_mode: u8,
}

impl GridDefinition {
    pub fn num_points(&self) -> usize {
        self.ni as usize * self.nj as usize
    }
}

/// Section 4: Product Definition Section (templates 4.0 to 4.15)
#[derive(Debug, Clone)]
pub struct ProductDefinition {
    pub template_number: u16,
    pub parameter_category: u8,
    pub parameter_number: u8,
    pub parameter_short_name: String,
    /// Indicator of unit of time range (code table 4.4)
    pub time_unit: u8,
    pub forecast_time: u32,
    /// Type of first fixed surface (code table 4.5)
    pub level_type: u8,
    /// Value of the first fixed surface with its scale factor applied;
    /// `None` when the value is marked missing.
    pub level_value: Option<f64>,
}

impl ProductDefinition {
    /// Forecast time converted to hours.
    pub fn forecast_hours(&self) -> Option<u32> {
        let t = self.forecast_time;
        match self.time_unit {
            0 => (t % 60 == 0).then_some(t / 60),
            1 => Some(t),
            2 => t.checked_mul(24),
            10 => t.checked_mul(3),
            11 => t.checked_mul(6),
            12 => t.checked_mul(12),
            13 => (t % 3600 == 0).then_some(t / 3600),
            _ => None,
        }
    }
}

/// Section 5: Data Representation Section
#[derive(Debug, Clone)]
pub struct DataRepresentation {
    /// Number of packed values (points present in the bitmap)
    pub num_data_points: u32,
    pub template_number: u16,
    pub reference_value: f32,
    pub binary_scale_factor: i16,
    pub decimal_scale_factor: i16,
    pub bits_per_value: u8,
    pub original_data_type: u8,
    /// Extra parameters of templates 5.2 and 5.3
    pub complex: Option<ComplexPacking>,
}

/// Group descriptors shared by templates 5.2 and 5.3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplexPacking {
    pub group_splitting_method: u8,
    pub missing_value_management: u8,
    pub num_groups: u32,
    pub group_width_reference: u8,
    pub group_width_bits: u8,
    pub group_length_reference: u32,
    pub group_length_increment: u8,
    pub group_length_last: u32,
    pub group_length_bits: u8,
    pub spatial_differencing: Option<SpatialDifferencing>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpatialDifferencing {
    /// 1 or 2
    pub order: u8,
    /// Octets used by each extra descriptor at the start of section 7
    pub descriptor_octets: u8,
}

/// Section 6: Bitmap Section (only when a bitmap applies)
#[derive(Debug, Clone)]
pub struct Bitmap {
    pub data: Bytes,
}

impl Bitmap {
    pub fn is_set(&self, index: usize) -> bool {
        self.data
            .get(index / 8)
            .map(|byte| (byte >> (7 - index % 8)) & 1 == 1)
            .unwrap_or(false)
    }
}

/// Section 7: Data Section
#[derive(Debug, Clone)]
pub struct DataSection {
    pub data: Bytes,
}

// ===== Parsing Functions =====

/// Parse Section 0 (Indicator) from start of message
pub fn parse_indicator(data: &[u8]) -> Result<Indicator, Grib2Error> {
    if data.len() < 16 {
        return Err(Grib2Error::InvalidFormat(
            "Not enough data for indicator section".to_string(),
        ));
    }

    if &data[0..4] != b"GRIB" {
        return Err(Grib2Error::InvalidFormat(
            "Invalid GRIB magic bytes".to_string(),
        ));
    }

    // Octets 5-6 reserved, 7 discipline, 8 edition, 9-16 total length
    let discipline = data[6];
    let edition = data[7];
    if edition != 2 {
        return Err(Grib2Error::InvalidFormat(format!(
            "Expected GRIB edition 2, got {}",
            edition
        )));
    }

    Ok(Indicator {
        discipline,
        edition,
        message_length: read_u64(data, 8),
    })
}

/// Parse Section 1 (Identification), located at offset 16 in the message
pub fn parse_identification(data: &[u8]) -> Result<Identification, Grib2Error> {
    let section = section_slice(data, 1)?;
    require_len(section, 1, 19)?;

    let center = read_u16(section, 5);
    let sub_center = read_u16(section, 7);
    let significance_of_reference_time = section[11];

    let year = read_u16(section, 12);
    let (month, day, hour, minute, second) =
        (section[14], section[15], section[16], section[17], section[18]);

    let reference_time = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .and_then(|date| date.and_hms_opt(hour as u32, minute as u32, second as u32))
        .ok_or_else(|| Grib2Error::InvalidSection {
            section: 1,
            reason: format!(
                "Invalid date: {}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            ),
        })?;

    Ok(Identification {
        center,
        sub_center,
        significance_of_reference_time,
        reference_time: DateTime::<Utc>::from_naive_utc_and_offset(reference_time, Utc),
    })
}

/// Parse Section 3 (Grid Definition)
pub fn parse_grid_definition(data: &[u8]) -> Result<GridDefinition, Grib2Error> {
    let section = section_slice(data, 3)?;
    require_len(section, 3, 14)?;

    // 5: source, 6-9: number of points, 10-11: optional list, 12-13: template
    let template_number = read_u16(section, 12);
    if template_number != 0 {
        return Err(Grib2Error::Unsupported {
            what: "grid definition template",
            value: template_number as u32,
        });
    }

    // Template 3.0 data starts at 14:
    //  0: shape of the earth, 1-15: radius and axes
    // 16-19: Ni, 20-23: Nj, 24-31: basic angle and subdivisions
    // 32-35: La1, 36-39: Lo1, 40: resolution flags
    // 41-44: La2, 45-48: Lo2, 49-52: Di, 53-56: Dj, 57: scanning mode
    let gd = &section[14..];
    if gd.len() < 58 {
        return Err(Grib2Error::InvalidSection {
            section: 3,
            reason: format!("Template 0 needs at least 58 bytes, got {}", gd.len()),
        });
    }

    Ok(GridDefinition {
        template_number,
        ni: read_u32(gd, 16),
        nj: read_u32(gd, 20),
        la1: read_grib_i32(gd, 32),
        lo1: read_grib_i32(gd, 36),
        la2: read_grib_i32(gd, 41),
        lo2: read_grib_i32(gd, 45),
        di: read_u32(gd, 49),
        dj: read_u32(gd, 53),
        scanning_mode: gd[57],
    })
}

/// Parse Section 4 (Product Definition)
pub fn parse_product_definition(
    data: &[u8],
    discipline: u8,
) -> Result<ProductDefinition, Grib2Error> {
    let section = section_slice(data, 4)?;
    require_len(section, 4, 9)?;

    // 5-6: number of coordinate values, 7-8: template number
    let template_number = read_u16(section, 7);
    if template_number > 15 {
        return Err(Grib2Error::Unsupported {
            what: "product definition template",
            value: template_number as u32,
        });
    }
    require_len(section, 4, 34)?;

    // Templates 4.0 to 4.15 share this layout:
    //  9: category, 10: number, 11-16: generating process and cutoff
    // 17: time unit, 18-21: forecast time
    // 22: first surface type, 23: scale factor, 24-27: scaled value
    let parameter_category = section[9];
    let parameter_number = section[10];
    let time_unit = section[17];
    let forecast_time = read_u32(section, 18);
    let level_type = section[22];
    let level_value = scaled_value(section[23], read_u32(section, 24));

    Ok(ProductDefinition {
        template_number,
        parameter_category,
        parameter_number,
        parameter_short_name: parameter_short_name(discipline, parameter_category, parameter_number),
        time_unit,
        forecast_time,
        level_type,
        level_value,
    })
}

/// Parse Section 5 (Data Representation)
pub fn parse_data_representation(data: &[u8]) -> Result<DataRepresentation, Grib2Error> {
    let section = section_slice(data, 5)?;
    require_len(section, 5, 21)?;

    // 5-8: number of packed values, 9-10: template number
    // 11-14: reference value (IEEE float), 15-16: binary scale factor
    // 17-18: decimal scale factor, 19: bits per value, 20: original type
    let num_data_points = read_u32(section, 5);
    let template_number = read_u16(section, 9);

    let complex = match template_number {
        0 => None,
        2 | 3 => {
            require_len(section, 5, if template_number == 3 { 49 } else { 47 })?;
            let spatial_differencing = (template_number == 3).then(|| SpatialDifferencing {
                order: section[47],
                descriptor_octets: section[48],
            });
            Some(ComplexPacking {
                group_splitting_method: section[21],
                missing_value_management: section[22],
                num_groups: read_u32(section, 31),
                group_width_reference: section[35],
                group_width_bits: section[36],
                group_length_reference: read_u32(section, 37),
                group_length_increment: section[41],
                group_length_last: read_u32(section, 42),
                group_length_bits: section[46],
                spatial_differencing,
            })
        }
        // Rejected when unpacked, so the rest of the message stays readable.
        _ => None,
    };

    Ok(DataRepresentation {
        num_data_points,
        template_number,
        reference_value: f32::from_be_bytes([section[11], section[12], section[13], section[14]]),
        binary_scale_factor: read_grib_i16(section, 15),
        decimal_scale_factor: read_grib_i16(section, 17),
        bits_per_value: section[19],
        original_data_type: section[20],
        complex,
    })
}

/// Parse Section 6 (Bitmap). Returns `None` when no bitmap applies.
pub fn parse_bitmap(data: &[u8]) -> Result<Option<Bitmap>, Grib2Error> {
    let section = section_slice(data, 6)?;
    require_len(section, 6, 6)?;

    match section[5] {
        255 => Ok(None),
        0 => Ok(Some(Bitmap {
            data: Bytes::copy_from_slice(&section[6..]),
        })),
        indicator => Err(Grib2Error::Unsupported {
            what: "bitmap indicator",
            value: indicator as u32,
        }),
    }
}

/// Parse Section 7 (Data)
pub fn parse_data_section(data: &[u8]) -> Result<DataSection, Grib2Error> {
    let section = section_slice(data, 7)?;
    Ok(DataSection {
        data: Bytes::copy_from_slice(&section[5..]),
    })
}

// ===== Helper Functions =====

/// Find a section by number within a message and return its bytes.
fn section_slice(data: &[u8], section_num: u8) -> Result<&[u8], Grib2Error> {
    let offset = find_section(data, section_num)?;
    let length = read_u32(data, offset) as usize;
    Ok(&data[offset..offset + length])
}

fn find_section(data: &[u8], section_num: u8) -> Result<usize, Grib2Error> {
    let mut offset = 16; // After Section 0

    loop {
        if offset + 5 > data.len() || &data[offset..offset + 4] == b"7777" {
            return Err(Grib2Error::InvalidSection {
                section: section_num,
                reason: "Section not found".to_string(),
            });
        }

        let section_length = read_u32(data, offset) as usize;
        if section_length < 5 || offset + section_length > data.len() {
            return Err(Grib2Error::InvalidSection {
                section: section_num,
                reason: "Invalid section length".to_string(),
            });
        }

        if data[offset + 4] == section_num {
            return Ok(offset);
        }

        offset += section_length;
    }
}

fn require_len(section: &[u8], section_num: u8, needed: usize) -> Result<(), Grib2Error> {
    if section.len() < needed {
        return Err(Grib2Error::InvalidSection {
            section: section_num,
            reason: format!("Need {} bytes, got {}", needed, section.len()),
        });
    }
    Ok(())
}

/// Apply a GRIB2 scale factor to a scaled value; all-ones marks missing.
fn scaled_value(scale_factor: u8, scaled: u32) -> Option<f64> {
    if scaled == u32::MAX {
        return None;
    }
    let factor = sign_magnitude(scale_factor as u32, 8);
    let magnitude = sign_magnitude(scaled, 32) as f64;
    Some(magnitude / 10f64.powi(factor as i32))
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

/// GRIB2 signed integers use a sign bit followed by the magnitude.
fn read_grib_i16(data: &[u8], offset: usize) -> i16 {
    sign_magnitude(read_u16(data, offset) as u32, 16) as i16
}

fn read_grib_i32(data: &[u8], offset: usize) -> i32 {
    sign_magnitude(read_u32(data, offset), 32) as i32
}

pub(crate) fn sign_magnitude(raw: u32, bits: u32) -> i64 {
    let sign_bit = 1u64 << (bits - 1);
    let raw = raw as u64;
    let magnitude = (raw & (sign_bit - 1)) as i64;
    if raw & sign_bit != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Short name of a parameter, in NCEP notation.
pub fn parameter_short_name(discipline: u8, category: u8, number: u8) -> String {
    match (discipline, category, number) {
        (0, 0, 0) => "TMP".to_string(),
        (0, 1, 1) => "RH".to_string(),
        (0, 2, 2) => "UGRD".to_string(),
        (0, 2, 3) => "VGRD".to_string(),
        (0, 2, 8) => "VVEL".to_string(),
        (0, 2, 10) => "ABSV".to_string(),
        (0, 3, 0) => "PRES".to_string(),
        (0, 3, 1) => "PRMSL".to_string(),
        (0, 3, 5) => "HGT".to_string(),
        _ => format!("P{}_{}_{}", discipline, category, number),
    }
}
