//! Synthetic GRIB2 message builder.
//!
//! Produces structurally valid messages on a regular lat/lon grid, with
//! simple packing (template 5.0) by default or complex packing (templates
//! 5.2 and 5.3). Integer-valued fields with a range below 65536 round-trip
//! exactly.

use std::iter;

use chrono::{DateTime, Datelike, Timelike, Utc};
use wind_common::{GridAxes, RecordName};

/// Data representation the builder writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packing {
    /// Template 5.0 with 16 bits per value.
    Simple,
    /// Template 5.2: values rounded to integers, split into groups of
    /// `group_size`.
    Complex { group_size: usize },
    /// Template 5.3: complex packing of first or second order differences.
    SpatialDifferencing { order: u8, group_size: usize },
}

/// Build a single GRIB2 message with the specified parameters
#[derive(Debug, Clone)]
pub struct Grib2Builder {
    discipline: u8,
    center: u16,
    reference_time: DateTime<Utc>,
    // Grid definition (micro-degrees)
    ni: u32,
    nj: u32,
    la1: i32,
    lo1: i32,
    la2: i32,
    lo2: i32,
    di: u32,
    dj: u32,
    scanning_mode: u8,
    // Product definition
    param_category: u8,
    param_number: u8,
    level_type: u8,
    level_value: u32,
    time_unit: u8,
    forecast_time: u32,
    // Data, in scan order
    data_values: Vec<f32>,
    packing: Packing,
}

impl Default for Grib2Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Grib2Builder {
    /// A 10x10 one-degree grid of geopotential height at 500 mb.
    pub fn new() -> Self {
        let (ni, nj) = (10, 10);
        Self {
            discipline: 0,
            center: 7, // NCEP
            reference_time: DateTime::<Utc>::default(),
            ni,
            nj,
            la1: 45_000_000,
            lo1: 230_000_000,
            la2: 36_000_000,
            lo2: 239_000_000,
            di: 1_000_000,
            dj: 1_000_000,
            scanning_mode: 0, // +i, -j, i consecutive
            param_category: 3,
            param_number: 5,
            level_type: 100,
            level_value: 50_000,
            time_unit: 1,
            forecast_time: 0,
            data_values: vec![5_500.0; (ni * nj) as usize],
            packing: Packing::Simple,
        }
    }

    /// A builder whose grid matches `axes`, scanning north to south.
    pub fn for_axes(axes: &GridAxes) -> Self {
        let lat = axes.latitude();
        let lon = axes.longitude();
        let (ni, nj) = (lon.count as u32, lat.count as u32);
        Self {
            ni,
            nj,
            la1: lat.micro_degrees(lat.count - 1) as i32,
            la2: lat.micro_degrees(0) as i32,
            lo1: lon.micro_degrees(0) as i32,
            lo2: lon.micro_degrees(lon.count - 1) as i32,
            di: (lon.step * 1e6).round() as u32,
            dj: (lat.step * 1e6).round() as u32,
            data_values: vec![0.0; (ni * nj) as usize],
            ..Self::new()
        }
    }

    pub fn with_reference_time(mut self, time: DateTime<Utc>) -> Self {
        self.reference_time = time;
        self
    }

    pub fn with_grid(mut self, ni: u32, nj: u32) -> Self {
        self.ni = ni;
        self.nj = nj;
        self.data_values = vec![0.0; (ni * nj) as usize];
        self
    }

    pub fn with_latitudes(mut self, la1: i32, la2: i32) -> Self {
        self.la1 = la1;
        self.la2 = la2;
        self
    }

    pub fn with_scanning_mode(mut self, mode: u8) -> Self {
        self.scanning_mode = mode;
        self
    }

    pub fn with_discipline(mut self, discipline: u8) -> Self {
        self.discipline = discipline;
        self
    }

    pub fn with_parameter(mut self, category: u8, number: u8) -> Self {
        self.param_category = category;
        self.param_number = number;
        self
    }

    /// First fixed surface with a zero scale factor.
    pub fn with_level(mut self, level_type: u8, level_value: u32) -> Self {
        self.level_type = level_type;
        self.level_value = level_value;
        self
    }

    pub fn with_forecast_hour(mut self, hour: u32) -> Self {
        self.time_unit = 1;
        self.forecast_time = hour;
        self
    }

    pub fn with_forecast_time(mut self, unit: u8, value: u32) -> Self {
        self.time_unit = unit;
        self.forecast_time = value;
        self
    }

    /// Variable, isobaric level and forecast hour of a dataset record.
    pub fn with_record(self, name: &RecordName) -> Self {
        let (discipline, category, number) = name.variable.grib_parameter();
        self.with_discipline(discipline)
            .with_parameter(category, number)
            .with_level(100, name.pressure * 100)
            .with_forecast_hour(name.hour)
    }

    pub fn with_constant_value(mut self, value: f32) -> Self {
        self.data_values = vec![value; (self.ni * self.nj) as usize];
        self
    }

    pub fn with_data(mut self, data: Vec<f32>) -> Self {
        self.data_values = data;
        self
    }

    /// Complex packing flags NaN values as primary missing values.
    pub fn with_packing(mut self, packing: Packing) -> Self {
        self.packing = packing;
        self
    }

    /// Build the complete GRIB2 message bytes
    pub fn build(&self) -> Vec<u8> {
        let (section5, section7) = match self.packing {
            Packing::Simple => (self.build_section5(), self.build_section7()),
            Packing::Complex { group_size } => self.build_complex_sections(0, group_size),
            Packing::SpatialDifferencing { order, group_size } => {
                self.build_complex_sections(order, group_size)
            }
        };
        let sections = [
            self.build_section1(),
            self.build_section3(),
            self.build_section4(),
            section5,
            self.build_section6(),
            section7,
        ];
        let message_length = 16 + sections.iter().map(Vec::len).sum::<usize>() + 4;

        let mut message = Vec::with_capacity(message_length);
        message.extend_from_slice(b"GRIB");
        message.extend_from_slice(&[0, 0]); // Reserved
        message.push(self.discipline);
        message.push(2); // Edition 2
        message.extend_from_slice(&(message_length as u64).to_be_bytes());
        for section in &sections {
            message.extend_from_slice(section);
        }
        message.extend_from_slice(b"7777");
        message
    }

    fn build_section1(&self) -> Vec<u8> {
        let t = self.reference_time;
        let mut section = Vec::new();
        section.extend_from_slice(&21u32.to_be_bytes());
        section.push(1);
        section.extend_from_slice(&self.center.to_be_bytes());
        section.extend_from_slice(&0u16.to_be_bytes()); // Sub-center
        section.push(2); // Master table version
        section.push(1); // Local table version
        section.push(1); // Start of forecast
        section.extend_from_slice(&(t.year() as u16).to_be_bytes());
        section.push(t.month() as u8);
        section.push(t.day() as u8);
        section.push(t.hour() as u8);
        section.push(t.minute() as u8);
        section.push(t.second() as u8);
        section.push(0); // Operational
        section.push(1); // Forecast
        section
    }

    fn build_section3(&self) -> Vec<u8> {
        let mut section = Vec::new();
        section.extend_from_slice(&(14u32 + 58).to_be_bytes());
        section.push(3);
        section.push(0); // Source of grid definition
        section.extend_from_slice(&(self.ni * self.nj).to_be_bytes());
        section.push(0); // Octets for optional list
        section.push(0); // Interpretation of optional list
        section.extend_from_slice(&0u16.to_be_bytes()); // Template 3.0

        section.push(6); // Spherical earth, radius 6371229 m
        section.push(0);
        section.extend_from_slice(&0u32.to_be_bytes());
        section.push(0);
        section.extend_from_slice(&0u32.to_be_bytes());
        section.push(0);
        section.extend_from_slice(&0u32.to_be_bytes());
        section.extend_from_slice(&self.ni.to_be_bytes());
        section.extend_from_slice(&self.nj.to_be_bytes());
        section.extend_from_slice(&0u32.to_be_bytes()); // Basic angle
        section.extend_from_slice(&0xFFFF_FFFFu32.to_be_bytes()); // Subdivisions
        section.extend_from_slice(&grib_i32(self.la1));
        section.extend_from_slice(&grib_i32(self.lo1));
        section.push(48); // Resolution and component flags
        section.extend_from_slice(&grib_i32(self.la2));
        section.extend_from_slice(&grib_i32(self.lo2));
        section.extend_from_slice(&self.di.to_be_bytes());
        section.extend_from_slice(&self.dj.to_be_bytes());
        section.push(self.scanning_mode);
        section
    }

    fn build_section4(&self) -> Vec<u8> {
        let mut section = Vec::new();
        section.extend_from_slice(&34u32.to_be_bytes());
        section.push(4);
        section.extend_from_slice(&0u16.to_be_bytes()); // Coordinate values
        section.extend_from_slice(&0u16.to_be_bytes()); // Template 4.0
        section.push(self.param_category);
        section.push(self.param_number);
        section.push(2); // Forecast
        section.push(0); // Background process
        section.push(96); // Analysis or forecast process (GFS)
        section.extend_from_slice(&0u16.to_be_bytes()); // Hours of cutoff
        section.push(0); // Minutes of cutoff
        section.push(self.time_unit);
        section.extend_from_slice(&self.forecast_time.to_be_bytes());
        section.push(self.level_type);
        section.push(0);
        section.extend_from_slice(&self.level_value.to_be_bytes());
        section.push(255); // No second surface
        section.push(0);
        section.extend_from_slice(&0u32.to_be_bytes());
        section
    }

    fn packing(&self) -> (f32, i16, u8) {
        let (min_val, max_val) = self
            .data_values
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), &v| {
                (min.min(v), max.max(v))
            });
        let range = max_val - min_val;
        if self.data_values.is_empty() || range == 0.0 {
            let reference = if min_val.is_finite() { min_val } else { 0.0 };
            return (reference, 0, 0);
        }
        // E = ceil(log2(range / 65535)) so packed values fit in 16 bits
        let binary_scale_factor = (range / 65535.0).log2().ceil() as i16;
        (min_val, binary_scale_factor, 16)
    }

    fn build_section5(&self) -> Vec<u8> {
        let (reference_value, binary_scale_factor, bits_per_value) = self.packing();
        let mut section = Vec::new();
        section.extend_from_slice(&21u32.to_be_bytes());
        section.push(5);
        section.extend_from_slice(&(self.data_values.len() as u32).to_be_bytes());
        section.extend_from_slice(&0u16.to_be_bytes()); // Template 5.0
        section.extend_from_slice(&reference_value.to_be_bytes());
        section.extend_from_slice(&grib_i16(binary_scale_factor));
        section.extend_from_slice(&grib_i16(0)); // Decimal scale factor
        section.push(bits_per_value);
        section.push(0); // Floating point
        section
    }

    fn build_section6(&self) -> Vec<u8> {
        let mut section = Vec::new();
        section.extend_from_slice(&6u32.to_be_bytes());
        section.push(6);
        section.push(255); // No bitmap
        section
    }

    fn build_section7(&self) -> Vec<u8> {
        let (reference_value, binary_scale_factor, bits_per_value) = self.packing();
        let mut packed = Vec::new();
        if bits_per_value > 0 {
            let binary_scale = 2.0_f64.powi(binary_scale_factor as i32);
            for &val in &self.data_values {
                let packed_value =
                    ((val as f64 - reference_value as f64) / binary_scale).round() as u16;
                packed.extend_from_slice(&packed_value.to_be_bytes());
            }
        }

        let mut section = Vec::new();
        section.extend_from_slice(&(5 + packed.len() as u32).to_be_bytes());
        section.push(7);
        section.extend_from_slice(&packed);
        section
    }

    /// Sections 5 and 7 of a complex packed field; `order` 0 selects
    /// template 5.2.
    fn build_complex_sections(&self, order: u8, group_size: usize) -> (Vec<u8>, Vec<u8>) {
        let field = ComplexField::pack(&self.data_values, order, group_size);

        let mut section5 = Vec::new();
        section5.extend_from_slice(&(if order > 0 { 49u32 } else { 47 }).to_be_bytes());
        section5.push(5);
        section5.extend_from_slice(&(self.data_values.len() as u32).to_be_bytes());
        section5.extend_from_slice(&(if order > 0 { 3u16 } else { 2 }).to_be_bytes());
        section5.extend_from_slice(&field.reference_value.to_be_bytes());
        section5.extend_from_slice(&grib_i16(0)); // Binary scale factor
        section5.extend_from_slice(&grib_i16(0)); // Decimal scale factor
        section5.push(field.bits_per_value);
        section5.push(0); // Floating point
        section5.push(1); // General group splitting
        section5.push(field.missing_value_management);
        section5.extend_from_slice(&9.999e20f32.to_be_bytes()); // Primary missing substitute
        section5.extend_from_slice(&0xFFFF_FFFFu32.to_be_bytes()); // Secondary
        section5.extend_from_slice(&field.num_groups.to_be_bytes());
        section5.push(0); // Reference for group widths
        section5.push(field.width_bits);
        section5.extend_from_slice(&0u32.to_be_bytes()); // Reference for group lengths
        section5.push(1); // Length increment
        section5.extend_from_slice(&field.last_length.to_be_bytes());
        section5.push(field.length_bits);
        if order > 0 {
            section5.push(order);
            section5.push(field.descriptor_octets);
        }

        let mut section7 = Vec::new();
        section7.extend_from_slice(&(5 + field.payload.len() as u32).to_be_bytes());
        section7.push(7);
        section7.extend_from_slice(&field.payload);
        (section5, section7)
    }
}

/// Parameters and section 7 payload of a complex packed field.
struct ComplexField {
    reference_value: f32,
    bits_per_value: u8,
    missing_value_management: u8,
    num_groups: u32,
    width_bits: u8,
    length_bits: u8,
    last_length: u32,
    descriptor_octets: u8,
    payload: Vec<u8>,
}

impl ComplexField {
    fn pack(values: &[f32], order: u8, group_size: usize) -> Self {
        let reference_value = values
            .iter()
            .filter(|v| !v.is_nan())
            .fold(f32::INFINITY, |min, &v| min.min(v));
        let reference_value = if reference_value.is_finite() { reference_value } else { 0.0 };
        let mut ints: Vec<Option<i64>> = values
            .iter()
            .map(|&v| (!v.is_nan()).then(|| (v as f64 - reference_value as f64).round() as i64))
            .collect();

        // Differences run over present values only; the first `order`
        // present values travel as descriptors and are stored as zero.
        let order = order as usize;
        let mut descriptors: Vec<i64> = Vec::new();
        if order > 0 {
            let present: Vec<i64> = ints.iter().flatten().copied().collect();
            let differences: Vec<i64> = (order.min(present.len())..present.len())
                .map(|j| match order {
                    1 => present[j] - present[j - 1],
                    _ => present[j] - 2 * present[j - 1] + present[j - 2],
                })
                .collect();
            let minimum = differences.iter().copied().min().unwrap_or(0);
            descriptors.extend((0..order).map(|k| present.get(k).copied().unwrap_or(0)));
            descriptors.push(minimum);

            let mut stored = iter::repeat(0)
                .take(order.min(present.len()))
                .chain(differences.iter().map(|d| d - minimum));
            for value in ints.iter_mut().flatten() {
                *value = stored.next().unwrap_or(0);
            }
        }

        let missing = ints.iter().any(Option::is_none);
        let chunks: Vec<&[Option<i64>]> = ints.chunks(group_size.max(1)).collect();
        let mut references = Vec::with_capacity(chunks.len());
        let mut widths = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let (lo, hi) = chunk
                .iter()
                .flatten()
                .fold((i64::MAX, i64::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            if lo > hi {
                references.push(None);
                widths.push(0);
                continue;
            }
            let range = (hi - lo) as u64;
            let has_missing = chunk.iter().any(Option::is_none);
            references.push(Some(lo as u64));
            // All-ones at the group width is the missing marker whenever
            // missing values are managed.
            widths.push(if range == 0 && !has_missing {
                0
            } else {
                bit_length(range + u64::from(missing))
            });
        }

        let max_reference = references.iter().flatten().copied().max().unwrap_or(0);
        let bits_per_value = bit_length(max_reference + u64::from(missing)).max(1);
        let width_bits = bit_length(widths.iter().copied().max().unwrap_or(0) as u64).max(1);
        let lengths: Vec<u64> = chunks.iter().map(|c| c.len() as u64).collect();
        let length_bits = bit_length(lengths.iter().copied().max().unwrap_or(0)).max(1);
        let descriptor_octets = (1u32..=4)
            .find(|&n| descriptors.iter().all(|d| d.unsigned_abs() < 1 << (8 * n - 1)))
            .unwrap_or(4);

        let mut writer = BitWriter::default();
        for &d in &descriptors {
            let sign = if d < 0 { 1u64 << (8 * descriptor_octets - 1) } else { 0 };
            writer.write(d.unsigned_abs() | sign, 8 * descriptor_octets);
        }
        for reference in &references {
            writer.write(reference.unwrap_or(all_ones(bits_per_value)), bits_per_value);
        }
        writer.align();
        for &width in &widths {
            writer.write(width as u64, width_bits);
        }
        writer.align();
        for &length in &lengths {
            writer.write(length, length_bits);
        }
        writer.align();
        for ((chunk, reference), &width) in chunks.iter().zip(&references).zip(&widths) {
            if width == 0 {
                continue;
            }
            let reference = reference.unwrap_or(0);
            for &value in chunk.iter() {
                let packed = value.map(|v| v as u64 - reference).unwrap_or(all_ones(width));
                writer.write(packed, width);
            }
        }

        Self {
            reference_value,
            bits_per_value: bits_per_value as u8,
            missing_value_management: u8::from(missing),
            num_groups: chunks.len() as u32,
            width_bits: width_bits as u8,
            length_bits: length_bits as u8,
            last_length: lengths.last().copied().unwrap_or(0) as u32,
            descriptor_octets: descriptor_octets as u8,
            payload: writer.bytes,
        }
    }
}

/// MSB-first bit writer.
#[derive(Default)]
struct BitWriter {
    bytes: Vec<u8>,
    bits: usize,
}

impl BitWriter {
    fn write(&mut self, value: u64, width: u32) {
        for i in (0..width).rev() {
            if self.bits % 8 == 0 {
                self.bytes.push(0);
            }
            if (value >> i) & 1 == 1 {
                let last = self.bytes.len() - 1;
                self.bytes[last] |= 0x80 >> (self.bits % 8);
            }
            self.bits += 1;
        }
    }

    fn align(&mut self) {
        self.bits = self.bytes.len() * 8;
    }
}

fn bit_length(value: u64) -> u32 {
    64 - value.leading_zeros()
}

fn all_ones(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

/// GRIB2 sign-magnitude encoding.
fn grib_i16(value: i16) -> [u8; 2] {
    let magnitude = value.unsigned_abs() & 0x7FFF;
    let raw = if value < 0 { magnitude | 0x8000 } else { magnitude };
    raw.to_be_bytes()
}

fn grib_i32(value: i32) -> [u8; 4] {
    let magnitude = value.unsigned_abs() & 0x7FFF_FFFF;
    let raw = if value < 0 { magnitude | 0x8000_0000 } else { magnitude };
    raw.to_be_bytes()
}
