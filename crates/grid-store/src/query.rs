//! Point interpolation of wind from the store.
//!
//! A query is linear in time, latitude and longitude, and linear in
//! altitude between the two pressure levels whose heights bracket the
//! requested altitude at that point.

use serde::Serialize;
use wind_common::{GridAxes, RegularAxis, Variable};

use crate::error::QueryError;
use crate::store::GridStore;

/// Interpolated horizontal wind, in m/s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindSample {
    pub u: f64,
    pub v: f64,
}

/// Fractional position in time, latitude and longitude.
#[derive(Debug, Clone, Copy)]
struct Position {
    hour: (usize, f64),
    lat: (usize, f64),
    lon: (usize, f64),
}

fn locate(axis: &RegularAxis, name: &'static str, value: f64) -> Result<(usize, f64), QueryError> {
    axis.locate(value)
        .ok_or(QueryError::OutOfRange { axis: name, value })
}

/// `a` at `f = 0`, `b` at `f = 1`, exactly.
fn lerp(a: f64, b: f64, f: f64) -> f64 {
    a * (1.0 - f) + b * f
}

impl GridStore {
    /// Wind at `hours` after the build time, `altitude` metres above sea
    /// level, `lat` degrees north and `lon` degrees east (0 to 360).
    ///
    /// Coordinates outside the axes fail with [`QueryError::OutOfRange`];
    /// latitude, longitude and time are not wrapped or clamped. Altitudes
    /// outside the height column extrapolate from the nearest level pair.
    ///
    /// The level pair is chosen from the height column interpolated at the
    /// query point, not from the column of a surrounding grid corner.
    pub fn query(
        &self,
        hours: f64,
        altitude: f64,
        lat: f64,
        lon: f64,
    ) -> Result<WindSample, QueryError> {
        let axes = self.axes();
        let position = Position {
            hour: locate(axes.hours(), "hour", hours)?,
            lat: locate(axes.latitude(), "latitude", lat)?,
            lon: locate(axes.longitude(), "longitude", lon)?,
        };
        if !altitude.is_finite() {
            return Err(QueryError::OutOfRange {
                axis: "altitude",
                value: altitude,
            });
        }

        let values = self.values()?;
        let sample = |level: usize, variable: Variable| {
            interpolate_3d(values, axes, &position, level, variable)
        };

        let levels = axes.pressures().len();
        let heights: Vec<f64> = (0..levels).map(|k| sample(k, Variable::Height)).collect();
        let lower = bracket(&heights, altitude);

        let (below, above) = (heights[lower], heights[lower + 1]);
        let fraction = if above == below {
            0.0
        } else {
            (altitude - below) / (above - below)
        };

        Ok(WindSample {
            u: lerp(
                sample(lower, Variable::WindU),
                sample(lower + 1, Variable::WindU),
                fraction,
            ),
            v: lerp(
                sample(lower, Variable::WindV),
                sample(lower + 1, Variable::WindV),
                fraction,
            ),
        })
    }
}

/// Lower index of the level pair bracketing `altitude` in an ascending
/// height column, clamped to the first and last pair.
fn bracket(heights: &[f64], altitude: f64) -> usize {
    let at_or_below = heights.partition_point(|&h| h <= altitude);
    at_or_below.saturating_sub(1).min(heights.len() - 2)
}

/// Interpolate one variable at one level over the 8 surrounding grid
/// points: time first, then latitude, then longitude.
fn interpolate_3d(
    values: &[f64],
    axes: &GridAxes,
    position: &Position,
    level: usize,
    variable: Variable,
) -> f64 {
    let [_, levels, variables, nlat, nlon] = axes.shape();
    let cell = |hour: usize, lat: usize, lon: usize| {
        let offset = (((hour * levels + level) * variables + variable.index()) * nlat + lat) * nlon + lon;
        values[offset]
    };

    let (t, ft) = position.hour;
    let (i, fi) = position.lat;
    let (j, fj) = position.lon;

    let at = |lat: usize, lon: usize| lerp(cell(t, lat, lon), cell(t + 1, lat, lon), ft);
    let west = lerp(at(i, j), at(i + 1, j), fi);
    let east = lerp(at(i, j + 1), at(i + 1, j + 1), fi);
    lerp(west, east, fj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lerp_endpoints_exact() {
        assert_eq!(lerp(0.1, 0.7, 0.0), 0.1);
        assert_eq!(lerp(0.1, 0.7, 1.0), 0.7);
        assert_eq!(lerp(2.0, 4.0, 0.5), 3.0);
    }

    #[test]
    fn test_bracket_clamps() {
        let heights = [100.0, 1500.0, 5500.0];
        assert_eq!(bracket(&heights, -50.0), 0);
        assert_eq!(bracket(&heights, 100.0), 0);
        assert_eq!(bracket(&heights, 1499.0), 0);
        assert_eq!(bracket(&heights, 1500.0), 1);
        assert_eq!(bracket(&heights, 5500.0), 1);
        assert_eq!(bracket(&heights, 30000.0), 1);
    }
}
