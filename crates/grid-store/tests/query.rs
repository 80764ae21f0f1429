//! Interpolation and file handling against a store filled with fixture data.

use std::sync::Arc;

use grid_store::{GridStore, QueryError, StoreError};
use test_utils::{assert_close, fixture_value, tiny_axes};
use wind_common::{GridAxes, GridIndex, RecordKey, Variable};

fn filled_store(dir: &std::path::Path, name: &str) -> (GridStore, Arc<GridAxes>) {
    let axes = Arc::new(tiny_axes());
    let mut store = GridStore::create(dir.join(name), axes.clone()).unwrap();
    let [hours, levels, _, nlat, nlon] = axes.shape();
    for hour in 0..hours {
        for level in 0..levels {
            for variable in Variable::ALL {
                let mut field = Vec::with_capacity(nlat * nlon);
                for lat in 0..nlat {
                    for lon in 0..nlon {
                        field.push(fixture_value(hour, level, variable, lat, lon) as f64);
                    }
                }
                let key = RecordKey {
                    hour,
                    level,
                    variable,
                };
                store.write_field(&key, &field).unwrap();
            }
        }
    }
    (store, axes)
}

fn cell(hour: usize, level: usize, variable: Variable, lat: usize, lon: usize) -> f64 {
    fixture_value(hour, level, variable, lat, lon) as f64
}

#[test]
fn test_query_is_identity_at_grid_points() {
    let dir = tempfile::tempdir().unwrap();
    let (store, axes) = filled_store(dir.path(), "store");
    let [hours, levels, _, nlat, nlon] = axes.shape();

    for hour in 0..hours {
        for level in 0..levels {
            for lat in 0..nlat {
                for lon in 0..nlon {
                    let altitude = cell(hour, level, Variable::Height, lat, lon);
                    let sample = store
                        .query(
                            axes.hours().value(hour),
                            altitude,
                            axes.latitude().value(lat),
                            axes.longitude().value(lon),
                        )
                        .unwrap();
                    assert_eq!(sample.u, cell(hour, level, Variable::WindU, lat, lon));
                    assert_eq!(sample.v, cell(hour, level, Variable::WindV, lat, lon));
                }
            }
        }
    }
}

#[test]
fn test_query_continuous_across_level_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let (store, axes) = filled_store(dir.path(), "store");
    let (hours, lat, lon) = (4.5, -0.25, 1.25);

    // The interpolated height column is linear in the cell values, so the
    // level-1 height at this point is the interpolation of the fixture.
    let (t, ft) = axes.hours().locate(hours).unwrap();
    let (i, fi) = axes.latitude().locate(lat).unwrap();
    let (j, fj) = axes.longitude().locate(lon).unwrap();
    let mut height = 0.0;
    for (dt, wt) in [(0, 1.0 - ft), (1, ft)] {
        for (di, wi) in [(0, 1.0 - fi), (1, fi)] {
            for (dj, wj) in [(0, 1.0 - fj), (1, fj)] {
                height += wt * wi * wj * cell(t + dt, 1, Variable::Height, i + di, j + dj);
            }
        }
    }

    let at = store.query(hours, height, lat, lon).unwrap();
    for eps in [1e-3, 1e-6] {
        let below = store.query(hours, height - eps, lat, lon).unwrap();
        let above = store.query(hours, height + eps, lat, lon).unwrap();
        assert_close!(below.u, at.u, 10.0 * eps);
        assert_close!(above.u, at.u, 10.0 * eps);
        assert_close!(below.v, at.v, 10.0 * eps);
        assert_close!(above.v, at.v, 10.0 * eps);
    }
}

#[test]
fn test_query_last_grid_point_is_valid() {
    let dir = tempfile::tempdir().unwrap();
    let (store, axes) = filled_store(dir.path(), "store");
    let [hours, _, _, nlat, nlon] = axes.shape();

    let altitude = cell(hours - 1, 0, Variable::Height, nlat - 1, nlon - 1);
    let sample = store
        .query(
            axes.hours().last(),
            altitude,
            axes.latitude().last(),
            axes.longitude().last(),
        )
        .unwrap();
    assert_eq!(
        sample.u,
        cell(hours - 1, 0, Variable::WindU, nlat - 1, nlon - 1)
    );
}

#[test]
fn test_query_out_of_range() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = filled_store(dir.path(), "store");

    assert!(matches!(
        store.query(-0.5, 100.0, 0.0, 0.0),
        Err(QueryError::OutOfRange { axis: "hour", .. })
    ));
    assert!(matches!(
        store.query(0.0, 100.0, 1.5, 0.0),
        Err(QueryError::OutOfRange {
            axis: "latitude",
            ..
        })
    ));
    assert!(matches!(
        store.query(0.0, 100.0, 0.0, 1.75),
        Err(QueryError::OutOfRange {
            axis: "longitude",
            ..
        })
    ));
}

#[test]
fn test_altitude_outside_column_extrapolates() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = filled_store(dir.path(), "store");

    // Lowest level pair at the origin: heights 0 and 1000, u 0 and 10.
    let sample = store.query(0.0, -500.0, -1.0, 0.0).unwrap();
    assert_close!(sample.u, -5.0);
    // Highest pair: heights 1000 and 2000, u 10 and 20.
    let sample = store.query(0.0, 2500.0, -1.0, 0.0).unwrap();
    assert_close!(sample.u, 25.0);
}

#[test]
fn test_open_one_byte_short_is_size_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let (store, axes) = filled_store(dir.path(), "2014060312");
    store.close().unwrap();

    let path = dir.path().join("2014060312");
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(axes.byte_len() - 1).unwrap();

    match GridStore::open_read_only(&path, axes.clone()) {
        Err(StoreError::SizeMismatch { expected, actual }) => {
            assert_eq!(expected, axes.byte_len());
            assert_eq!(actual, axes.byte_len() - 1);
        }
        other => panic!("expected SizeMismatch, got {:?}", other),
    }
}

#[test]
fn test_open_latest_picks_newest_committed() {
    let dir = tempfile::tempdir().unwrap();
    let (older, axes) = filled_store(dir.path(), "2014060306");
    older.close().unwrap();
    let (newer, _) = filled_store(dir.path(), "2014060312");
    newer.close().unwrap();
    std::fs::write(dir.path().join("2014060318.gribmirror"), b"").unwrap();

    let store = GridStore::open_latest(dir.path(), axes).unwrap();
    assert!(store.path().ends_with("2014060312"));
    assert!(!store.is_writable());

    let index = GridIndex {
        hour: 1,
        level: 2,
        variable: Variable::WindV,
        lat: 4,
        lon: 3,
    };
    assert_eq!(store.read(&index).unwrap(), cell(1, 2, Variable::WindV, 4, 3));
}

#[test]
fn test_open_latest_empty_directory() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        GridStore::open_latest(dir.path(), Arc::new(tiny_axes())),
        Err(StoreError::NoDataset(_))
    ));
}
