//! The memory-mapped tensor file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{Mmap, MmapMut};
use tracing::{debug, info};
use wind_common::{list_artifacts, GridAxes, GridIndex, RecordKey};

use crate::error::{StoreError, StoreResult};

enum Mapping {
    Writable(MmapMut),
    ReadOnly(Mmap),
}

/// A dense `f64` tensor over (hour, level, variable, latitude, longitude),
/// stored row-major in native byte order.
///
/// Cells of records that have not been written are undefined; track them
/// with a [`CoverageBitmap`](crate::CoverageBitmap).
pub struct GridStore {
    path: PathBuf,
    axes: Arc<GridAxes>,
    mapping: Mapping,
}

impl std::fmt::Debug for GridStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridStore")
            .field("path", &self.path)
            .field("writable", &self.is_writable())
            .finish()
    }
}

impl GridStore {
    /// Create (or truncate) a store file of exactly the right size and map
    /// it read-write.
    pub fn create(path: impl AsRef<Path>, axes: Arc<GridAxes>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(axes.byte_len())?;

        // SAFETY: the file was just created by us and is not shared with
        // other writers for the lifetime of the mapping.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        info!(path = %path.display(), bytes = axes.byte_len(), "Created grid store");

        Ok(Self {
            path,
            axes,
            mapping: Mapping::Writable(mmap),
        })
    }

    /// Map an existing store read-only. The file size is checked before
    /// any mapping is made.
    pub fn open_read_only(path: impl AsRef<Path>, axes: Arc<GridAxes>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let actual = file.metadata()?.len();
        let expected = axes.byte_len();
        if actual != expected {
            return Err(StoreError::SizeMismatch { expected, actual });
        }

        // SAFETY: committed stores are immutable once renamed into place.
        let mmap = unsafe { Mmap::map(&file)? };
        debug!(path = %path.display(), "Opened grid store read-only");

        Ok(Self {
            path,
            axes,
            mapping: Mapping::ReadOnly(mmap),
        })
    }

    /// Open the newest committed store in `directory`.
    pub fn open_latest(directory: impl AsRef<Path>, axes: Arc<GridAxes>) -> StoreResult<Self> {
        let directory = directory.as_ref();
        let latest = list_artifacts(directory, Some(&[""]))?
            .pop()
            .ok_or_else(|| StoreError::NoDataset(directory.to_path_buf()))?;
        info!(build = %latest.build_time, "Opening latest dataset");
        Self::open_read_only(latest.path, axes)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn axes(&self) -> &Arc<GridAxes> {
        &self.axes
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.mapping, Mapping::Writable(_))
    }

    /// The whole tensor as a flat slice.
    pub fn values(&self) -> StoreResult<&[f64]> {
        let bytes: &[u8] = match &self.mapping {
            Mapping::Writable(m) => &m[..],
            Mapping::ReadOnly(m) => &m[..],
        };
        bytemuck::try_cast_slice(bytes).map_err(|e| StoreError::Layout(format!("{:?}", e)))
    }

    fn values_mut(&mut self) -> StoreResult<&mut [f64]> {
        match &mut self.mapping {
            Mapping::Writable(m) => {
                bytemuck::try_cast_slice_mut(&mut m[..]).map_err(|e| StoreError::Layout(format!("{:?}", e)))
            }
            Mapping::ReadOnly(_) => Err(StoreError::ReadOnly),
        }
    }

    pub fn read(&self, index: &GridIndex) -> StoreResult<f64> {
        Ok(self.values()?[self.axes.cell_offset(index)])
    }

    pub fn write_cell(&mut self, index: &GridIndex, value: f64) -> StoreResult<()> {
        let offset = self.axes.cell_offset(index);
        self.values_mut()?[offset] = value;
        Ok(())
    }

    /// Write one record. `values` are in store order: latitude ascending,
    /// longitude ascending, longitude varying fastest.
    pub fn write_field(&mut self, key: &RecordKey, values: &[f64]) -> StoreResult<()> {
        let expected = self.axes.field_len();
        if values.len() != expected {
            return Err(StoreError::FieldLength {
                expected,
                actual: values.len(),
            });
        }
        let start = self.axes.field_offset(key);
        self.values_mut()?[start..start + expected].copy_from_slice(values);
        Ok(())
    }

    /// Read one record in store order.
    pub fn read_field(&self, key: &RecordKey) -> StoreResult<&[f64]> {
        let start = self.axes.field_offset(key);
        Ok(&self.values()?[start..start + self.axes.field_len()])
    }

    pub fn flush(&self) -> StoreResult<()> {
        if let Mapping::Writable(m) = &self.mapping {
            m.flush()?;
        }
        Ok(())
    }

    /// Flush and release the mapping.
    pub fn close(self) -> StoreResult<()> {
        self.flush()?;
        debug!(path = %self.path.display(), "Closed grid store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::tiny_axes;
    use wind_common::Variable;

    #[test]
    fn test_create_sizes_file() {
        let dir = tempfile::tempdir().unwrap();
        let axes = Arc::new(tiny_axes());
        let path = dir.path().join("store");

        let store = GridStore::create(&path, axes.clone()).unwrap();
        assert!(store.is_writable());
        store.close().unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), axes.byte_len());
    }

    #[test]
    fn test_write_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let axes = Arc::new(tiny_axes());
        let path = dir.path().join("store");
        let index = GridIndex {
            hour: 2,
            level: 1,
            variable: Variable::WindV,
            lat: 3,
            lon: 1,
        };

        let mut store = GridStore::create(&path, axes.clone()).unwrap();
        store.write_cell(&index, -12.5).unwrap();
        store.close().unwrap();

        let store = GridStore::open_read_only(&path, axes).unwrap();
        assert_eq!(store.read(&index).unwrap(), -12.5);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let axes = Arc::new(tiny_axes());
        let path = dir.path().join("store");
        GridStore::create(&path, axes.clone()).unwrap().close().unwrap();

        let mut store = GridStore::open_read_only(&path, axes).unwrap();
        let key = RecordKey {
            hour: 0,
            level: 0,
            variable: Variable::Height,
        };
        assert!(matches!(
            store.write_field(&key, &[0.0; 20]),
            Err(StoreError::ReadOnly)
        ));
    }

    #[test]
    fn test_write_field_checks_length() {
        let dir = tempfile::tempdir().unwrap();
        let axes = Arc::new(tiny_axes());
        let mut store = GridStore::create(dir.path().join("store"), axes).unwrap();
        let key = RecordKey {
            hour: 0,
            level: 0,
            variable: Variable::Height,
        };
        assert!(matches!(
            store.write_field(&key, &[0.0; 19]),
            Err(StoreError::FieldLength {
                expected: 20,
                actual: 19
            })
        ));
    }
}
