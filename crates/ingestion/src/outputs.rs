//! Where a build's records go.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use grid_store::{CoverageBitmap, GridStore};
use serde::{Deserialize, Serialize};
use tracing::info;
use wind_common::{GridAxes, RecordKey, SUFFIX_GRIBMIRROR};

use crate::error::{Result, UnpackError};
use crate::mirror::Mirror;

/// File name of the grid store inside a build's working directory.
pub const STORE_FILE_NAME: &str = "dataset";

/// Which artifacts a build produces. At least one must be enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOutputs {
    pub grid_store: bool,
    pub mirror: bool,
}

impl Default for BuildOutputs {
    fn default() -> Self {
        Self {
            grid_store: true,
            mirror: true,
        }
    }
}

impl BuildOutputs {
    pub fn validate(&self) -> Result<()> {
        if !self.grid_store && !self.mirror {
            return Err(UnpackError::NoOutputs);
        }
        Ok(())
    }
}

/// Paths of the finished artifacts of a closed sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkFiles {
    pub store: Option<PathBuf>,
    pub mirror: Option<PathBuf>,
}

/// The shared, mutable state of one build: the writable grid store, the
/// mirror and the coverage bitmap.
///
/// Only [`Unpacker`](crate::Unpacker) writes to a sink, and only after a
/// whole file has validated.
#[derive(Debug)]
pub struct BuildSink {
    axes: Arc<GridAxes>,
    pub(crate) store: Option<GridStore>,
    pub(crate) mirror: Option<Mirror>,
    pub(crate) coverage: CoverageBitmap,
}

impl BuildSink {
    pub fn new(axes: Arc<GridAxes>, store: Option<GridStore>, mirror: Option<Mirror>) -> Result<Self> {
        if store.is_none() && mirror.is_none() {
            return Err(UnpackError::NoOutputs);
        }
        if store.as_ref().is_some_and(|s| !s.is_writable()) {
            return Err(grid_store::StoreError::ReadOnly.into());
        }
        Ok(Self {
            coverage: CoverageBitmap::new(axes.clone()),
            axes,
            store,
            mirror,
        })
    }

    /// Create the enabled outputs inside `directory`.
    pub fn create(directory: &Path, axes: Arc<GridAxes>, outputs: BuildOutputs) -> Result<Self> {
        outputs.validate()?;
        let store = if outputs.grid_store {
            Some(GridStore::create(directory.join(STORE_FILE_NAME), axes.clone())?)
        } else {
            None
        };
        let mirror = if outputs.mirror {
            let name = format!("{}{}", STORE_FILE_NAME, SUFFIX_GRIBMIRROR);
            Some(Mirror::create(directory.join(name))?)
        } else {
            None
        };
        info!(
            directory = %directory.display(),
            grid_store = outputs.grid_store,
            mirror = outputs.mirror,
            "Created build outputs"
        );
        Self::new(axes, store, mirror)
    }

    pub fn axes(&self) -> &Arc<GridAxes> {
        &self.axes
    }

    pub fn coverage(&self) -> &CoverageBitmap {
        &self.coverage
    }

    pub fn store(&self) -> Option<&GridStore> {
        self.store.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.coverage.is_complete()
    }

    pub(crate) fn commit(&mut self, key: &RecordKey, values: &[f64], raw: &[u8]) -> Result<()> {
        if let Some(store) = self.store.as_mut() {
            store.write_field(key, values)?;
        }
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.append(raw)?;
        }
        self.coverage.set(key)?;
        Ok(())
    }

    /// Flush and close every output, returning the paths written.
    pub fn close(self) -> Result<SinkFiles> {
        let mut files = SinkFiles::default();
        if let Some(store) = self.store {
            files.store = Some(store.path().to_path_buf());
            store.close()?;
        }
        if let Some(mirror) = self.mirror {
            files.mirror = Some(mirror.path().to_path_buf());
            mirror.close()?;
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::tiny_axes;

    #[test]
    fn test_no_outputs_rejected() {
        let outputs = BuildOutputs {
            grid_store: false,
            mirror: false,
        };
        assert!(matches!(outputs.validate(), Err(UnpackError::NoOutputs)));

        let axes = Arc::new(tiny_axes());
        assert!(matches!(
            BuildSink::new(axes, None, None),
            Err(UnpackError::NoOutputs)
        ));
    }

    #[test]
    fn test_create_only_enabled_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let axes = Arc::new(tiny_axes());
        let outputs = BuildOutputs {
            grid_store: false,
            mirror: true,
        };

        let sink = BuildSink::create(dir.path(), axes, outputs).unwrap();
        assert!(sink.store().is_none());
        let files = sink.close().unwrap();

        assert_eq!(files.store, None);
        assert_eq!(files.mirror, Some(dir.path().join("dataset.gribmirror")));
        assert!(!dir.path().join(STORE_FILE_NAME).exists());
    }
}
