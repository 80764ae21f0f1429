//! Write-once record coverage.

use std::sync::Arc;

use wind_common::{GridAxes, RecordKey, RecordName};

use crate::error::{StoreError, StoreResult};

/// One bit per (hour, level, variable) record.
///
/// Bits only ever go from unset to set. Setting a bit twice is an error:
/// it means two sources supplied the same record.
#[derive(Debug, Clone)]
pub struct CoverageBitmap {
    axes: Arc<GridAxes>,
    bits: Vec<bool>,
    set: usize,
}

impl CoverageBitmap {
    pub fn new(axes: Arc<GridAxes>) -> Self {
        let bits = vec![false; axes.record_count()];
        Self { axes, bits, set: 0 }
    }

    pub fn is_set(&self, key: &RecordKey) -> bool {
        self.bits[self.axes.record_offset(key)]
    }

    pub fn set(&mut self, key: &RecordKey) -> StoreResult<()> {
        let offset = self.axes.record_offset(key);
        if self.bits[offset] {
            return Err(StoreError::DuplicateRecord(
                self.axes.record_name(key).to_string(),
            ));
        }
        self.bits[offset] = true;
        self.set += 1;
        Ok(())
    }

    /// Number of records present.
    pub fn count(&self) -> usize {
        self.set
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set == 0
    }

    pub fn is_complete(&self) -> bool {
        self.set == self.bits.len()
    }

    /// Records not yet present, in axis order.
    pub fn missing(&self) -> Vec<RecordName> {
        self.axes
            .required_records()
            .into_iter()
            .filter(|name| {
                self.axes
                    .record_key(name)
                    .map(|key| !self.is_set(&key))
                    .unwrap_or(false)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::tiny_axes;
    use wind_common::Variable;

    #[test]
    fn test_fills_to_complete() {
        let axes = Arc::new(tiny_axes());
        let mut coverage = CoverageBitmap::new(axes.clone());
        assert_eq!(coverage.len(), 27);
        assert!(coverage.is_empty());

        for name in axes.required_records() {
            coverage.set(&axes.record_key(&name).unwrap()).unwrap();
        }
        assert!(coverage.is_complete());
        assert!(coverage.missing().is_empty());
    }

    #[test]
    fn test_second_set_is_duplicate() {
        let axes = Arc::new(tiny_axes());
        let mut coverage = CoverageBitmap::new(axes.clone());
        let key = axes
            .record_key(&RecordName::new(3, 850, Variable::WindU))
            .unwrap();

        coverage.set(&key).unwrap();
        assert!(matches!(
            coverage.set(&key),
            Err(StoreError::DuplicateRecord(_))
        ));
        assert_eq!(coverage.count(), 1);
    }

    #[test]
    fn test_missing_lists_unset_records() {
        let axes = Arc::new(tiny_axes());
        let mut coverage = CoverageBitmap::new(axes.clone());
        let absent = RecordName::new(6, 500, Variable::Height);
        for name in axes.required_records() {
            if name != absent {
                coverage.set(&axes.record_key(&name).unwrap()).unwrap();
            }
        }
        assert!(!coverage.is_complete());
        assert_eq!(coverage.missing(), vec![absent]);
    }
}
