//! A single TEC map at one grid timestamp

use chrono::NaiveDateTime;
use ndarray::Array2;

/// 2-D grid of total electron content values at one timestamp
///
/// Maps are immutable once loaded. When a map contains non-finite cells a
/// validity mask is attached; the values themselves are never filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct TecMap {
    /// Grid timestamp (naive UTC)
    pub timestamp: NaiveDateTime,
    /// Values [height, width]
    pub values: Array2<f32>,
    /// `true` where the cell holds a finite value
    pub mask: Option<Array2<bool>>,
}

impl TecMap {
    /// Wrap a grid, attaching a mask if any cell is non-finite
    pub fn new(timestamp: NaiveDateTime, values: Array2<f32>) -> Self {
        let mask = if values.iter().all(|v| v.is_finite()) {
            None
        } else {
            Some(values.mapv(|v| v.is_finite()))
        };
        Self {
            timestamp,
            values,
            mask,
        }
    }

    /// (height, width)
    pub fn shape(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn height(&self) -> usize {
        self.values.nrows()
    }

    pub fn width(&self) -> usize {
        self.values.ncols()
    }

    /// True when every cell is finite
    pub fn is_complete(&self) -> bool {
        self.mask.is_none()
    }

    /// Number of finite cells
    pub fn valid_cells(&self) -> usize {
        match &self.mask {
            Some(mask) => mask.iter().filter(|&&m| m).count(),
            None => self.values.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2015, 1, 2)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_complete_map_has_no_mask() {
        let map = TecMap::new(ts(), Array2::from_elem((3, 4), 1.5));
        assert!(map.is_complete());
        assert_eq!(map.shape(), (3, 4));
        assert_eq!(map.valid_cells(), 12);
    }

    #[test]
    fn test_nan_cells_are_masked_not_filled() {
        let mut values = Array2::from_elem((2, 2), 3.0f32);
        values[[0, 1]] = f32::NAN;
        let map = TecMap::new(ts(), values);

        let mask = map.mask.as_ref().unwrap();
        assert!(!mask[[0, 1]]);
        assert!(mask[[1, 1]]);
        assert!(map.values[[0, 1]].is_nan());
        assert_eq!(map.valid_cells(), 3);
    }
}
