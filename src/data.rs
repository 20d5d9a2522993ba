use crate::error::{Result, StampNetError};
use candle_core::{Device, Tensor};
use std::collections::BTreeSet;

/// Full-frame side in pixels; postage stamps must tile it exactly.
pub const FRAME_SIDE: usize = 2048;

/// Postage-stamp size and coarse-graining factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StampGeometry {
    pub gridsize: usize,
    pub cgfactor: usize,
}

impl Default for StampGeometry {
    fn default() -> Self {
        Self {
            gridsize: 128,
            cgfactor: 8,
        }
    }
}

impl StampGeometry {
    pub fn new(gridsize: usize, cgfactor: usize) -> Self {
        Self { gridsize, cgfactor }
    }

    /// The coarse-grained side has to be a multiple of 4. This also makes
    /// `gridsize` a multiple of 4, so both max-pool layers divide it evenly.
    pub fn validate(&self) -> Result<()> {
        if self.gridsize == 0 || FRAME_SIDE % self.gridsize != 0 {
            return Err(StampNetError::PreconditionViolation(format!(
                "gridsize {} must evenly divide {FRAME_SIDE}",
                self.gridsize
            )));
        }
        if self.cgfactor == 0 || self.gridsize % self.cgfactor != 0 {
            return Err(StampNetError::PreconditionViolation(format!(
                "cgfactor {} must evenly divide gridsize {}",
                self.cgfactor, self.gridsize
            )));
        }
        if self.coarse_side() % 4 != 0 {
            return Err(StampNetError::PreconditionViolation(format!(
                "gridsize / cgfactor = {} must be a multiple of 4",
                self.coarse_side()
            )));
        }
        Ok(())
    }

    /// Side of the square image the network sees.
    pub fn side(&self) -> usize {
        self.gridsize
    }

    /// Side of the stamp after coarse-graining by `cgfactor`.
    pub fn coarse_side(&self) -> usize {
        self.gridsize / self.cgfactor
    }

    /// Features per example, `gridsize²`.
    pub fn n_features(&self) -> usize {
        self.gridsize * self.gridsize
    }
}

/// Read position into a fixed-size example set, advanced one batch at a time
/// and wrapping around at the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclicCursor {
    position: usize,
    len: usize,
}

impl CyclicCursor {
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(StampNetError::DataShapeMismatch(
                "cannot cycle over an empty example set".to_string(),
            ));
        }
        Ok(Self { position: 0, len })
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Indices `(position + k) mod len` for `k in 0..batch_size`. A batch
    /// larger than the set repeats indices.
    pub fn next_batch(&mut self, batch_size: usize) -> Vec<usize> {
        let indices = (0..batch_size)
            .map(|k| (self.position + k) % self.len)
            .collect();
        self.position = (self.position + batch_size) % self.len;
        indices
    }
}

/// Column assignment used when one-hot encoding enumerated labels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OneHotIndexing {
    /// Label `l` lands in column `l - 1`; label 0 wraps to the last column.
    #[default]
    Shifted,
    /// Label `l` lands in column `l`.
    Direct,
}

/// Map raw labels to dense class indices in sorted order of the distinct
/// raw values.
pub fn enumerate_labels<T: Ord + Clone>(raw: &[T]) -> Vec<usize> {
    let classes: Vec<T> = raw.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect();
    raw.iter()
        .map(|label| classes.binary_search(label).unwrap_or_default())
        .collect()
}

/// Row-major one-hot matrix with `max(labels) + 1` columns.
pub fn one_hot(labels: &[usize], indexing: OneHotIndexing) -> Result<(Vec<f32>, usize)> {
    let n_categories = match labels.iter().max() {
        Some(max) => max + 1,
        None => {
            return Err(StampNetError::DataShapeMismatch(
                "no labels to encode".to_string(),
            ))
        }
    };
    let mut encoded = vec![0f32; labels.len() * n_categories];
    for (row, &label) in labels.iter().enumerate() {
        let col = match indexing {
            OneHotIndexing::Shifted if label == 0 => n_categories - 1,
            OneHotIndexing::Shifted => label - 1,
            OneHotIndexing::Direct => label,
        };
        encoded[row * n_categories + col] = 1.0;
    }
    Ok((encoded, n_categories))
}

/// Design matrix and one-hot labels, resident on the training device.
#[derive(Debug, Clone)]
pub struct ExampleSet {
    features: Tensor,
    labels: Tensor,
    len: usize,
    n_features: usize,
    n_categories: usize,
}

impl ExampleSet {
    pub fn new(
        features: Vec<f32>,
        n_features: usize,
        one_hot: Vec<f32>,
        n_categories: usize,
        device: &Device,
    ) -> Result<Self> {
        if n_features == 0 || n_categories == 0 {
            return Err(StampNetError::DataShapeMismatch(format!(
                "feature width {n_features} and category count {n_categories} must be non-zero"
            )));
        }
        if features.len() % n_features != 0 {
            return Err(StampNetError::DataShapeMismatch(format!(
                "{} feature values do not split into rows of {n_features}",
                features.len()
            )));
        }
        let len = features.len() / n_features;
        if len == 0 {
            return Err(StampNetError::DataShapeMismatch(
                "example set is empty".to_string(),
            ));
        }
        if one_hot.len() != len * n_categories {
            return Err(StampNetError::DataShapeMismatch(format!(
                "{len} feature rows but {} label values for {n_categories} categories",
                one_hot.len()
            )));
        }
        let features = Tensor::from_vec(features, (len, n_features), device)?;
        let labels = Tensor::from_vec(one_hot, (len, n_categories), device)?;
        Ok(Self {
            features,
            labels,
            len,
            n_features,
            n_categories,
        })
    }

    /// Build from enumerated labels, one-hot encoding them on the way.
    pub fn from_labels(
        features: Vec<f32>,
        n_features: usize,
        labels: &[usize],
        indexing: OneHotIndexing,
        device: &Device,
    ) -> Result<Self> {
        let (encoded, n_categories) = one_hot(labels, indexing)?;
        Self::new(features, n_features, encoded, n_categories, device)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_categories(&self) -> usize {
        self.n_categories
    }

    /// Gather feature and label rows, in order, for the given indices.
    pub fn batch(&self, indices: &[usize]) -> Result<(Tensor, Tensor)> {
        let ids: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let ids = Tensor::from_vec(ids, indices.len(), self.features.device())?;
        let x = self.features.index_select(&ids, 0)?;
        let y = self.labels.index_select(&ids, 0)?;
        Ok((x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_even_split_partitions_dataset() {
        let mut cursor = CyclicCursor::new(100).unwrap();
        let first = cursor.next_batch(50);
        assert_eq!(cursor.position(), 50);
        let second = cursor.next_batch(50);
        assert_eq!(cursor.position(), 0);

        let mut all: Vec<usize> = first.iter().chain(second.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn cursor_batch_larger_than_set_repeats_indices() {
        let mut cursor = CyclicCursor::new(3).unwrap();
        assert_eq!(cursor.next_batch(5), vec![0, 1, 2, 0, 1]);
        assert_eq!(cursor.position(), 2);
        assert_eq!(cursor.next_batch(5), vec![2, 0, 1, 2, 0]);
        assert_eq!(cursor.position(), 1);
    }

    #[test]
    fn cursor_positions_have_expected_period() {
        for (len, batch) in [(100usize, 50usize), (7, 3), (12, 8), (5, 5), (1, 4)] {
            let mut cursor = CyclicCursor::new(len).unwrap();
            let period = len / gcd(len, batch);
            for step in 1..=period {
                cursor.next_batch(batch);
                if step < period {
                    assert_ne!(cursor.position(), 0, "len={len} batch={batch} step={step}");
                }
            }
            assert_eq!(cursor.position(), 0, "len={len} batch={batch}");
        }
    }

    fn gcd(a: usize, b: usize) -> usize {
        if b == 0 {
            a
        } else {
            gcd(b, a % b)
        }
    }

    #[test]
    fn empty_cursor_is_rejected() {
        assert!(matches!(
            CyclicCursor::new(0),
            Err(StampNetError::DataShapeMismatch(_))
        ));
    }

    #[test]
    fn default_geometry_passes() {
        let geometry = StampGeometry::default();
        geometry.validate().unwrap();
        assert_eq!(geometry.side(), 128);
        assert_eq!(geometry.coarse_side(), 16);
        assert_eq!(geometry.n_features(), 128 * 128);
    }

    #[test]
    fn geometry_rejects_gridsize_not_dividing_frame() {
        let err = StampGeometry::new(100, 5).validate().unwrap_err();
        assert!(matches!(err, StampNetError::PreconditionViolation(_)));
    }

    #[test]
    fn geometry_rejects_side_not_multiple_of_four() {
        // 128 / 16 = 8 is fine, 128 / 64 = 2 is not
        StampGeometry::new(128, 16).validate().unwrap();
        let err = StampGeometry::new(128, 64).validate().unwrap_err();
        assert!(matches!(err, StampNetError::PreconditionViolation(_)));
        let err = StampGeometry::new(128, 0).validate().unwrap_err();
        assert!(matches!(err, StampNetError::PreconditionViolation(_)));
    }

    #[test]
    fn one_hot_shifted_wraps_label_zero_to_last_column() {
        let (encoded, n) = one_hot(&[0, 1, 2], OneHotIndexing::Shifted).unwrap();
        assert_eq!(n, 3);
        let rows: Vec<&[f32]> = encoded.chunks(n).collect();
        // label 0 -> column -1, i.e. the last one
        assert_eq!(rows[0], &[0.0, 0.0, 1.0]);
        assert_eq!(rows[1], &[1.0, 0.0, 0.0]);
        assert_eq!(rows[2], &[0.0, 1.0, 0.0]);
    }

    #[test]
    fn one_hot_direct_uses_label_as_column() {
        let (encoded, n) = one_hot(&[0, 1, 2], OneHotIndexing::Direct).unwrap();
        let rows: Vec<&[f32]> = encoded.chunks(n).collect();
        assert_eq!(rows[0], &[1.0, 0.0, 0.0]);
        assert_eq!(rows[1], &[0.0, 1.0, 0.0]);
        assert_eq!(rows[2], &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn one_hot_of_nothing_is_an_error() {
        assert!(one_hot(&[], OneHotIndexing::Shifted).is_err());
    }

    #[test]
    fn enumerate_labels_uses_sorted_distinct_order() {
        let raw = ["streak", "cosmic", "streak", "worm"];
        assert_eq!(enumerate_labels(&raw), vec![1, 0, 1, 2]);
        assert_eq!(enumerate_labels(&[7, 3, 3, 9]), vec![1, 0, 0, 2]);
    }

    #[test]
    fn example_set_rejects_row_count_mismatch() {
        let features = vec![0.0; 3 * 4];
        let one_hot = vec![0.0; 2 * 2];
        let err = ExampleSet::new(features, 4, one_hot, 2, &Device::Cpu).unwrap_err();
        assert!(matches!(err, StampNetError::DataShapeMismatch(_)));
    }

    #[test]
    fn example_set_rejects_ragged_features() {
        let err = ExampleSet::from_labels(
            vec![0.0; 7],
            4,
            &[0, 1],
            OneHotIndexing::Shifted,
            &Device::Cpu,
        )
        .unwrap_err();
        assert!(matches!(err, StampNetError::DataShapeMismatch(_)));
    }

    #[test]
    fn batch_gathers_rows_in_index_order() {
        let features: Vec<f32> = (0..6).map(|v| v as f32).collect();
        let set = ExampleSet::from_labels(
            features,
            2,
            &[1, 2, 0],
            OneHotIndexing::Shifted,
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.n_categories(), 3);

        let (x, y) = set.batch(&[2, 0, 2]).unwrap();
        assert_eq!(
            x.to_vec2::<f32>().unwrap(),
            vec![vec![4.0, 5.0], vec![0.0, 1.0], vec![4.0, 5.0]]
        );
        assert_eq!(
            y.to_vec2::<f32>().unwrap(),
            vec![
                vec![0.0, 0.0, 1.0],
                vec![1.0, 0.0, 0.0],
                vec![0.0, 0.0, 1.0]
            ]
        );
    }
}
