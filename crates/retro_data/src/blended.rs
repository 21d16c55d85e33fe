//! src/blended.rs
//!
//! Weighted interleaving of several datasets of the same type.

use crate::dataset::Dataset;
use crate::sample::{Sample, DATASET_ID};
use anyhow::{ensure, Result};
use tch::Tensor;
use tracing::debug;

/// Draws `size` samples from `datasets` in proportion to `weights`.
///
/// Sample `i` of the blend is sample `dataset_sample_index[i]` of dataset
/// `dataset_index[i]`. Every returned sample carries a `"dataset_id"` feature.
pub struct BlendedDataset<D: Dataset> {
    datasets: Vec<D>,
    weights: Vec<f64>,
    size: usize,
    dataset_index: Vec<usize>,
    dataset_sample_index: Vec<usize>,
}

impl<D: Dataset> BlendedDataset<D> {
    /// `weights` must be normalized and have one entry per dataset.
    pub fn new(datasets: Vec<D>, weights: Vec<f64>, size: usize) -> Result<Self> {
        ensure!(!datasets.is_empty(), "A blended dataset needs at least one dataset");
        ensure!(
            datasets.len() == weights.len(),
            "Got {} datasets but {} weights",
            datasets.len(),
            weights.len()
        );

        let (dataset_index, dataset_sample_index) = build_blending_indices(&weights, size);

        for (id, dataset) in datasets.iter().enumerate() {
            let drawn = dataset_index.iter().filter(|&&d| d == id).count();
            ensure!(
                drawn <= dataset.len(),
                "Dataset {} holds {} samples but the blend draws {}",
                id,
                dataset.len(),
                drawn
            );
        }
        debug!("blended {} datasets into {} samples", datasets.len(), size);

        Ok(Self {
            datasets,
            weights,
            size,
            dataset_index,
            dataset_sample_index,
        })
    }

    pub fn datasets(&self) -> &[D] {
        &self.datasets
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn dataset_index(&self) -> &[usize] {
        &self.dataset_index
    }
}

impl<D: Dataset> Dataset for BlendedDataset<D> {
    fn len(&self) -> usize {
        self.size
    }

    fn get(&self, index: usize) -> Result<Sample> {
        ensure!(
            index < self.size,
            "Sample index {} out of bounds for blend of size {}",
            index,
            self.size
        );
        let dataset_id = self.dataset_index[index];
        let sample = self.datasets[dataset_id].get(self.dataset_sample_index[index])?;
        Ok(sample.with_feature(DATASET_ID, Tensor::from_slice(&[dataset_id as i64])))
    }
}

/// Greedily assigns each blend position to the dataset furthest behind its
/// target share.
///
/// Returns `(dataset_index, dataset_sample_index)`.
pub fn build_blending_indices(weights: &[f64], size: usize) -> (Vec<usize>, Vec<usize>) {
    let mut dataset_index = Vec::with_capacity(size);
    let mut dataset_sample_index = Vec::with_capacity(size);
    let mut current_samples = vec![0usize; weights.len()];

    for sample_idx in 0..size {
        let target = sample_idx.max(1) as f64;
        let mut max_error_index = 0;
        let mut max_error = f64::NEG_INFINITY;
        for (dataset_idx, &weight) in weights.iter().enumerate() {
            let error = weight * target - current_samples[dataset_idx] as f64;
            if error > max_error {
                max_error = error;
                max_error_index = dataset_idx;
            }
        }
        dataset_index.push(max_error_index);
        dataset_sample_index.push(current_samples[max_error_index]);
        current_samples[max_error_index] += 1;
    }

    (dataset_index, dataset_sample_index)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant {
        value: i64,
        len: usize,
    }

    impl Dataset for Constant {
        fn len(&self) -> usize {
            self.len
        }

        fn get(&self, index: usize) -> Result<Sample> {
            ensure!(index < self.len, "out of bounds");
            Ok(Sample::from_tokens(&[self.value, index as i64]))
        }
    }

    #[test]
    fn test_blending_indices_follow_weights() {
        let (dataset_index, dataset_sample_index) = build_blending_indices(&[0.25, 0.75], 8);
        assert_eq!(dataset_index, vec![1, 0, 1, 1, 0, 1, 1, 1]);
        assert_eq!(dataset_sample_index, vec![0, 0, 1, 2, 1, 3, 4, 5]);

        let counts = (0..2)
            .map(|d| dataset_index.iter().filter(|&&i| i == d).count())
            .collect::<Vec<_>>();
        assert_eq!(counts, vec![2, 6]);
    }

    #[test]
    fn test_get_adds_dataset_id() -> Result<()> {
        let datasets = vec![Constant { value: 10, len: 5 }, Constant { value: 20, len: 5 }];
        let blend = BlendedDataset::new(datasets, vec![0.5, 0.5], 6)?;
        assert_eq!(blend.len(), 6);

        for index in 0..blend.len() {
            let sample = blend.get(index)?;
            let dataset_id = sample.to_vec_i64(DATASET_ID)?[0];
            let text = sample.to_vec_i64(crate::sample::TEXT)?;
            assert_eq!(text[0], (dataset_id + 1) * 10);
        }
        assert!(blend.get(6).is_err());
        Ok(())
    }

    #[test]
    fn test_rejects_undersized_dataset() {
        let datasets = vec![Constant { value: 1, len: 1 }, Constant { value: 2, len: 10 }];
        assert!(BlendedDataset::new(datasets, vec![0.5, 0.5], 6).is_err());
    }
}
