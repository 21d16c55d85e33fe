//! src/builder.rs
//!
//! Builds the train, valid and test datasets of a [`MegatronDataset`] type
//! from the blend described by its config.
//!
//! ```text
//! blend = [prefix]            -> one indexed corpus, documents cut by the split matrix
//! blend = [w1, p1, w2, p2]    -> every corpus cut by the split matrix, then blended per split
//! blend_per_split             -> each split draws from its own blend, whole corpora
//! ```

use crate::blended::BlendedDataset;
use crate::config::{Blend, DatasetConfig};
use crate::dataset::{Dataset, MegatronDataset};
use crate::indexed::MmapIndexedDataset;
use crate::sample::Sample;
use crate::split::{Split, SplitMatrix};
use crate::utils::normalize;
use anyhow::{anyhow, Context, Result};
use std::marker::PhantomData;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Over-sampling applied to every dataset of a blend so that rounding in
/// the blending indices never asks a dataset for more samples than it has.
const BLEND_SIZE_MARGIN: f64 = 1.005;

/// The dataset built for one split.
pub enum SplitDataset<D: Dataset> {
    Single(D),
    Blended(BlendedDataset<D>),
}

impl<D: Dataset> Dataset for SplitDataset<D> {
    fn len(&self) -> usize {
        match self {
            SplitDataset::Single(dataset) => dataset.len(),
            SplitDataset::Blended(dataset) => dataset.len(),
        }
    }

    fn get(&self, index: usize) -> Result<Sample> {
        match self {
            SplitDataset::Single(dataset) => dataset.get(index),
            SplitDataset::Blended(dataset) => dataset.get(index),
        }
    }
}

pub struct BlendedMegatronDatasetBuilder<D: MegatronDataset> {
    sizes: [usize; 3],
    config: Arc<D::Config>,
    _dataset: PhantomData<D>,
}

impl<D: MegatronDataset> BlendedMegatronDatasetBuilder<D> {
    /// `sizes` holds the number of samples requested for train, valid and test.
    pub fn new(sizes: [usize; 3], config: Arc<D::Config>) -> Self {
        Self {
            sizes,
            config,
            _dataset: PhantomData,
        }
    }

    /// Builds one dataset per split; splits without data are `None`.
    ///
    /// Ranks for which the config's `is_built_on_rank` is false build nothing.
    pub fn build(&self) -> Result<[Option<SplitDataset<D>>; 3]> {
        let gpt = self.config.gpt();
        if !gpt.is_built_on_rank() {
            debug!("skipping {} construction on this rank", D::NAME);
            return Ok([None, None, None]);
        }

        match (&gpt.blend, &gpt.blend_per_split) {
            (Some(blend), _) => {
                let split_matrix = gpt
                    .split_matrix
                    .ok_or_else(|| anyhow!("A blend requires a split matrix"))?;
                self.build_blend(blend, &split_matrix, self.sizes)
            }
            (None, Some(blend_per_split)) => {
                let mut datasets: [Option<SplitDataset<D>>; 3] = [None, None, None];
                for split in Split::ALL {
                    let Some(blend) = &blend_per_split[split.index()] else {
                        continue;
                    };
                    let mut split_matrix: SplitMatrix = [None; 3];
                    split_matrix[split.index()] = Some((0.0, 1.0));
                    let mut sizes = [0; 3];
                    sizes[split.index()] = self.sizes[split.index()];

                    let mut built = self.build_blend(blend, &split_matrix, sizes)?;
                    datasets[split.index()] = built[split.index()].take();
                }
                Ok(datasets)
            }
            (None, None) => Err(anyhow!("The config names no data to build from")),
        }
    }

    fn build_blend(
        &self,
        blend: &Blend,
        split_matrix: &SplitMatrix,
        sizes: [usize; 3],
    ) -> Result<[Option<SplitDataset<D>>; 3]> {
        if blend.len() == 1 {
            let datasets = self.build_dataset_splits(&blend.prefixes[0], split_matrix, sizes)?;
            return Ok(datasets.map(|dataset| dataset.map(SplitDataset::Single)));
        }

        let weights = blend.normalized_weights()?;
        let mut corpora = Vec::with_capacity(blend.len());
        for prefix in &blend.prefixes {
            let indexed_dataset = open_corpus(prefix)?;
            let ranges = document_ranges(split_matrix, D::num_elements(&indexed_dataset));
            corpora.push((prefix, indexed_dataset, ranges));
        }

        // Per split, the weights renormalized over the corpora that have
        // documents in it; corpora without documents keep a zero weight.
        let mut split_weights: [Option<Vec<f64>>; 3] = [None, None, None];
        for split in Split::ALL {
            if split_matrix[split.index()].is_none() {
                continue;
            }
            let present: Vec<bool> = corpora
                .iter()
                .map(|(_, _, ranges)| has_documents(&ranges[split.index()]))
                .collect();
            let kept = present.iter().filter(|&&present| present).count();
            if kept == 0 {
                warn!("No dataset of the blend has documents for the {} split", split);
                continue;
            }
            if kept < blend.len() {
                warn!(
                    "Only {} of {} blended datasets have documents for the {} split; reweighting",
                    kept,
                    blend.len(),
                    split
                );
            }
            let masked: Vec<f64> = weights
                .iter()
                .zip(&present)
                .map(|(&weight, &present)| if present { weight } else { 0.0 })
                .collect();
            split_weights[split.index()] = Some(normalize(&masked)?);
        }

        let mut per_split: [Vec<(f64, D)>; 3] = Default::default();
        for (corpus, (prefix, indexed_dataset, ranges)) in corpora.into_iter().enumerate() {
            let corpus_weights = split_weights
                .each_ref()
                .map(|weights| weights.as_ref().map_or(0.0, |weights| weights[corpus]));
            let dataset_sizes = Split::ALL.map(|split| {
                let weight = corpus_weights[split.index()];
                (sizes[split.index()] as f64 * weight * BLEND_SIZE_MARGIN).ceil() as usize
            });
            let datasets = self.build_ranges(prefix, indexed_dataset, &ranges, dataset_sizes)?;
            for (split, dataset) in Split::ALL.into_iter().zip(datasets) {
                if let Some(dataset) = dataset {
                    per_split[split.index()].push((corpus_weights[split.index()], dataset));
                }
            }
        }

        let mut blended: [Option<SplitDataset<D>>; 3] = [None, None, None];
        for (split, weighted) in Split::ALL.into_iter().zip(per_split) {
            if weighted.is_empty() {
                continue;
            }
            let (weights, datasets): (Vec<f64>, Vec<D>) = weighted.into_iter().unzip();
            let dataset = BlendedDataset::new(datasets, weights, sizes[split.index()])
                .with_context(|| format!("Failed to blend the {} datasets", split))?;
            blended[split.index()] = Some(SplitDataset::Blended(dataset));
        }
        Ok(blended)
    }

    /// Opens the corpus at `path_prefix` and builds a dataset for every split
    /// with a bookend in `split_matrix`.
    pub fn build_dataset_splits(
        &self,
        path_prefix: &Path,
        split_matrix: &SplitMatrix,
        sizes: [usize; 3],
    ) -> Result<[Option<D>; 3]> {
        let indexed_dataset = open_corpus(path_prefix)?;
        let ranges = document_ranges(split_matrix, D::num_elements(&indexed_dataset));
        self.build_ranges(path_prefix, indexed_dataset, &ranges, sizes)
    }

    fn build_ranges(
        &self,
        path_prefix: &Path,
        indexed_dataset: Arc<MmapIndexedDataset>,
        ranges: &[Option<Range<usize>>; 3],
        sizes: [usize; 3],
    ) -> Result<[Option<D>; 3]> {
        let mut datasets: [Option<D>; 3] = [None, None, None];
        for split in Split::ALL {
            let Some(range) = &ranges[split.index()] else {
                continue;
            };
            if range.is_empty() {
                warn!(
                    "The {} split of {} selects no documents; skipping it",
                    split,
                    path_prefix.display()
                );
                continue;
            }
            debug!(
                "{} split of {}: documents {}..{}",
                split,
                path_prefix.display(),
                range.start,
                range.end
            );

            let dataset = D::build(
                indexed_dataset.clone(),
                range.clone().collect(),
                sizes[split.index()],
                split,
                self.config.clone(),
            )
            .with_context(|| {
                format!("Failed to build the {} {} split", D::NAME, split)
            })?;
            datasets[split.index()] = Some(dataset);
        }
        Ok(datasets)
    }
}

fn open_corpus(path_prefix: &Path) -> Result<Arc<MmapIndexedDataset>> {
    let indexed_dataset = MmapIndexedDataset::open(path_prefix)?;
    info!(
        "Opened {} with {} documents",
        path_prefix.display(),
        indexed_dataset.len()
    );
    Ok(Arc::new(indexed_dataset))
}

/// Document range selected by each split's bookends; `None` where the split
/// has no bookend.
fn document_ranges(split_matrix: &SplitMatrix, num_elements: usize) -> [Option<Range<usize>>; 3] {
    (*split_matrix).map(|bookends| {
        bookends.map(|(begin, end)| {
            bookend_index(begin, num_elements)..bookend_index(end, num_elements)
        })
    })
}

fn has_documents(range: &Option<Range<usize>>) -> bool {
    range.as_ref().is_some_and(|range| !range.is_empty())
}

/// Position of a bookend fraction in `0..=num_elements`, rounding half to even.
fn bookend_index(fraction: f64, num_elements: usize) -> usize {
    (fraction * num_elements as f64).round_ties_even() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bookend_index_rounds_half_to_even() {
        assert_eq!(bookend_index(0.0, 10), 0);
        assert_eq!(bookend_index(1.0, 10), 10);
        assert_eq!(bookend_index(0.25, 10), 2);
        assert_eq!(bookend_index(0.75, 10), 8);
        assert_eq!(bookend_index(0.5, 5), 2);
    }

    #[test]
    fn test_document_ranges_follow_bookends() {
        let matrix: SplitMatrix = [Some((0.0, 0.98)), Some((0.98, 1.0)), None];

        let small = document_ranges(&matrix, 3);
        assert_eq!(small, [Some(0..3), Some(3..3), None]);
        assert!(has_documents(&small[0]));
        assert!(!has_documents(&small[1]));
        assert!(!has_documents(&small[2]));

        let large = document_ranges(&matrix, 40);
        assert_eq!(large, [Some(0..39), Some(39..40), None]);
        assert!(has_documents(&large[1]));
    }
}
