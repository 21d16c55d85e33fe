use crate::config::DatasetConfig;
use crate::indexed::MmapIndexedDataset;
use crate::sample::Sample;
use crate::split::Split;
use anyhow::Result;
use std::sync::Arc;

/// A `Dataset` provides random access to [`Sample`]s.
///
/// Datasets are immutable once built, so they must be `Send + Sync` to be
/// shared by data-loading threads.
pub trait Dataset: Send + Sync {
    /// Number of samples.
    fn len(&self) -> usize;

    /// Sample at `index`; out-of-bounds indices are an error.
    fn get(&self, index: usize) -> Result<Sample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over all samples in index order.
    fn iter(&self) -> Box<dyn Iterator<Item = Result<Sample>> + '_> {
        Box::new((0..self.len()).map(move |index| self.get(index)))
    }
}

/// A dataset built over one split of a Megatron indexed corpus.
///
/// [`BlendedMegatronDatasetBuilder`](crate::builder::BlendedMegatronDatasetBuilder)
/// is generic over this trait: it opens the corpus, carves out the document
/// range of every split and hands it to [`build`](Self::build).
pub trait MegatronDataset: Dataset + Sized + 'static {
    type Config: DatasetConfig;

    /// Name used in cache file names and unique descriptions.
    const NAME: &'static str;

    fn build(
        indexed_dataset: Arc<MmapIndexedDataset>,
        indexed_indices: Vec<usize>,
        num_samples: usize,
        index_split: Split,
        config: Arc<Self::Config>,
    ) -> Result<Self>;

    /// Config attributes that, together with the corpus path, the split and
    /// the number of samples, identify the dataset for caching purposes.
    fn key_config_attributes() -> Vec<&'static str> {
        vec!["random_seed", "sequence_length", "split", "split_matrix"]
    }

    /// Number of elements the split bookends are applied to.
    fn num_elements(indexed_dataset: &MmapIndexedDataset) -> usize {
        indexed_dataset.len()
    }
}
