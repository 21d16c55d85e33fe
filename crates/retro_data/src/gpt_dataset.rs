//! src/gpt_dataset.rs
//!
//! GPT pretraining samples cut from a Megatron indexed corpus.
//!
//! Samples are fixed windows of `sequence_length + 1` tokens taken across
//! document boundaries. Three indices make the lookup O(1):
//!
//! ```text
//! document_index  [doc ids]            exposed documents, repeated per epoch, shuffled
//! sample_index    [(position, offset)] where each sample starts in document_index
//! shuffle_index   [sample positions]   random permutation of the samples
//! ```
//!
//! Consecutive samples share one token: the last token of sample `i` is the
//! first token of sample `i + 1`.
//!
//! # Caching
//! Building the indices is linear in the corpus size. When `path_to_cache` is
//! set they are written to `{hash}-{class}-indices.safetensors`, where `hash`
//! is the SHA-256 of the dataset's unique description (class, corpus path,
//! split, number of samples and the key config attributes). Later runs with
//! the same description load the file instead of rebuilding.

use crate::config::{DatasetConfig, GptDatasetConfig};
use crate::dataset::{Dataset, MegatronDataset};
use crate::indexed::MmapIndexedDataset;
use crate::sample::Sample;
use crate::split::Split;
use crate::utils::log_single_rank;
use anyhow::{anyhow, bail, ensure, Context, Result};
use bytemuck::{cast_slice, pod_collect_to_vec};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};
use safetensors::{serialize_to_file, tensor::TensorView, Dtype, SafeTensors};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, Level};

/// Minimum share of a full epoch the final epoch must contribute to be
/// shuffled together with the earlier epochs.
const SEPARATE_FINAL_EPOCH_THRESHOLD: f64 = 0.80;

const DOCUMENT_INDEX: &str = "document_index";
const SAMPLE_INDEX: &str = "sample_index";
const SHUFFLE_INDEX: &str = "shuffle_index";

/// Document, sample and shuffle indices of one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleIndices {
    pub document_index: Vec<usize>,
    pub sample_index: Vec<(usize, usize)>,
    pub shuffle_index: Vec<usize>,
}

impl SampleIndices {
    /// Checks that every index points inside the one it refers to, so that
    /// queries cannot go out of bounds.
    ///
    /// `num_documents` is the size of the indexed corpus.
    pub fn validate(&self, num_documents: usize) -> Result<()> {
        ensure!(!self.sample_index.is_empty(), "The sample index is empty");
        let num_samples = self.sample_index.len() - 1;

        if let Some(&document) = self.document_index.iter().find(|&&d| d >= num_documents) {
            bail!(
                "Document index refers to document {} of a corpus with {} documents",
                document,
                num_documents
            );
        }
        if let Some(&(position, _)) = self
            .sample_index
            .iter()
            .find(|&&(position, _)| position >= self.document_index.len())
        {
            bail!(
                "Sample index refers to position {} of a document index of length {}",
                position,
                self.document_index.len()
            );
        }

        ensure!(
            self.shuffle_index.len() == num_samples,
            "Shuffle index has {} entries for {} samples",
            self.shuffle_index.len(),
            num_samples
        );
        let mut seen = vec![false; num_samples];
        for &sample in &self.shuffle_index {
            ensure!(
                sample < num_samples && !seen[sample],
                "Shuffle index is not a permutation of 0..{} (entry {})",
                num_samples,
                sample
            );
            seen[sample] = true;
        }
        Ok(())
    }
}

pub struct GptDataset<C: DatasetConfig = GptDatasetConfig> {
    indexed_dataset: Arc<MmapIndexedDataset>,
    indexed_indices: Vec<usize>,
    num_samples: usize,
    index_split: Split,
    config: Arc<C>,
    unique_description: String,
    unique_description_hash: String,
    indices: SampleIndices,
}

impl<C: DatasetConfig> GptDataset<C> {
    /// Builds (or loads from cache) the indices for `indexed_indices`.
    ///
    /// `class_name` and `key_config_attributes` identify the dataset type
    /// wrapping this one, so that wrappers with extra key attributes get
    /// their own cache entries.
    pub fn new(
        indexed_dataset: Arc<MmapIndexedDataset>,
        indexed_indices: Vec<usize>,
        num_samples: usize,
        index_split: Split,
        config: Arc<C>,
        class_name: &str,
        key_config_attributes: &[&str],
    ) -> Result<Self> {
        if let Some(&out_of_range) = indexed_indices.iter().find(|&&i| i >= indexed_dataset.len()) {
            return Err(anyhow!(
                "Document {} out of bounds for {} with {} documents",
                out_of_range,
                indexed_dataset.path_prefix().display(),
                indexed_dataset.len()
            ));
        }

        let unique_description = unique_description(
            class_name,
            indexed_dataset.path_prefix(),
            num_samples,
            index_split,
            config.as_ref(),
            key_config_attributes,
        )?;
        let unique_description_hash = format!("{:x}", Sha256::digest(unique_description.as_bytes()));

        let indices = match &config.gpt().path_to_cache {
            Some(cache_dir) => {
                let paths = CachePaths::new(cache_dir, &unique_description_hash, class_name);
                if paths.indices.is_file() {
                    log_single_rank(
                        Level::INFO,
                        &format!(
                            "Load the {} {} indices from {}",
                            class_name,
                            index_split,
                            paths.indices.display()
                        ),
                    );
                    let indices = load_indices(&paths.indices)?;
                    indices.validate(indexed_dataset.len()).with_context(|| {
                        format!("Invalid cached indices in {}", paths.indices.display())
                    })?;
                    indices
                } else {
                    let indices = build_indices(
                        &indexed_dataset,
                        &indexed_indices,
                        num_samples,
                        config.gpt(),
                    )?;
                    paths.save(&unique_description, &indices)?;
                    indices
                }
            }
            None => build_indices(&indexed_dataset, &indexed_indices, num_samples, config.gpt())?,
        };

        log_single_rank(
            Level::INFO,
            &format!(
                "> {} {} split: {} documents, {} samples",
                class_name,
                index_split,
                indexed_indices.len(),
                indices.sample_index.len().saturating_sub(1)
            ),
        );

        Ok(Self {
            indexed_dataset,
            indexed_indices,
            num_samples,
            index_split,
            config,
            unique_description,
            unique_description_hash,
            indices,
        })
    }

    pub fn config(&self) -> &C {
        &self.config
    }

    pub fn indexed_dataset(&self) -> &MmapIndexedDataset {
        &self.indexed_dataset
    }

    /// Documents of the corpus exposed to this split.
    pub fn indexed_indices(&self) -> &[usize] {
        &self.indexed_indices
    }

    /// Number of samples requested at construction; `len()` may be larger.
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn index_split(&self) -> Split {
        self.index_split
    }

    pub fn unique_description(&self) -> &str {
        &self.unique_description
    }

    pub fn unique_description_hash(&self) -> &str {
        &self.unique_description_hash
    }

    pub fn indices(&self) -> &SampleIndices {
        &self.indices
    }

    /// Tokens of sample `idx` (after shuffling) and the ids of the
    /// documents they were read from, in reading order.
    pub fn query_document_sample_shuffle_indices(&self, idx: usize) -> Result<(Vec<i64>, Vec<i64>)> {
        ensure!(
            idx < self.len(),
            "Sample index {} out of bounds for dataset of size {}",
            idx,
            self.len()
        );
        let idx = self.indices.shuffle_index[idx];
        let (doc_index_beg, doc_index_beg_offset) = self.indices.sample_index[idx];
        let (doc_index_end, doc_index_end_offset) = self.indices.sample_index[idx + 1];
        let document_index = &self.indices.document_index;

        let mut document_ids = Vec::with_capacity(doc_index_end - doc_index_beg + 1);
        let mut tokens = Vec::with_capacity(self.config.gpt().sequence_length + 1);

        if doc_index_beg == doc_index_end {
            let document_id = document_index[doc_index_beg];
            document_ids.push(document_id as i64);
            tokens.extend(self.indexed_dataset.get(
                document_id,
                doc_index_beg_offset,
                Some(doc_index_end_offset - doc_index_beg_offset + 1),
            )?);
        } else {
            for position in doc_index_beg..=doc_index_end {
                let document_id = document_index[position];
                document_ids.push(document_id as i64);
                let offset = if position == doc_index_beg {
                    doc_index_beg_offset
                } else {
                    0
                };
                let length = if position == doc_index_end {
                    Some(doc_index_end_offset + 1)
                } else {
                    None
                };
                tokens.extend(self.indexed_dataset.get(document_id, offset, length)?);
            }
        }

        Ok((tokens, document_ids))
    }
}

impl<C: DatasetConfig> Dataset for GptDataset<C> {
    fn len(&self) -> usize {
        self.indices.sample_index.len().saturating_sub(1)
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let (text, _) = self.query_document_sample_shuffle_indices(index)?;
        Ok(Sample::from_tokens(&text))
    }
}

impl MegatronDataset for GptDataset<GptDatasetConfig> {
    type Config = GptDatasetConfig;

    const NAME: &'static str = "GPTDataset";

    fn build(
        indexed_dataset: Arc<MmapIndexedDataset>,
        indexed_indices: Vec<usize>,
        num_samples: usize,
        index_split: Split,
        config: Arc<GptDatasetConfig>,
    ) -> Result<Self> {
        GptDataset::new(
            indexed_dataset,
            indexed_indices,
            num_samples,
            index_split,
            config,
            Self::NAME,
            &Self::key_config_attributes(),
        )
    }
}

/// JSON description identifying a dataset for caching purposes.
pub fn unique_description<C: DatasetConfig + ?Sized>(
    class_name: &str,
    path_prefix: &Path,
    num_samples: usize,
    index_split: Split,
    config: &C,
    key_config_attributes: &[&str],
) -> Result<String> {
    let mut description = Map::new();
    description.insert("class".into(), Value::from(class_name));
    description.insert("dataset_path".into(), Value::from(path_prefix.display().to_string()));
    description.insert("num_samples".into(), Value::from(num_samples));
    description.insert("index_split".into(), Value::from(index_split.to_string()));
    for &attribute in key_config_attributes {
        let value = config
            .key_attribute(attribute)
            .ok_or_else(|| anyhow!("Unknown key config attribute '{}'", attribute))?;
        description.insert(attribute.to_string(), value);
    }
    Ok(serde_json::to_string_pretty(&Value::Object(description))?)
}

/// Builds the document, sample and shuffle indices.
pub fn build_indices(
    indexed_dataset: &MmapIndexedDataset,
    indexed_indices: &[usize],
    num_samples: usize,
    config: &GptDatasetConfig,
) -> Result<SampleIndices> {
    let started = Instant::now();
    let sequence_length = config.sequence_length;
    let sizes = indexed_dataset.sequence_lengths();

    let tokens_per_epoch: usize = indexed_indices.iter().map(|&i| sizes[i] as usize).sum();
    ensure!(
        tokens_per_epoch > 0,
        "The {} documents selected from {} contain no tokens",
        indexed_indices.len(),
        indexed_dataset.path_prefix().display()
    );

    let num_epochs = num_epochs(tokens_per_epoch, sequence_length, num_samples);

    let (separate_final_epoch, num_samples_sans_final_epoch) = if num_epochs == 1 {
        (false, 0)
    } else {
        let num_samples_sans_final_epoch =
            ((num_epochs - 1) * tokens_per_epoch - 1) / sequence_length;
        let num_samples_from_final_epoch = num_samples - num_samples_sans_final_epoch;
        let num_samples_per_epoch = (tokens_per_epoch - 1) / sequence_length;
        let threshold = (SEPARATE_FINAL_EPOCH_THRESHOLD * num_samples_per_epoch as f64) as usize;
        (
            num_samples_from_final_epoch < threshold,
            num_samples_sans_final_epoch,
        )
    };

    let mut rng = StdRng::seed_from_u64(config.random_seed);

    let document_index =
        build_document_index(indexed_indices, num_epochs, &mut rng, separate_final_epoch);
    let sample_index = build_sample_index(
        sizes,
        &document_index,
        sequence_length,
        num_epochs,
        tokens_per_epoch,
    )?;
    let total_samples = sample_index.len() - 1;
    let shuffle_index = if separate_final_epoch {
        build_shuffle_index(num_samples_sans_final_epoch, total_samples, &mut rng)
    } else {
        build_shuffle_index(total_samples, total_samples, &mut rng)
    };

    debug!(
        "built indices: {} epochs, {} samples, separate final epoch: {}, in {:?}",
        num_epochs,
        total_samples,
        separate_final_epoch,
        started.elapsed()
    );

    Ok(SampleIndices {
        document_index,
        sample_index,
        shuffle_index,
    })
}

/// Number of passes over the documents needed to draw `num_samples` samples.
pub fn num_epochs(tokens_per_epoch: usize, sequence_length: usize, num_samples: usize) -> usize {
    let mut num_epochs = 0;
    let mut num_tokens = 0;
    loop {
        num_epochs += 1;
        num_tokens += tokens_per_epoch;
        // -1 because every sample needs one extra label token
        if (num_tokens - 1) / sequence_length >= num_samples {
            return num_epochs;
        }
    }
}

/// Repeats `documents` once per epoch and shuffles the result.
///
/// With `separate_final_epoch` the last epoch is shuffled on its own, so the
/// partial final epoch does not over-sample documents from the other epochs.
pub fn build_document_index(
    documents: &[usize],
    num_epochs: usize,
    rng: &mut StdRng,
    separate_final_epoch: bool,
) -> Vec<usize> {
    if !separate_final_epoch || num_epochs == 1 {
        let mut document_index: Vec<usize> = (0..num_epochs)
            .flat_map(|_| documents.iter().copied())
            .collect();
        document_index.shuffle(rng);
        return document_index;
    }

    let mut document_index = build_document_index(documents, num_epochs - 1, rng, false);
    document_index.extend(build_document_index(documents, 1, rng, false));
    document_index
}

/// Computes where each sample begins: `(position in document_index, token offset)`.
///
/// The returned vector has one more entry than there are samples; sample `i`
/// spans from entry `i` to entry `i + 1` inclusive.
pub fn build_sample_index(
    sizes: &[i32],
    document_index: &[usize],
    sequence_length: usize,
    num_epochs: usize,
    tokens_per_epoch: usize,
) -> Result<Vec<(usize, usize)>> {
    let num_samples = (num_epochs * tokens_per_epoch - 1) / sequence_length;
    let mut sample_index = Vec::with_capacity(num_samples + 1);
    sample_index.push((0, 0));

    let mut position = 0usize;
    let mut offset = 0i64;
    for _ in 0..num_samples {
        let mut remaining = sequence_length as i64 + 1;
        while remaining != 0 {
            let document_id = *document_index
                .get(position)
                .ok_or_else(|| anyhow!("Document index exhausted at position {}", position))?;
            let document_length = sizes[document_id] as i64 - offset;
            remaining -= document_length;
            if remaining <= 0 {
                // The sample ends inside this document; the next one starts
                // on its last token.
                offset += remaining + document_length - 1;
                remaining = 0;
            } else {
                position += 1;
                offset = 0;
            }
        }
        sample_index.push((position, offset as usize));
    }
    Ok(sample_index)
}

/// Permutes `0..total_size`, shuffling `0..num_samples` and the remainder separately.
pub fn build_shuffle_index(num_samples: usize, total_size: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut shuffle_index: Vec<usize> = (0..num_samples).collect();
    shuffle_index.shuffle(rng);
    if num_samples == total_size {
        return shuffle_index;
    }

    let mut last: Vec<usize> = (num_samples..total_size).collect();
    last.shuffle(rng);
    shuffle_index.extend(last);
    shuffle_index
}

struct CachePaths {
    description: PathBuf,
    indices: PathBuf,
    dir: PathBuf,
}

impl CachePaths {
    fn new(cache_dir: &Path, hash: &str, class_name: &str) -> Self {
        Self {
            description: cache_dir.join(format!("{}-{}-description.txt", hash, class_name)),
            indices: cache_dir.join(format!("{}-{}-indices.safetensors", hash, class_name)),
            dir: cache_dir.to_path_buf(),
        }
    }

    fn save(&self, description: &str, indices: &SampleIndices) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create cache directory {}", self.dir.display()))?;
        fs::write(&self.description, description).with_context(|| {
            format!("Failed to write description {}", self.description.display())
        })?;
        save_indices(&self.indices, indices)?;
        log_single_rank(
            Level::INFO,
            &format!("Saved indices to {}", self.indices.display()),
        );
        Ok(())
    }
}

fn save_indices(path: &Path, indices: &SampleIndices) -> Result<()> {
    let document_index: Vec<i64> = indices.document_index.iter().map(|&d| d as i64).collect();
    let sample_index: Vec<i64> = indices
        .sample_index
        .iter()
        .flat_map(|&(position, offset)| [position as i64, offset as i64])
        .collect();
    let shuffle_index: Vec<i64> = indices.shuffle_index.iter().map(|&s| s as i64).collect();

    let views = vec![
        (
            DOCUMENT_INDEX,
            TensorView::new(Dtype::I64, vec![document_index.len()], cast_slice(&document_index))?,
        ),
        (
            SAMPLE_INDEX,
            TensorView::new(
                Dtype::I64,
                vec![indices.sample_index.len(), 2],
                cast_slice(&sample_index),
            )?,
        ),
        (
            SHUFFLE_INDEX,
            TensorView::new(Dtype::I64, vec![shuffle_index.len()], cast_slice(&shuffle_index))?,
        ),
    ];
    serialize_to_file(views, &None, path)
        .with_context(|| format!("Failed to write indices to {}", path.display()))?;
    Ok(())
}

fn load_indices(path: &Path) -> Result<SampleIndices> {
    let bytes = fs::read(path)
        .with_context(|| format!("Failed to read cached indices: {}", path.display()))?;
    let tensors = SafeTensors::deserialize(&bytes)?;

    let to_usize = |values: Vec<i64>| -> Result<Vec<usize>> {
        values
            .into_iter()
            .map(|v| usize::try_from(v).with_context(|| format!("Negative index {} in cache", v)))
            .collect()
    };

    let document_index = to_usize(read_i64(&tensors, DOCUMENT_INDEX)?)?;
    let sample_index = to_usize(read_i64(&tensors, SAMPLE_INDEX)?)?
        .chunks_exact(2)
        .map(|pair| (pair[0], pair[1]))
        .collect();
    let shuffle_index = to_usize(read_i64(&tensors, SHUFFLE_INDEX)?)?;

    Ok(SampleIndices {
        document_index,
        sample_index,
        shuffle_index,
    })
}

fn read_i64(tensors: &SafeTensors<'_>, name: &str) -> Result<Vec<i64>> {
    let view = tensors
        .tensor(name)
        .with_context(|| format!("Cached indices lack '{}'", name))?;
    ensure!(
        view.dtype() == Dtype::I64,
        "Cached '{}' has dtype {:?}, expected I64",
        name,
        view.dtype()
    );
    Ok(pod_collect_to_vec::<u8, i64>(view.data()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Blend;
    use crate::indexed::{DType, IndexedDatasetBuilder};
    use tempfile::{tempdir, TempDir};

    // Token `doc * 100 + position` so every token names its document.
    fn write_corpus(dir: &TempDir, lengths: &[usize]) -> Result<Arc<MmapIndexedDataset>> {
        let prefix = dir.path().join("corpus_text_document");
        let mut builder = IndexedDatasetBuilder::new(&prefix, DType::I32)?;
        for (doc, &length) in lengths.iter().enumerate() {
            let tokens: Vec<i64> = (0..length as i64).map(|p| doc as i64 * 100 + p).collect();
            builder.add_document(&tokens)?;
        }
        builder.finalize()?;
        Ok(Arc::new(MmapIndexedDataset::open(&prefix)?))
    }

    fn config(sequence_length: usize, cache: Option<&Path>) -> Result<Arc<GptDatasetConfig>> {
        let mut builder = GptDatasetConfig::builder()
            .random_seed(1234)
            .sequence_length(sequence_length)
            .blend(Blend::single("corpus_text_document"))
            .split("1,0,0");
        if let Some(cache) = cache {
            builder = builder.path_to_cache(cache);
        }
        Ok(Arc::new(builder.build()?))
    }

    fn build(
        indexed: &Arc<MmapIndexedDataset>,
        documents: Vec<usize>,
        num_samples: usize,
        config: Arc<GptDatasetConfig>,
    ) -> Result<GptDataset> {
        GptDataset::build(indexed.clone(), documents, num_samples, Split::Train, config)
    }

    #[test]
    fn test_num_epochs() {
        assert_eq!(num_epochs(100, 10, 9), 1);
        assert_eq!(num_epochs(100, 10, 10), 2);
        assert_eq!(num_epochs(100, 10, 0), 1);
        assert_eq!(num_epochs(10, 10, 5), 6);
    }

    #[test]
    fn test_sample_index_walks_documents() -> Result<()> {
        let sizes = [3, 3];
        let sample_index = build_sample_index(&sizes, &[0, 1], 2, 1, 6)?;
        assert_eq!(sample_index, vec![(0, 0), (0, 2), (1, 1)]);
        Ok(())
    }

    #[test]
    fn test_shuffle_index_keeps_tail_separate() {
        let mut rng = StdRng::seed_from_u64(0);
        let shuffle_index = build_shuffle_index(6, 10, &mut rng);
        let mut head = shuffle_index[..6].to_vec();
        let mut tail = shuffle_index[6..].to_vec();
        head.sort();
        tail.sort();
        assert_eq!(head, (0..6).collect::<Vec<_>>());
        assert_eq!(tail, (6..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_document_index_repeats_documents() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut document_index = build_document_index(&[4, 5, 6], 3, &mut rng, true);
        assert_eq!(document_index.len(), 9);
        let mut final_epoch = document_index.split_off(6);
        final_epoch.sort();
        assert_eq!(final_epoch, vec![4, 5, 6]);
    }

    #[test]
    fn test_samples_have_sequence_length_plus_one_tokens() -> Result<()> {
        let dir = tempdir()?;
        let indexed = write_corpus(&dir, &[5, 9, 2, 7, 11, 4])?;
        let dataset = build(&indexed, (0..6).collect(), 20, config(4, None)?)?;

        assert!(dataset.len() >= 20);
        for idx in 0..dataset.len() {
            let (tokens, document_ids) = dataset.query_document_sample_shuffle_indices(idx)?;
            assert_eq!(tokens.len(), 5);
            // Tokens come from the listed documents, in order.
            let token_docs: Vec<i64> = tokens.iter().map(|t| t / 100).collect();
            let mut expected = token_docs.clone();
            expected.dedup();
            let mut listed = document_ids.clone();
            listed.dedup();
            assert_eq!(expected, listed);
        }
        assert!(dataset.query_document_sample_shuffle_indices(dataset.len()).is_err());
        Ok(())
    }

    #[test]
    fn test_only_selected_documents_are_used() -> Result<()> {
        let dir = tempdir()?;
        let indexed = write_corpus(&dir, &[6, 6, 6, 6, 6])?;
        let dataset = build(&indexed, vec![1, 3], 4, config(3, None)?)?;

        for sample in dataset.iter() {
            let tokens = sample?.to_vec_i64(crate::sample::TEXT)?;
            assert!(tokens.iter().all(|t| t / 100 == 1 || t / 100 == 3));
        }
        Ok(())
    }

    #[test]
    fn test_deterministic_for_seed() -> Result<()> {
        let dir = tempdir()?;
        let indexed = write_corpus(&dir, &[8, 3, 12, 5])?;
        let a = build(&indexed, (0..4).collect(), 10, config(4, None)?)?;
        let b = build(&indexed, (0..4).collect(), 10, config(4, None)?)?;
        assert_eq!(a.indices(), b.indices());
        assert_eq!(a.unique_description_hash(), b.unique_description_hash());
        Ok(())
    }

    #[test]
    fn test_rejects_empty_selection() -> Result<()> {
        let dir = tempdir()?;
        let indexed = write_corpus(&dir, &[4, 4])?;
        assert!(build(&indexed, vec![], 1, config(2, None)?).is_err());
        assert!(build(&indexed, vec![2], 1, config(2, None)?).is_err());
        Ok(())
    }

    #[test]
    fn test_cache_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let cache = dir.path().join("cache");
        let indexed = write_corpus(&dir, &[7, 3, 9])?;

        let built = build(&indexed, (0..3).collect(), 6, config(3, Some(&cache))?)?;
        let indices_file = cache.join(format!(
            "{}-GPTDataset-indices.safetensors",
            built.unique_description_hash()
        ));
        assert!(indices_file.is_file());
        assert_eq!(load_indices(&indices_file)?, *built.indices());

        let loaded = build(&indexed, (0..3).collect(), 6, config(3, Some(&cache))?)?;
        assert_eq!(loaded.indices(), built.indices());
        Ok(())
    }

    #[test]
    fn test_inconsistent_cached_indices_are_rejected() -> Result<()> {
        let dir = tempdir()?;
        let cache = dir.path().join("cache");
        let indexed = write_corpus(&dir, &[7, 3, 9])?;

        let built = build(&indexed, (0..3).collect(), 6, config(3, Some(&cache))?)?;
        let indices_file = cache.join(format!(
            "{}-GPTDataset-indices.safetensors",
            built.unique_description_hash()
        ));

        let mut shuffled_past_end = built.indices().clone();
        shuffled_past_end.shuffle_index[0] = 999;
        save_indices(&indices_file, &shuffled_past_end)?;
        assert!(build(&indexed, (0..3).collect(), 6, config(3, Some(&cache))?).is_err());

        let mut position_past_end = built.indices().clone();
        let last = position_past_end.sample_index.len() - 1;
        position_past_end.sample_index[last].0 = position_past_end.document_index.len();
        save_indices(&indices_file, &position_past_end)?;
        assert!(build(&indexed, (0..3).collect(), 6, config(3, Some(&cache))?).is_err());

        let mut unknown_document = built.indices().clone();
        unknown_document.document_index[0] = 3;
        save_indices(&indices_file, &unknown_document)?;
        assert!(build(&indexed, (0..3).collect(), 6, config(3, Some(&cache))?).is_err());

        save_indices(&indices_file, built.indices())?;
        let restored = build(&indexed, (0..3).collect(), 6, config(3, Some(&cache))?)?;
        assert_eq!(restored.indices(), built.indices());
        Ok(())
    }

    #[test]
    fn test_duplicate_shuffle_entries_fail_validation() -> Result<()> {
        let indices = SampleIndices {
            document_index: vec![0, 1],
            sample_index: vec![(0, 0), (0, 2), (1, 1)],
            shuffle_index: vec![1, 1],
        };
        assert!(indices.validate(2).is_err());

        let valid = SampleIndices {
            shuffle_index: vec![1, 0],
            ..indices
        };
        valid.validate(2)?;
        assert!(valid.validate(1).is_err());
        Ok(())
    }

    #[test]
    fn test_unique_description_contents() -> Result<()> {
        let dir = tempdir()?;
        let indexed = write_corpus(&dir, &[4, 4])?;
        let dataset = build(&indexed, vec![0, 1], 3, config(2, None)?)?;

        let description: Value = serde_json::from_str(dataset.unique_description())?;
        assert_eq!(description["class"], "GPTDataset");
        assert_eq!(description["index_split"], "train");
        assert_eq!(description["num_samples"], 3);
        assert_eq!(description["sequence_length"], 2);
        Ok(())
    }
}
