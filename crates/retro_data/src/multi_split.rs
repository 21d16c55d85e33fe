//! src/multi_split.rs
//!
//! Retro's GPT dataset: train/valid/test splits that stay consistent with the
//! split the Retro corpus was preprocessed with.
//!
//! Retro retrieves neighbors from a database built over the `split_preprocessing`
//! train portion of the corpus. When pretraining uses a different `split`, the
//! split matrix keeps every pretraining split inside the matching preprocessing
//! split, so samples never overlap the retrieval database of another split.

use crate::builder::{BlendedMegatronDatasetBuilder, SplitDataset};
use crate::config::{DatasetConfig, GptDatasetConfig, GptDatasetConfigBuilder};
use crate::dataset::{Dataset, MegatronDataset};
use crate::gpt_dataset::GptDataset;
use crate::indexed::MmapIndexedDataset;
use crate::sample::{Sample, DOCUMENT_IDS};
use crate::split::{
    convert_split_vector_to_split_matrix, format_split_matrix, parse_and_normalize_split,
    split_vectors_close, Split,
};
use crate::utils::log_single_rank;
use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tch::Tensor;
use tracing::Level;

/// GPT dataset configuration with the Retro preprocessing split.
#[derive(Debug, Clone)]
pub struct MultiSplitGptDatasetConfig {
    base: GptDatasetConfig,
    /// Whether samples also carry the ids of their source documents.
    /// Preprocessing turns this on to map chunks back to documents.
    pub return_document_ids: bool,
    /// Split string used when the Retro corpus was preprocessed.
    pub split_preprocessing: String,
}

impl MultiSplitGptDatasetConfig {
    /// Starts from a base builder; `return_document_ids` and
    /// `split_preprocessing` must be set before `build`.
    pub fn builder(base: GptDatasetConfigBuilder) -> MultiSplitGptDatasetConfigBuilder {
        MultiSplitGptDatasetConfigBuilder {
            base,
            return_document_ids: None,
            split_preprocessing: None,
        }
    }

    pub fn base(&self) -> &GptDatasetConfig {
        &self.base
    }
}

impl DatasetConfig for MultiSplitGptDatasetConfig {
    fn gpt(&self) -> &GptDatasetConfig {
        &self.base
    }

    fn key_attribute(&self, name: &str) -> Option<Value> {
        match name {
            "split_preprocessing" => Some(json!(self.split_preprocessing)),
            "return_document_ids" => Some(json!(self.return_document_ids)),
            _ => self.base.key_attribute(name),
        }
    }
}

pub struct MultiSplitGptDatasetConfigBuilder {
    base: GptDatasetConfigBuilder,
    return_document_ids: Option<bool>,
    split_preprocessing: Option<String>,
}

impl MultiSplitGptDatasetConfigBuilder {
    pub fn return_document_ids(mut self, return_document_ids: bool) -> Self {
        self.return_document_ids = Some(return_document_ids);
        self
    }

    pub fn split_preprocessing(mut self, split: impl Into<String>) -> Self {
        self.split_preprocessing = Some(split.into());
        self
    }

    /// Validates the base config, then reconciles `split` with
    /// `split_preprocessing`.
    pub fn build(self) -> Result<MultiSplitGptDatasetConfig> {
        let mut base = self.base.build()?;

        let split = base
            .split
            .clone()
            .ok_or_else(|| anyhow!("the Retro data pipeline does not support 'blend_per_split'"))?;
        let return_document_ids = self
            .return_document_ids
            .ok_or_else(|| anyhow!("return_document_ids must be user defined"))?;
        let split_preprocessing = self
            .split_preprocessing
            .ok_or_else(|| anyhow!("split_preprocessing must be user defined"))?;

        let split_vector = parse_and_normalize_split(&split)?;
        let split_preprocessing_vector = parse_and_normalize_split(&split_preprocessing)?;
        if !split_vectors_close(&split_vector, &split_preprocessing_vector) {
            let split_matrix = convert_split_vector_to_split_matrix(
                &split_vector,
                Some(&split_preprocessing_vector),
            );
            log_single_rank(
                Level::WARN,
                &format!(
                    "split =/= split_preprocessing. Let split_matrix = {}",
                    format_split_matrix(&split_matrix)
                ),
            );
            base.split_matrix = Some(split_matrix);
        }

        Ok(MultiSplitGptDatasetConfig {
            base,
            return_document_ids,
            split_preprocessing,
        })
    }
}

/// Retro's customized GPT dataset.
pub struct MultiSplitGptDataset {
    inner: GptDataset<MultiSplitGptDatasetConfig>,
}

impl MultiSplitGptDataset {
    pub fn gpt_dataset(&self) -> &GptDataset<MultiSplitGptDatasetConfig> {
        &self.inner
    }

    pub fn config(&self) -> &MultiSplitGptDatasetConfig {
        self.inner.config()
    }
}

impl Dataset for MultiSplitGptDataset {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let (text, document_ids) = self.inner.query_document_sample_shuffle_indices(index)?;
        let sample = Sample::from_tokens(&text);
        if self.config().return_document_ids {
            Ok(sample.with_feature(DOCUMENT_IDS, Tensor::from_slice(&document_ids)))
        } else {
            Ok(sample)
        }
    }
}

impl MegatronDataset for MultiSplitGptDataset {
    type Config = MultiSplitGptDatasetConfig;

    const NAME: &'static str = "MultiSplitGPTDataset";

    fn build(
        indexed_dataset: Arc<MmapIndexedDataset>,
        indexed_indices: Vec<usize>,
        num_samples: usize,
        index_split: Split,
        config: Arc<MultiSplitGptDatasetConfig>,
    ) -> Result<Self> {
        let inner = GptDataset::new(
            indexed_dataset,
            indexed_indices,
            num_samples,
            index_split,
            config,
            Self::NAME,
            &Self::key_config_attributes(),
        )?;
        Ok(Self { inner })
    }

    /// The preprocessing split constrains which documents each split may use.
    fn key_config_attributes() -> Vec<&'static str> {
        let mut attributes = GptDataset::<GptDatasetConfig>::key_config_attributes();
        attributes.push("split_preprocessing");
        attributes
    }
}

/// Builds the train, valid and test datasets for Retro.
pub fn multi_split_train_valid_test_datasets_provider(
    config: Arc<MultiSplitGptDatasetConfig>,
    train_valid_test_num_samples: [usize; 3],
) -> Result<[Option<SplitDataset<MultiSplitGptDataset>>; 3]> {
    log_single_rank(
        Level::INFO,
        "> building multi-split train, validation, and test datasets for GPT ...",
    );
    let datasets =
        BlendedMegatronDatasetBuilder::<MultiSplitGptDataset>::new(train_valid_test_num_samples, config)
            .build()?;
    log_single_rank(Level::INFO, "> finished creating multi-split GPT datasets ...");
    Ok(datasets)
}
