//! src/preprocessing.rs
//!
//! Settings recorded when a Retro project was preprocessed, and the dataset
//! config derived from them.

use crate::config::{Blend, GptDatasetConfig};
use crate::multi_split::MultiSplitGptDatasetConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Subset of a Retro project's preprocessing settings needed to rebuild
/// its GPT datasets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetroPreprocessingConfig {
    /// Root of the Retro project; GPT corpora live under `{project}/data`.
    pub retro_project_dir: PathBuf,
    /// Blend of GPT corpora, relative to the project's data directory.
    pub retro_gpt_data_path: Vec<String>,
    pub retro_gpt_seed: u64,
    pub retro_gpt_seq_length: usize,
    /// Split the retrieval database was built with.
    pub retro_gpt_split: String,
    #[serde(default)]
    pub retro_gpt_data_cache_path: Option<PathBuf>,
}

impl RetroPreprocessingConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse Retro config {}", path.display()))
    }

    pub fn gpt_data_dir(&self) -> PathBuf {
        self.retro_project_dir.join("data")
    }

    /// The preprocessing blend with every prefix resolved against
    /// [`gpt_data_dir`](Self::gpt_data_dir).
    pub fn gpt_blend(&self) -> Result<Blend> {
        let mut blend = Blend::parse(&self.retro_gpt_data_path)?;
        let data_dir = self.gpt_data_dir();
        for prefix in &mut blend.prefixes {
            *prefix = data_dir.join(&*prefix);
        }
        Ok(blend)
    }
}

/// Builds the multi-split config used to query a preprocessed Retro corpus.
///
/// `split_preprocessing` comes from `config`; `split` is the pretraining
/// split. A `custom_data_path` blend replaces the project's corpora and is
/// used as given.
pub fn multi_split_config_from_retro_preprocessing(
    config: &RetroPreprocessingConfig,
    split: &str,
    return_document_ids: bool,
    is_built_on_rank: impl Fn() -> bool + Send + Sync + 'static,
    custom_data_path: Option<&[String]>,
) -> Result<MultiSplitGptDatasetConfig> {
    let blend = match custom_data_path {
        Some(blend) => Blend::parse(blend)?,
        None => config.gpt_blend()?,
    };

    let mut base = GptDatasetConfig::builder()
        .random_seed(config.retro_gpt_seed)
        .sequence_length(config.retro_gpt_seq_length)
        .blend(blend)
        .split(split)
        .is_built_on_rank(is_built_on_rank);
    if let Some(cache) = &config.retro_gpt_data_cache_path {
        base = base.path_to_cache(cache);
    }

    MultiSplitGptDatasetConfig::builder(base)
        .return_document_ids(return_document_ids)
        .split_preprocessing(&config.retro_gpt_split)
        .build()
}
