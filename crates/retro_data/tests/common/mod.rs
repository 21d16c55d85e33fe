#![allow(dead_code)]

use anyhow::Result;
use retro_data::{
    Blend, DType, GptDatasetConfig, GptDatasetConfigBuilder, IndexedDatasetBuilder,
    MultiSplitGptDatasetConfig,
};
use std::path::{Path, PathBuf};

/// Token encoding used by the synthetic corpora: `doc * 1000 + position`.
pub fn token(doc: usize, position: usize) -> i64 {
    (doc * 1000 + position) as i64
}

pub fn document_of(token: i64) -> i64 {
    token / 1000
}

/// Writes an MMIDIDX corpus with one document per entry of `lengths`.
pub fn write_corpus(dir: &Path, name: &str, lengths: &[usize]) -> Result<PathBuf> {
    let prefix = dir.join(name);
    let mut builder = IndexedDatasetBuilder::new(&prefix, DType::U16)?;
    for (doc, &length) in lengths.iter().enumerate() {
        let tokens: Vec<i64> = (0..length).map(|p| token(doc, p)).collect();
        builder.add_document(&tokens)?;
    }
    builder.finalize()?;
    Ok(prefix)
}

/// Document lengths 10, 11, ..., cycling so that no two neighbors are equal.
pub fn varied_lengths(num_documents: usize) -> Vec<usize> {
    (0..num_documents).map(|doc| 10 + (doc * 7) % 13).collect()
}

pub fn base_config(blend: Blend, split: &str, sequence_length: usize) -> GptDatasetConfigBuilder {
    GptDatasetConfig::builder()
        .random_seed(1234)
        .sequence_length(sequence_length)
        .blend(blend)
        .split(split)
}

pub fn retro_config(
    prefix: &Path,
    split: &str,
    split_preprocessing: &str,
    cache: Option<&Path>,
) -> Result<MultiSplitGptDatasetConfig> {
    let mut base = base_config(Blend::single(prefix), split, 16);
    if let Some(cache) = cache {
        base = base.path_to_cache(cache);
    }
    MultiSplitGptDatasetConfig::builder(base)
        .return_document_ids(true)
        .split_preprocessing(split_preprocessing)
        .build()
}
