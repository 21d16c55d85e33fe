//! GPT datasets over Megatron indexed corpora, with the split bookkeeping
//! Retro pretraining needs to stay consistent with its preprocessed
//! retrieval database.

pub mod blended;
pub mod builder;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod gpt_dataset;
pub mod indexed;
pub mod multi_split;
pub mod preprocessing;
pub mod sample;
pub mod split;
pub mod utils;

pub use blended::BlendedDataset;
pub use builder::{BlendedMegatronDatasetBuilder, SplitDataset};
pub use config::{Blend, DatasetConfig, GptDatasetConfig, GptDatasetConfigBuilder};
pub use dataset::{Dataset, MegatronDataset};
pub use gpt_dataset::GptDataset;
pub use indexed::{DType, IndexedDatasetBuilder, MmapIndexedDataset};
pub use multi_split::{
    multi_split_train_valid_test_datasets_provider, MultiSplitGptDataset,
    MultiSplitGptDatasetConfig,
};
pub use preprocessing::{multi_split_config_from_retro_preprocessing, RetroPreprocessingConfig};
pub use sample::Sample;
pub use split::{Split, SplitMatrix};
