use anyhow::{anyhow, Result};
use std::collections::HashMap;
use tch::Tensor;

/// Feature holding `sequence_length + 1` token ids.
pub const TEXT: &str = "text";
/// Feature holding the ids of the documents a sample was cut from.
pub const DOCUMENT_IDS: &str = "document_ids";
/// Feature holding the index of the source dataset inside a blend.
pub const DATASET_ID: &str = "dataset_id";

/// A single record returned by a dataset query.
///
/// Maps feature names to tensors. GPT samples always carry [`TEXT`]; datasets
/// configured to return document ids add [`DOCUMENT_IDS`], and blended
/// datasets add [`DATASET_ID`].
///
/// # Example
/// `{"text": Tensor([50256, 464, ..., 13]), "document_ids": Tensor([17, 18])}`
#[derive(Debug)]
pub struct Sample {
    pub features: HashMap<String, Tensor>,
}

/// Creates a shallow clone of the `Sample`
impl Clone for Sample {
    fn clone(&self) -> Self {
        let features = self
            .features
            .iter()
            .map(|(k, v)| (k.clone(), v.shallow_clone()))
            .collect();
        Self { features }
    }
}

// Safety: `tch::Tensor` is `Send`, and shared references never mutate the
// underlying storage, so a `Sample` can be handed to and read from other
// threads (e.g. data-loading workers).
unsafe impl Send for Sample {}
unsafe impl Sync for Sample {}

impl Sample {
    pub fn new(features: HashMap<String, Tensor>) -> Self {
        Self { features }
    }

    /// Creates a `Sample` from a single `(feature_name, tensor)` pair.
    ///
    /// Chain with [`with_feature`](Self::with_feature) to add more features.
    pub fn from_single(name: impl Into<String>, tensor: Tensor) -> Self {
        Self {
            features: HashMap::from([(name.into(), tensor)]),
        }
    }

    /// Creates a GPT sample from its token ids.
    pub fn from_tokens(tokens: &[i64]) -> Self {
        Self::from_single(TEXT, Tensor::from_slice(tokens))
    }

    /// Adds or overwrites a feature.
    pub fn with_feature(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.features.insert(name.into(), tensor);
        self
    }

    pub fn get(&self, feature: &str) -> Result<&Tensor> {
        self.features
            .get(feature)
            .ok_or_else(|| anyhow!("Feature {} not found", feature))
    }

    pub fn contains(&self, feature: &str) -> bool {
        self.features.contains_key(feature)
    }

    /// Reads a one-dimensional integer feature back into a vector.
    pub fn to_vec_i64(&self, feature: &str) -> Result<Vec<i64>> {
        let values: Vec<i64> = self.get(feature)?.try_into()?;
        Ok(values)
    }

    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.features.keys().map(String::as_str)
    }
}
