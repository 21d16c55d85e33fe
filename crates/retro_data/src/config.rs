//! src/config.rs
//!
//! Configuration shared by every dataset built from Megatron indexed corpora.
//!
//! Example:
//! ```ignore
//! let config = GptDatasetConfig::builder()
//!     .random_seed(1234)
//!     .sequence_length(2048)
//!     .blend(Blend::parse(&["0.3", "wiki_text_document", "0.7", "books_text_document"])?)
//!     .split("969,30,1")
//!     .path_to_cache("/data/index-cache")
//!     .build()?;
//! ```
//!
//! Data comes either from one `blend` partitioned by `split`, or from
//! `blend_per_split`, one independent blend per train/valid/test split.

use crate::split::{convert_split_vector_to_split_matrix, parse_and_normalize_split, Split, SplitMatrix};
use crate::utils::normalize;
use anyhow::{anyhow, bail, ensure, Result};
use serde_json::{json, Value};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Decides whether datasets are materialized on the calling rank.
pub type BuiltOnRank = Arc<dyn Fn() -> bool + Send + Sync>;

/// Dataset path prefixes, optionally weighted.
#[derive(Debug, Clone, PartialEq)]
pub struct Blend {
    pub prefixes: Vec<PathBuf>,
    pub weights: Option<Vec<f64>>,
}

impl Blend {
    pub fn single(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefixes: vec![prefix.into()],
            weights: None,
        }
    }

    pub fn weighted(pairs: Vec<(f64, PathBuf)>) -> Result<Self> {
        ensure!(!pairs.is_empty(), "A blend needs at least one dataset");
        let (weights, prefixes): (Vec<f64>, Vec<PathBuf>) = pairs.into_iter().unzip();
        normalize(&weights)?;
        Ok(Self {
            prefixes,
            weights: Some(weights),
        })
    }

    /// Parses the command-line blend convention.
    ///
    /// - `["prefix"]` or `["p1", "p2", ...]`: unweighted
    /// - `["w1", "p1", "w2", "p2", ...]`: weight/prefix pairs
    ///
    /// An even-length list whose weight slots are not all numbers is read as
    /// a list of prefixes. Mixing numeric and non-numeric weight slots is an error.
    pub fn parse<S: AsRef<str>>(items: &[S]) -> Result<Self> {
        ensure!(!items.is_empty(), "A blend needs at least one dataset");
        let items: Vec<&str> = items.iter().map(|s| s.as_ref().trim()).collect();

        if items.len() % 2 == 1 {
            return Ok(Self::unweighted(&items));
        }

        let weights: Vec<Option<f64>> = items
            .iter()
            .step_by(2)
            .map(|w| w.parse::<f64>().ok())
            .collect();

        if weights.iter().all(Option::is_none) {
            return Ok(Self::unweighted(&items));
        }
        if weights.iter().any(Option::is_none) {
            bail!("Blend {:?} mixes weighted and unweighted entries", items);
        }

        let pairs = weights
            .into_iter()
            .flatten()
            .zip(items.iter().skip(1).step_by(2).map(PathBuf::from))
            .collect();
        Self::weighted(pairs)
    }

    fn unweighted(items: &[&str]) -> Self {
        Self {
            prefixes: items.iter().map(PathBuf::from).collect(),
            weights: None,
        }
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    /// Weights summing to one; unweighted blends are uniform.
    pub fn normalized_weights(&self) -> Result<Vec<f64>> {
        match &self.weights {
            Some(weights) => normalize(weights),
            None => Ok(vec![1.0 / self.len() as f64; self.len()]),
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "prefixes": self.prefixes,
            "weights": self.weights,
        })
    }
}

/// Access to the GPT-level settings of any dataset configuration, plus the
/// attribute lookup used to derive cache keys.
pub trait DatasetConfig: Send + Sync + 'static {
    fn gpt(&self) -> &GptDatasetConfig;

    /// JSON value of the named attribute, `None` when the name is unknown.
    fn key_attribute(&self, name: &str) -> Option<Value>;
}

/// Configuration of a GPT dataset over Megatron indexed corpora.
#[derive(Clone)]
pub struct GptDatasetConfig {
    pub random_seed: u64,
    /// Tokens per sample, excluding the extra label token.
    pub sequence_length: usize,
    pub blend: Option<Blend>,
    pub blend_per_split: Option<[Option<Blend>; 3]>,
    pub split: Option<String>,
    /// Derived from `split` unless `blend_per_split` is used.
    pub split_matrix: Option<SplitMatrix>,
    /// Directory for cached sample indices.
    pub path_to_cache: Option<PathBuf>,
    pub is_built_on_rank: BuiltOnRank,
}

impl fmt::Debug for GptDatasetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GptDatasetConfig")
            .field("random_seed", &self.random_seed)
            .field("sequence_length", &self.sequence_length)
            .field("blend", &self.blend)
            .field("blend_per_split", &self.blend_per_split)
            .field("split", &self.split)
            .field("split_matrix", &self.split_matrix)
            .field("path_to_cache", &self.path_to_cache)
            .finish_non_exhaustive()
    }
}

impl GptDatasetConfig {
    pub fn builder() -> GptDatasetConfigBuilder {
        GptDatasetConfigBuilder::default()
    }

    pub fn is_built_on_rank(&self) -> bool {
        (self.is_built_on_rank)()
    }

    /// Blend used for `split` when `blend_per_split` is set.
    pub fn blend_for_split(&self, split: Split) -> Option<&Blend> {
        self.blend_per_split
            .as_ref()
            .and_then(|blends| blends[split.index()].as_ref())
    }
}

impl DatasetConfig for GptDatasetConfig {
    fn gpt(&self) -> &GptDatasetConfig {
        self
    }

    fn key_attribute(&self, name: &str) -> Option<Value> {
        let value = match name {
            "random_seed" => json!(self.random_seed),
            "sequence_length" => json!(self.sequence_length),
            "split" => json!(self.split),
            "split_matrix" => json!(self.split_matrix),
            "blend" => self.blend.as_ref().map_or(Value::Null, Blend::to_json),
            "blend_per_split" => match &self.blend_per_split {
                Some(blends) => Value::Array(
                    blends
                        .iter()
                        .map(|blend| blend.as_ref().map_or(Value::Null, Blend::to_json))
                        .collect(),
                ),
                None => Value::Null,
            },
            "path_to_cache" => json!(self.path_to_cache),
            _ => return None,
        };
        Some(value)
    }
}

/// Builder for [`GptDatasetConfig`]; `build` validates the combination.
#[derive(Clone, Default)]
pub struct GptDatasetConfigBuilder {
    random_seed: Option<u64>,
    sequence_length: Option<usize>,
    blend: Option<Blend>,
    blend_per_split: Option<[Option<Blend>; 3]>,
    split: Option<String>,
    path_to_cache: Option<PathBuf>,
    is_built_on_rank: Option<BuiltOnRank>,
}

impl GptDatasetConfigBuilder {
    pub fn random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    pub fn sequence_length(mut self, length: usize) -> Self {
        self.sequence_length = Some(length);
        self
    }

    pub fn blend(mut self, blend: Blend) -> Self {
        self.blend = Some(blend);
        self
    }

    pub fn blend_per_split(mut self, blends: [Option<Blend>; 3]) -> Self {
        self.blend_per_split = Some(blends);
        self
    }

    /// Train/valid/test split string, e.g. `"969,30,1"`.
    pub fn split(mut self, split: impl Into<String>) -> Self {
        self.split = Some(split.into());
        self
    }

    pub fn path_to_cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.path_to_cache = Some(path.into());
        self
    }

    /// Restrict dataset construction to the ranks for which `predicate` is true.
    pub fn is_built_on_rank(mut self, predicate: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.is_built_on_rank = Some(Arc::new(predicate));
        self
    }

    pub fn build(self) -> Result<GptDatasetConfig> {
        let random_seed = self
            .random_seed
            .ok_or_else(|| anyhow!("random_seed must be user defined"))?;
        let sequence_length = self
            .sequence_length
            .ok_or_else(|| anyhow!("sequence_length must be user defined"))?;
        ensure!(sequence_length > 0, "sequence_length must be positive");

        let split_matrix = match &self.blend_per_split {
            Some(blends) => {
                ensure!(
                    self.blend.is_none(),
                    "blend and blend_per_split are incompatible"
                );
                ensure!(
                    self.split.is_none(),
                    "split is incompatible with blend_per_split"
                );
                ensure!(
                    blends.iter().any(Option::is_some),
                    "blend_per_split must name data for at least one split"
                );
                for blend in blends.iter().flatten() {
                    ensure!(!blend.is_empty(), "blend_per_split entries must not be empty");
                }
                None
            }
            None => {
                let blend = self
                    .blend
                    .as_ref()
                    .ok_or_else(|| anyhow!("one of either blend or blend_per_split must be provided"))?;
                ensure!(!blend.is_empty(), "blend must not be empty");
                let split = self
                    .split
                    .as_deref()
                    .ok_or_else(|| anyhow!("both blend and split must be provided"))?;
                let split_vector = parse_and_normalize_split(split)?;
                Some(convert_split_vector_to_split_matrix(&split_vector, None))
            }
        };

        Ok(GptDatasetConfig {
            random_seed,
            sequence_length,
            blend: self.blend,
            blend_per_split: self.blend_per_split,
            split: self.split,
            split_matrix,
            path_to_cache: self.path_to_cache,
            is_built_on_rank: self.is_built_on_rank.unwrap_or_else(|| Arc::new(|| true)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_builder() -> GptDatasetConfigBuilder {
        GptDatasetConfig::builder()
            .random_seed(1234)
            .sequence_length(16)
            .blend(Blend::single("corpus_text_document"))
    }

    #[test]
    fn test_blend_parse() -> Result<()> {
        let single = Blend::parse(&["corpus"])?;
        assert_eq!(single, Blend::single("corpus"));

        let weighted = Blend::parse(&["0.3", "wiki", "0.7", "books"])?;
        assert_eq!(weighted.prefixes, vec![PathBuf::from("wiki"), PathBuf::from("books")]);
        assert_eq!(weighted.weights, Some(vec![0.3, 0.7]));

        let unweighted = Blend::parse(&["wiki", "books"])?;
        assert!(unweighted.weights.is_none());
        assert_eq!(unweighted.normalized_weights()?, vec![0.5, 0.5]);

        assert!(Blend::parse(&["0.3", "wiki", "books", "news"]).is_err());
        assert!(Blend::parse(&["0", "wiki", "0", "books"]).is_err());
        assert!(Blend::parse::<&str>(&[]).is_err());
        Ok(())
    }

    #[test]
    fn test_split_matrix_is_derived() -> Result<()> {
        let config = base_builder().split("90,10,0").build()?;
        let matrix = config.split_matrix.expect("derived from split");
        assert_eq!(matrix[0], Some((0.0, 0.9)));
        assert!(matrix[2].is_none());
        assert!(config.is_built_on_rank());
        Ok(())
    }

    #[test]
    fn test_missing_fields_fail() {
        assert!(base_builder().build().is_err()); // no split
        assert!(GptDatasetConfig::builder()
            .random_seed(1)
            .sequence_length(8)
            .split("1,0,0")
            .build()
            .is_err()); // no blend
        assert!(GptDatasetConfig::builder()
            .sequence_length(8)
            .blend(Blend::single("x"))
            .split("1,0,0")
            .build()
            .is_err()); // no seed
        assert!(base_builder().sequence_length(0).split("1").build().is_err());
    }

    #[test]
    fn test_blend_per_split() -> Result<()> {
        let config = GptDatasetConfig::builder()
            .random_seed(1)
            .sequence_length(8)
            .blend_per_split([Some(Blend::single("train")), None, Some(Blend::single("test"))])
            .build()?;
        assert!(config.split_matrix.is_none());
        assert_eq!(config.blend_for_split(Split::Test), Some(&Blend::single("test")));
        assert!(config.blend_for_split(Split::Valid).is_none());

        let conflicting = GptDatasetConfig::builder()
            .random_seed(1)
            .sequence_length(8)
            .blend_per_split([Some(Blend::single("train")), None, None])
            .split("1,0,0")
            .build();
        assert!(conflicting.is_err());
        Ok(())
    }

    #[test]
    fn test_key_attributes() -> Result<()> {
        let config = base_builder()
            .split("1,0,0")
            .is_built_on_rank(|| false)
            .build()?;
        assert_eq!(config.key_attribute("random_seed"), Some(json!(1234)));
        assert_eq!(config.key_attribute("split"), Some(json!("1,0,0")));
        assert_eq!(
            config.key_attribute("split_matrix"),
            Some(json!([[0.0, 1.0], null, null]))
        );
        assert!(config.key_attribute("no_such_attribute").is_none());
        assert!(!config.is_built_on_rank());
        Ok(())
    }
}
