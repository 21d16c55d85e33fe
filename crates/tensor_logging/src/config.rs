//! src/config.rs
//!
//! Process-level settings for tensor logging.
//!
//! The settings come from the launcher's environment:
//! - `LOG_PATH`: directory for tensor dumps. Recording is enabled only when it
//!   is set to a non-empty value.
//! - `RANK`: global rank of this process (defaults to `0`).
//! - `WORLD_SIZE`: number of processes in the job (defaults to `1`).
//!
//! `RANK` and `WORLD_SIZE` only decide where the dump is written. Batch ids
//! are computed from the data-parallel group, see [`crate::parallel`].

use anyhow::{Context, Result};
use std::path::PathBuf;

pub const LOG_PATH_VAR: &str = "LOG_PATH";
pub const RANK_VAR: &str = "RANK";
pub const WORLD_SIZE_VAR: &str = "WORLD_SIZE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLoggingConfig {
    /// Where dumps are written; `None` disables recording.
    pub log_dir: Option<PathBuf>,
    pub rank: usize,
    pub world_size: usize,
}

impl Default for TensorLoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            rank: 0,
            world_size: 1,
        }
    }
}

impl TensorLoggingConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_dir = lookup(LOG_PATH_VAR)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        let rank = match lookup(RANK_VAR) {
            Some(value) => value
                .trim()
                .parse()
                .with_context(|| format!("{} must be a non-negative integer, got '{}'", RANK_VAR, value))?,
            None => 0,
        };

        let world_size = match lookup(WORLD_SIZE_VAR) {
            Some(value) => value.trim().parse().with_context(|| {
                format!("{} must be a non-negative integer, got '{}'", WORLD_SIZE_VAR, value)
            })?,
            None => 1,
        };

        Ok(Self {
            log_dir,
            rank,
            world_size,
        })
    }

    /// Enables recording into `log_dir`.
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    pub fn with_process(mut self, rank: usize, world_size: usize) -> Self {
        self.rank = rank;
        self.world_size = world_size;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.log_dir.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_is_set() -> Result<()> {
        let config = TensorLoggingConfig::from_lookup(lookup_from(&[]))?;
        assert_eq!(config, TensorLoggingConfig::default());
        assert!(!config.is_enabled());
        Ok(())
    }

    #[test]
    fn test_empty_log_path_disables_recording() -> Result<()> {
        let config = TensorLoggingConfig::from_lookup(lookup_from(&[(LOG_PATH_VAR, "")]))?;
        assert!(!config.is_enabled());
        Ok(())
    }

    #[test]
    fn test_reads_rank_and_world_size() -> Result<()> {
        let config = TensorLoggingConfig::from_lookup(lookup_from(&[
            (LOG_PATH_VAR, "/tmp/tensors"),
            (RANK_VAR, "3"),
            (WORLD_SIZE_VAR, "8"),
        ]))?;
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/tensors")));
        assert_eq!(config.rank, 3);
        assert_eq!(config.world_size, 8);
        Ok(())
    }

    #[test]
    fn test_rejects_malformed_rank() {
        let result = TensorLoggingConfig::from_lookup(lookup_from(&[(RANK_VAR, "zero")]));
        assert!(result.is_err());
    }
}
