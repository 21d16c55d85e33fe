use crate::config::TensorLoggingConfig;
use crate::parallel::DataParallelGroup;
use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDateTime};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tch::{Device, Tensor};
use tracing::{debug, info, warn};

/// Tensor name that marks the start of a new batch.
///
/// Every other tensor logged during a step is attributed to the batch opened
/// by the most recent sentinel, so the sentinel must be logged first.
pub const BATCH_SENTINEL: &str = "tokens";

/// A labelled snapshot, `label = "batch_{global_batch_id}.{name}"`.
#[derive(Debug)]
pub struct LoggedTensor {
    pub label: String,
    pub tensor: Tensor,
}

/// Capability handed to training code for recording intermediate tensors.
///
/// Implementations are chosen once per process (see [`init_tensor_logger`])
/// and used from a single thread.
pub trait TensorLogger: Send {
    /// Records `tensor` under `name`. `None` is ignored.
    ///
    /// Fails when the snapshot cannot be copied to host memory.
    fn log(&mut self, name: &str, tensor: Option<&Tensor>) -> Result<()>;

    /// Writes everything recorded so far to disk and returns the file path,
    /// or `None` when there was nothing to write.
    fn flush(&mut self) -> Result<Option<PathBuf>>;

    fn is_recording(&self) -> bool;
}

/// Logger used when tensor logging is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTensorLogger;

impl TensorLogger for NullTensorLogger {
    #[inline]
    fn log(&mut self, _name: &str, _tensor: Option<&Tensor>) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    fn is_recording(&self) -> bool {
        false
    }
}

/// Logger that keeps CPU copies of every logged tensor until [`flush`](TensorLogger::flush).
///
/// # Batch ids
/// The logger counts sentinel tensors (see [`BATCH_SENTINEL`]) to obtain a
/// local batch id starting at `0`, and maps it to a batch id that is unique
/// across the data-parallel group:
///
/// ```text
/// global_batch_id = local_batch_id * dp_size + dp_rank
/// ```
///
/// With `dp_size = 2`, rank 0 labels its batches `0, 2, 4, ...` and rank 1
/// labels them `1, 3, 5, ...`. Tensors logged before the first sentinel get
/// `local_batch_id = -1`.
pub struct RecordingTensorLogger<G: DataParallelGroup> {
    log_dir: PathBuf,
    rank: usize,
    world_size: usize,
    group: G,
    local_batch_id: i64,
    entries: Vec<LoggedTensor>,
}

impl<G: DataParallelGroup> RecordingTensorLogger<G> {
    pub fn new(config: &TensorLoggingConfig, group: G) -> Result<Self> {
        let log_dir = config
            .log_dir
            .clone()
            .ok_or_else(|| anyhow!("a recording tensor logger requires a log directory"))?;
        Ok(Self {
            log_dir,
            rank: config.rank,
            world_size: config.world_size,
            group,
            local_batch_id: -1,
            entries: Vec::new(),
        })
    }

    pub fn local_batch_id(&self) -> i64 {
        self.local_batch_id
    }

    pub fn global_batch_id(&self) -> i64 {
        self.local_batch_id * self.group.world_size() as i64 + self.group.rank() as i64
    }

    /// Snapshots recorded since the last flush, in logging order.
    pub fn entries(&self) -> &[LoggedTensor] {
        &self.entries
    }
}

impl<G: DataParallelGroup> TensorLogger for RecordingTensorLogger<G> {
    fn log(&mut self, name: &str, tensor: Option<&Tensor>) -> Result<()> {
        let Some(tensor) = tensor else {
            return Ok(());
        };

        if name == BATCH_SENTINEL {
            self.local_batch_id += 1;
        }

        let label = format!("batch_{}.{}", self.global_batch_id(), name);
        // Drop the autograd graph and release device memory.
        let tensor = tensor
            .f_detach()
            .and_then(|detached| detached.f_to_device(Device::Cpu))
            .with_context(|| format!("Failed to snapshot tensor {}", label))?;
        self.entries.push(LoggedTensor { label, tensor });
        Ok(())
    }

    fn flush(&mut self) -> Result<Option<PathBuf>> {
        if self.entries.is_empty() {
            info!("[Rank {}] No tensors logged. Exiting...", self.rank);
            return Ok(None);
        }

        let path = save_path(
            &self.log_dir,
            self.rank,
            self.world_size,
            Local::now().naive_local(),
        )?;

        let labels = unique_labels(&self.entries);
        let named_tensors: Vec<(&str, &Tensor)> = labels
            .iter()
            .map(String::as_str)
            .zip(self.entries.iter().map(|entry| &entry.tensor))
            .collect();
        Tensor::save_multi(named_tensors.as_slice(), &path)
            .with_context(|| format!("Failed to save logged tensors to {}", path.display()))?;

        info!(
            "[Rank {}] Logged tensors saved to {} ({} tensors)",
            self.rank,
            path.display(),
            named_tensors.len()
        );
        self.entries.clear();
        Ok(Some(path))
    }

    fn is_recording(&self) -> bool {
        true
    }
}

impl<G: DataParallelGroup> Drop for RecordingTensorLogger<G> {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            warn!(
                "[Rank {}] {} logged tensors were dropped without a flush",
                self.rank,
                self.entries.len()
            );
        }
    }
}

/// Picks the logger implementation for this process.
///
/// Returns a [`RecordingTensorLogger`] when `config.log_dir` is set and a
/// [`NullTensorLogger`] otherwise.
pub fn init_tensor_logger<G>(config: TensorLoggingConfig, group: G) -> Box<dyn TensorLogger>
where
    G: DataParallelGroup + 'static,
{
    match RecordingTensorLogger::new(&config, group) {
        Ok(logger) => {
            debug!(
                "[Rank {}] tensor logging enabled, dumps go to {}",
                config.rank,
                logger.log_dir.display()
            );
            Box::new(logger)
        }
        Err(_) => Box::new(NullTensorLogger),
    }
}

/// Location of the dump for one process.
///
/// - single process: `{log_dir}/{yy-mm-dd-HH-MM}-single.pt`
/// - otherwise: `{log_dir}/{yy-mm-dd-HH-MM}/rank{rank}.pt`, creating the
///   per-run directory if needed.
pub fn save_path(
    log_dir: &Path,
    rank: usize,
    world_size: usize,
    now: NaiveDateTime,
) -> Result<PathBuf> {
    let date = now.format("%y-%m-%d-%H-%M").to_string();
    if world_size == 1 {
        return Ok(log_dir.join(format!("{}-single.pt", date)));
    }

    let run_dir = log_dir.join(&date);
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("Failed to create log directory {}", run_dir.display()))?;
    Ok(run_dir.join(format!("rank{}.pt", rank)))
}

/// Reads a dump written by [`RecordingTensorLogger::flush`].
pub fn load_logged_tensors(path: impl AsRef<Path>) -> Result<Vec<LoggedTensor>> {
    let path = path.as_ref();
    let named_tensors = Tensor::load_multi(path)
        .with_context(|| format!("Failed to load logged tensors from {}", path.display()))?;
    Ok(named_tensors
        .into_iter()
        .map(|(label, tensor)| LoggedTensor { label, tensor })
        .collect())
}

// The archive is keyed by name, so a label logged twice in one batch gets a
// `#n` suffix on its n-th repetition.
fn unique_labels(entries: &[LoggedTensor]) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::with_capacity(entries.len());
    entries
        .iter()
        .map(|entry| {
            let count = seen.entry(entry.label.as_str()).or_insert(0);
            let label = match *count {
                0 => entry.label.clone(),
                n => format!("{}#{}", entry.label, n),
            };
            *count += 1;
            label
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::StaticDataParallelGroup;
    use chrono::NaiveDate;
    use tch::Kind;
    use tempfile::tempdir;

    fn recording_logger(
        log_dir: &Path,
        dp_rank: usize,
        dp_size: usize,
    ) -> Result<RecordingTensorLogger<StaticDataParallelGroup>> {
        let config = TensorLoggingConfig::default()
            .with_log_dir(log_dir)
            .with_process(dp_rank, dp_size);
        RecordingTensorLogger::new(&config, StaticDataParallelGroup::new(dp_rank, dp_size)?)
    }

    fn labels<G: DataParallelGroup>(logger: &RecordingTensorLogger<G>) -> Vec<&str> {
        logger.entries().iter().map(|e| e.label.as_str()).collect()
    }

    fn tokens() -> Tensor {
        Tensor::from_slice(&[1i64, 2, 3])
    }

    #[test]
    fn test_batch_ids_follow_rank_offset() -> Result<()> {
        let dir = tempdir()?;

        let mut rank0 = recording_logger(dir.path(), 0, 2)?;
        let mut rank1 = recording_logger(dir.path(), 1, 2)?;
        for logger in [&mut rank0, &mut rank1] {
            for _ in 0..2 {
                logger.log("tokens", Some(&tokens()))?;
                logger.log("logits", Some(&tokens()))?;
            }
        }

        assert_eq!(
            labels(&rank0),
            vec!["batch_0.tokens", "batch_0.logits", "batch_2.tokens", "batch_2.logits"]
        );
        assert_eq!(
            labels(&rank1),
            vec!["batch_1.tokens", "batch_1.logits", "batch_3.tokens", "batch_3.logits"]
        );

        rank0.entries.clear();
        rank1.entries.clear();
        Ok(())
    }

    #[test]
    fn test_only_sentinel_advances_counter() -> Result<()> {
        let dir = tempdir()?;
        let mut logger = recording_logger(dir.path(), 0, 1)?;

        logger.log("logits", Some(&tokens()))?;
        logger.log("loss", Some(&tokens()))?;
        assert_eq!(logger.local_batch_id(), -1);
        assert_eq!(labels(&logger), vec!["batch_-1.logits", "batch_-1.loss"]);

        logger.log("tokens", Some(&tokens()))?;
        logger.log("hidden", Some(&tokens()))?;
        assert_eq!(logger.local_batch_id(), 0);

        logger.entries.clear();
        Ok(())
    }

    #[test]
    fn test_none_tensor_is_ignored() -> Result<()> {
        let dir = tempdir()?;
        let mut logger = recording_logger(dir.path(), 0, 1)?;

        logger.log("tokens", None)?;
        assert_eq!(logger.local_batch_id(), -1);
        assert!(logger.entries().is_empty());
        assert_eq!(logger.flush()?, None);
        Ok(())
    }

    #[test]
    fn test_snapshot_is_detached_cpu_copy() -> Result<()> {
        let dir = tempdir()?;
        let mut logger = recording_logger(dir.path(), 0, 1)?;

        let weights = Tensor::ones(&[2, 2], (Kind::Float, Device::Cpu)).set_requires_grad(true);
        logger.log("weights", Some(&weights))?;

        let snapshot = &logger.entries()[0].tensor;
        assert!(!snapshot.requires_grad());
        assert_eq!(snapshot.device(), Device::Cpu);
        assert_eq!(snapshot.size(), vec![2, 2]);

        logger.entries.clear();
        Ok(())
    }

    #[test]
    fn test_flush_single_process() -> Result<()> {
        let dir = tempdir()?;
        let mut logger = recording_logger(dir.path(), 0, 1)?;

        logger.log("tokens", Some(&tokens()))?;
        logger.log("logits", Some(&Tensor::zeros(&[3, 4], (Kind::Float, Device::Cpu))))?;

        let path = logger.flush()?.expect("tensors were logged");
        assert!(path.exists());
        assert_eq!(path.parent(), Some(dir.path()));
        assert!(path.to_string_lossy().ends_with("-single.pt"));
        assert!(logger.entries().is_empty());

        let loaded = load_logged_tensors(&path)?;
        assert_eq!(loaded.len(), 2);
        let logits = loaded
            .iter()
            .find(|t| t.label == "batch_0.logits")
            .expect("logits saved");
        assert_eq!(logits.tensor.size(), vec![3, 4]);

        // A second flush has nothing left to write.
        assert_eq!(logger.flush()?, None);
        Ok(())
    }

    #[test]
    fn test_flush_multi_process_writes_rank_file() -> Result<()> {
        let dir = tempdir()?;
        let mut logger = recording_logger(dir.path(), 1, 2)?;
        logger.log("tokens", Some(&tokens()))?;

        let path = logger.flush()?.expect("tensors were logged");
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("rank1.pt"));
        assert_eq!(path.parent().and_then(Path::parent), Some(dir.path()));
        Ok(())
    }

    #[test]
    fn test_repeated_labels_are_kept() -> Result<()> {
        let dir = tempdir()?;
        let mut logger = recording_logger(dir.path(), 0, 1)?;
        logger.log("tokens", Some(&tokens()))?;
        logger.log("hidden", Some(&tokens()))?;
        logger.log("hidden", Some(&tokens()))?;

        assert_eq!(
            unique_labels(logger.entries()),
            vec!["batch_0.tokens", "batch_0.hidden", "batch_0.hidden#1"]
        );

        let path = logger.flush()?.expect("tensors were logged");
        assert_eq!(load_logged_tensors(&path)?.len(), 3);
        Ok(())
    }

    #[test]
    fn test_save_path_layout() -> Result<()> {
        let dir = tempdir()?;
        let now = NaiveDate::from_ymd_opt(2024, 3, 5)
            .and_then(|d| d.and_hms_opt(14, 7, 0))
            .expect("valid timestamp");

        let single = save_path(dir.path(), 0, 1, now)?;
        assert_eq!(single, dir.path().join("24-03-05-14-07-single.pt"));

        let multi = save_path(dir.path(), 3, 4, now)?;
        assert_eq!(multi, dir.path().join("24-03-05-14-07").join("rank3.pt"));
        assert!(dir.path().join("24-03-05-14-07").is_dir());

        // Directory creation is idempotent.
        assert_eq!(save_path(dir.path(), 3, 4, now)?, multi);
        Ok(())
    }

    #[test]
    fn test_init_selects_implementation() -> Result<()> {
        let dir = tempdir()?;

        let mut disabled =
            init_tensor_logger(TensorLoggingConfig::default(), StaticDataParallelGroup::single());
        assert!(!disabled.is_recording());
        disabled.log("tokens", Some(&tokens()))?;
        assert_eq!(disabled.flush()?, None);

        let mut enabled = init_tensor_logger(
            TensorLoggingConfig::default().with_log_dir(dir.path()),
            StaticDataParallelGroup::single(),
        );
        assert!(enabled.is_recording());
        enabled.log("tokens", Some(&tokens()))?;
        assert!(enabled.flush()?.is_some());
        Ok(())
    }
}
