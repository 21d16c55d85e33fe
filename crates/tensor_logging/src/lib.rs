//! Per-batch tensor snapshots for debugging data-parallel training runs.
//!
//! A training process picks one [`TensorLogger`] at start-up with
//! [`init_tensor_logger`] and passes it to every call site that wants to
//! record intermediate tensors:
//!
//! ```ignore
//! let config = TensorLoggingConfig::from_env()?;
//! let group = StaticDataParallelGroup::new(dp_rank, dp_size)?;
//! let mut logger = init_tensor_logger(config, group);
//!
//! for batch in batches {
//!     logger.log("tokens", Some(&batch.tokens))?;
//!     let logits = model.forward(&batch.tokens);
//!     logger.log("logits", Some(&logits))?;
//! }
//!
//! // Explicit shutdown flush
//! logger.flush()?;
//! ```
//!
//! When `LOG_PATH` is unset the returned logger is a [`NullTensorLogger`]
//! and every call is a no-op.

pub mod config;
pub mod logger;
pub mod parallel;

pub use config::TensorLoggingConfig;
pub use logger::{
    init_tensor_logger, load_logged_tensors, save_path, LoggedTensor, NullTensorLogger,
    RecordingTensorLogger, TensorLogger, BATCH_SENTINEL,
};
pub use parallel::{DataParallelGroup, StaticDataParallelGroup};
