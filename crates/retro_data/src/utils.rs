use anyhow::{ensure, Result};
use tracing::Level;

/// Scales non-negative weights so that they sum to one.
pub fn normalize(weights: &[f64]) -> Result<Vec<f64>> {
    ensure!(
        weights.iter().all(|&w| w >= 0.0 && w.is_finite()),
        "All weights must be finite and non-negative, got {:?}",
        weights
    );
    let total: f64 = weights.iter().sum();
    ensure!(total > 0.0, "At least one weight must be positive, got {:?}", weights);
    Ok(weights.iter().map(|w| w / total).collect())
}

/// Global rank of this process as set by the launcher (`RANK`, default `0`).
pub fn global_rank() -> usize {
    std::env::var("RANK")
        .ok()
        .and_then(|rank| rank.trim().parse().ok())
        .unwrap_or(0)
}

/// Emits `message` only on the first rank so that a job with hundreds of
/// processes does not repeat the same line hundreds of times.
pub fn log_single_rank(level: Level, message: &str) {
    if global_rank() != 0 {
        return;
    }
    match level {
        Level::ERROR => tracing::error!("{}", message),
        Level::WARN => tracing::warn!("{}", message),
        Level::INFO => tracing::info!("{}", message),
        Level::DEBUG => tracing::debug!("{}", message),
        _ => tracing::trace!("{}", message),
    }
}

/// Runs `f` under a plain-text subscriber and returns its result together
/// with everything it logged.
#[cfg(test)]
pub(crate) fn capture_logs<T>(f: impl FnOnce() -> T) -> Result<(T, String)> {
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0
                .lock()
                .map_err(|_| io::Error::other("log buffer poisoned"))?
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    let buffer = Buffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(Level::TRACE)
        .finish();
    let value = tracing::subscriber::with_default(subscriber, f);
    let bytes = buffer
        .0
        .lock()
        .map_err(|_| anyhow::anyhow!("log buffer poisoned"))?;
    Ok((value, String::from_utf8_lossy(&bytes).into_owned()))
}
