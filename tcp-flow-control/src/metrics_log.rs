//! Periodic metric log.
//!
//! [`MetricLog`] appends one `elapsed_seconds,value` row per tick to a CSV
//! file.  The value is whatever was set most recently through
//! [`MetricLog::update_buffer_size`]; updates between ticks overwrite each
//! other, they are not averaged.
//!
//! ```text
//! Timestamp,BufferSize
//! 1.000412,18432
//! 2.000655,102400
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const HEADER: &str = "Timestamp,BufferSize\n";

/// Default period between rows.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Running CSV logger.  Cheap to clone; clones share the value slot.
#[derive(Debug, Clone)]
pub struct MetricLog {
    value: Arc<AtomicU64>,
    path: PathBuf,
}

/// Owner side that stops the writer task.
#[derive(Debug)]
pub struct MetricLogTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<std::io::Result<u64>>,
}

impl MetricLog {
    /// Create (truncate) `path`, write the header, and start ticking.
    pub async fn start(path: impl AsRef<Path>) -> std::io::Result<(Self, MetricLogTask)> {
        Self::start_with_tick(path, DEFAULT_TICK).await
    }

    pub async fn start_with_tick(
        path: impl AsRef<Path>,
        tick: Duration,
    ) -> std::io::Result<(Self, MetricLogTask)> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut out = BufWriter::new(File::create(&path).await?);
        out.write_all(HEADER.as_bytes()).await?;
        out.flush().await?;

        let value = Arc::new(AtomicU64::new(0));
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(write_rows(out, value.clone(), tick, stop_rx));
        log::info!("[metrics] logging to {}", path.display());

        Ok((
            Self { value, path },
            MetricLogTask {
                stop: stop_tx,
                handle,
            },
        ))
    }

    /// Record the latest metric value.
    pub fn update_buffer_size(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricLogTask {
    /// Stop ticking and flush.  Returns the number of rows written.
    pub async fn stop(self) -> std::io::Result<u64> {
        let _ = self.stop.send(());
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        }
    }
}

async fn write_rows(
    mut out: BufWriter<File>,
    value: Arc<AtomicU64>,
    tick: Duration,
    mut stop: oneshot::Receiver<()>,
) -> std::io::Result<u64> {
    let start = Instant::now();
    let mut ticker = tokio::time::interval_at(start + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut rows = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let elapsed = start.elapsed().as_secs_f64();
                let line = format!("{elapsed:.6},{}\n", value.load(Ordering::Relaxed));
                out.write_all(line.as_bytes()).await?;
                out.flush().await?;
                rows += 1;
            }
            _ = &mut stop => break,
        }
    }

    out.flush().await?;
    Ok(rows)
}
