//! Receiver-side flow-control policy contract.
//!
//! Each case plugs a [`FlowPolicy`] into the generic
//! [`crate::receiver::Receiver`] harness.  An engine decides admission for
//! every inbound data segment, produces the periodic [`ControlMessage`]
//! broadcast to the sender, and may run background drain tasks.
//!
//! Engines are shared between the read loop, the status task, and any drain
//! tasks, so every method takes `&self`; implementations keep their mutable
//! state behind a lock that is never held across an await point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::control::ControlMessage;

/// Why a segment was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Admitting would push buffer occupancy past its hard limit.
    Overflow,
    /// RED dropped the segment before it reached the queue.
    EarlyDrop,
    /// The queue was at hard capacity.
    TailDrop,
    /// Not enough tokens left in the current interval.
    BucketExhausted,
}

/// Verdict for one inbound segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Dropped(DropReason),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Cumulative admission counters for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyStats {
    pub admitted_segments: u64,
    pub admitted_bytes: u64,
    pub dropped_segments: u64,
    pub dropped_bytes: u64,
}

/// Lock-free counters behind [`PolicyStats`].
#[derive(Debug, Default)]
pub struct StatsCounter {
    admitted_segments: AtomicU64,
    admitted_bytes: AtomicU64,
    dropped_segments: AtomicU64,
    dropped_bytes: AtomicU64,
}

impl StatsCounter {
    pub fn record(&self, verdict: Admission, len: usize) {
        let (segments, bytes) = match verdict {
            Admission::Admitted => (&self.admitted_segments, &self.admitted_bytes),
            Admission::Dropped(_) => (&self.dropped_segments, &self.dropped_bytes),
        };
        segments.fetch_add(1, Ordering::Relaxed);
        bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PolicyStats {
        PolicyStats {
            admitted_segments: self.admitted_segments.load(Ordering::Relaxed),
            admitted_bytes: self.admitted_bytes.load(Ordering::Relaxed),
            dropped_segments: self.dropped_segments.load(Ordering::Relaxed),
            dropped_bytes: self.dropped_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Admission, status, and drain behaviour of one flow-control case.
pub trait FlowPolicy: Send + Sync + 'static {
    /// Decide whether to accept `segment`, updating internal state.
    fn admit(&self, segment: Vec<u8>) -> Admission;

    /// Called once per status interval; returns the feedback to send.
    fn status_tick(&self) -> ControlMessage;

    /// Period of [`FlowPolicy::status_tick`].
    fn status_interval(&self) -> Duration;

    /// Value forwarded to the metric log.
    fn metric(&self) -> u64;

    fn stats(&self) -> PolicyStats;

    /// Start background drain tasks.  They must exit once `shutdown`
    /// changes or its sender is dropped.
    fn spawn_drain(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>>;
}

/// Lock `m`, recovering the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Run `tick` every `period` until `shutdown` fires.
///
/// Shared by engines whose drain is a plain periodic adjustment.
pub(crate) fn spawn_ticker<F>(
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => tick(),
                _ = shutdown.changed() => break,
            }
        }
    })
}
