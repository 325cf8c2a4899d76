//! Sender-side adaptive pacing.
//!
//! A [`Pacer`] holds the adjustable knobs of one case (delay, chunk or batch
//! size, window) and knows how to turn them into the next [`RoundPlan`].
//!
//! # Ownership
//!
//! ```text
//!  control listener ──Feedback──┐
//!                               ▼
//!                      ┌─────────────────┐   watch (snapshot)   ┌───────────┐
//!                      │   pacing task   │─────────────────────▶│ send loop │
//!                      │ (owns the Pacer)│                      └─────┬─────┘
//!                      └─────────────────┘                            │
//!                               ▲               Round(report)         │
//!                               └─────────────────────────────────────┘
//! ```
//!
//! Only the pacing task mutates the live pacer.  Feedback and round reports
//! are applied in arrival order and each update publishes an immutable clone,
//! so the send loop never takes a lock.  Application is eventually
//! consistent: a round may be planned from a snapshot that predates feedback
//! already on the wire.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::control::ControlMessage;

/// How long to wait after a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pause {
    /// Sleep the full duration after the last write.
    After(Duration),
    /// Sleep whatever remains of a cycle of this length, measured from the
    /// start of the round.
    Cycle(Duration),
}

impl Pause {
    /// Sleep time left once `spent` has already elapsed in the round.
    pub fn remaining(&self, spent: Duration) -> Duration {
        match *self {
            Pause::After(d) => d,
            Pause::Cycle(d) => d.saturating_sub(spent),
        }
    }
}

/// What the send loop does in one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundPlan {
    /// Payloads written back to back, each as one data frame.
    pub writes: Vec<Vec<u8>>,
    /// Sleep after each write.
    pub gap: Duration,
    pub pause: Pause,
}

/// Outcome of one round, reported back to the pacer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub bytes_sent: usize,
    /// Wall time of each completed write.
    pub latencies: Vec<Duration>,
}

/// Adjustable pacing state of one case.
///
/// Clones are the immutable snapshots handed to the send loop.
pub trait Pacer: Clone + std::fmt::Debug + Send + Sync + 'static {
    /// Apply receiver feedback.
    fn on_feedback(&mut self, msg: &ControlMessage);

    /// Apply a locally measured round outcome.
    fn on_round(&mut self, _report: &RoundReport) {}

    /// Build round number `round` (zero-based) from the current knobs.
    fn plan_round(&self, round: u64) -> RoundPlan;
}

/// Update delivered to the pacing task.
#[derive(Debug, Clone)]
pub enum PacingEvent {
    Feedback(ControlMessage),
    Round(RoundReport),
}

/// Spawn the task that owns `pacer`.
///
/// The task exits once every clone of the returned event sender is dropped.
pub fn spawn_pacing<P: Pacer>(
    pacer: P,
) -> (mpsc::Sender<PacingEvent>, watch::Receiver<P>, JoinHandle<P>) {
    let (event_tx, event_rx) = mpsc::channel(64);
    let (snapshot_tx, snapshot_rx) = watch::channel(pacer.clone());
    let handle = tokio::spawn(pacing_loop(pacer, event_rx, snapshot_tx));
    (event_tx, snapshot_rx, handle)
}

async fn pacing_loop<P: Pacer>(
    mut pacer: P,
    mut events: mpsc::Receiver<PacingEvent>,
    snapshots: watch::Sender<P>,
) -> P {
    while let Some(event) = events.recv().await {
        match &event {
            PacingEvent::Feedback(msg) => {
                pacer.on_feedback(msg);
                log::trace!("[pacing] feedback {msg:?} -> {pacer:?}");
            }
            PacingEvent::Round(report) => pacer.on_round(report),
        }
        snapshots.send_replace(pacer.clone());
    }
    pacer
}

/// Add `step` to `value` without leaving `[min, max]`.
pub(crate) fn step_duration(value: Duration, up: bool, step: Duration, min: Duration, max: Duration) -> Duration {
    let next = if up {
        value.saturating_add(step)
    } else {
        value.saturating_sub(step)
    };
    next.clamp(min, max)
}

/// Integer counterpart of [`step_duration`].
pub(crate) fn step_usize(value: usize, up: bool, step: usize, min: usize, max: usize) -> usize {
    let next = if up {
        value.saturating_add(step)
    } else {
        value.saturating_sub(step)
    };
    next.clamp(min, max)
}
