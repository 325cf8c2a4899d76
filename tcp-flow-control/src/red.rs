//! Case 2: RED queue admission with a bounded worker pool.
//!
//! Inbound segments go into a bounded queue drained by `N` workers, each
//! spending a fixed service time per item.  Admission uses Random Early
//! Detection on the queue length `ql` seen before the enqueue:
//!
//! ```text
//!   p(drop)
//!   1.0 ┤                 ┌──────────
//!       │               ╱
//!       │             ╱
//!   0.0 ┼───────────┘
//!       └───────────┬─────┬──────────▶ ql
//!                 minTh  maxTh
//! ```
//!
//! A segment that survives RED but finds the queue at hard capacity is
//! tail-dropped instead of blocking the read loop.
//!
//! The sender runs two loops at once: queue feedback adjusts delay and batch
//! size, and the mean of its last 40 write latencies nudges the delay again.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::control::{ControlMessage, Level};
use crate::pacing::{step_duration, step_usize, Pacer, Pause, RoundPlan, RoundReport};
use crate::policy::{lock, Admission, DropReason, FlowPolicy, PolicyStats, StatsCounter};

/// Receiver-side parameters.
#[derive(Debug, Clone)]
pub struct RedConfig {
    /// Hard queue capacity (`Qmax`).
    pub capacity: usize,
    pub min_th: usize,
    pub max_th: usize,
    pub workers: usize,
    /// Time each worker spends on one item.
    pub service_delay: Duration,
    pub status_interval: Duration,
}

impl Default for RedConfig {
    fn default() -> Self {
        Self {
            capacity: 800,
            min_th: 250,
            max_th: 600,
            workers: 6,
            service_delay: Duration::from_millis(10),
            status_interval: Duration::from_millis(200),
        }
    }
}

/// Linear RED drop probability for queue length `ql`.
pub fn drop_probability(ql: usize, cfg: &RedConfig) -> f64 {
    if ql <= cfg.min_th {
        0.0
    } else if ql >= cfg.max_th {
        1.0
    } else {
        (ql - cfg.min_th) as f64 / (cfg.max_th - cfg.min_th) as f64
    }
}

/// Admission decision for queue length `ql` given a uniform roll in `[0, 1)`.
pub fn red_verdict(ql: usize, cfg: &RedConfig, roll: f64) -> Admission {
    if roll < drop_probability(ql, cfg) {
        Admission::Dropped(DropReason::EarlyDrop)
    } else if ql >= cfg.capacity {
        Admission::Dropped(DropReason::TailDrop)
    } else {
        Admission::Admitted
    }
}

/// Three-level signal for the status broadcast.
pub fn classify(ql: usize, cfg: &RedConfig) -> Level {
    if ql >= cfg.max_th {
        Level::Slow
    } else if ql <= cfg.min_th / 2 {
        Level::Fast
    } else {
        Level::Ok
    }
}

// ---------------------------------------------------------------------------
// RedQueue
// ---------------------------------------------------------------------------

/// Bounded queue with RED admission, drained by a worker pool.
#[derive(Debug, Clone)]
pub struct RedQueue {
    cfg: RedConfig,
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    ready: Arc<Notify>,
    stats: Arc<StatsCounter>,
}

impl RedQueue {
    pub fn new(cfg: RedConfig) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::with_capacity(cfg.capacity))),
            ready: Arc::new(Notify::new()),
            stats: Arc::new(StatsCounter::default()),
            cfg,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admit with an explicit roll; [`FlowPolicy::admit`] draws it from the
    /// thread RNG.
    pub fn admit_with_roll(&self, segment: Vec<u8>, roll: f64) -> Admission {
        let len = segment.len();
        let verdict = {
            let mut q = lock(&self.queue);
            let verdict = red_verdict(q.len(), &self.cfg, roll);
            if verdict.is_admitted() {
                q.push_back(segment);
            }
            verdict
        };
        if verdict.is_admitted() {
            self.ready.notify_one();
        }
        self.stats.record(verdict, len);
        verdict
    }

    fn pop(&self) -> Option<Vec<u8>> {
        lock(&self.queue).pop_front()
    }

    async fn worker(self, id: usize, mut shutdown: watch::Receiver<bool>) {
        log::trace!("[rx] worker {id} started");
        loop {
            match self.pop() {
                Some(_item) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.cfg.service_delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.ready.notified() => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        log::trace!("[rx] worker {id} stopped");
    }
}

impl FlowPolicy for RedQueue {
    fn admit(&self, segment: Vec<u8>) -> Admission {
        let roll = rand::rng().random::<f64>();
        self.admit_with_roll(segment, roll)
    }

    fn status_tick(&self) -> ControlMessage {
        let ql = self.len();
        ControlMessage::QueueStatus {
            length: ql as u64,
            level: classify(ql, &self.cfg),
        }
    }

    fn status_interval(&self) -> Duration {
        self.cfg.status_interval
    }

    fn metric(&self) -> u64 {
        self.len() as u64
    }

    fn stats(&self) -> PolicyStats {
        self.stats.snapshot()
    }

    fn spawn_drain(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.cfg.workers)
            .map(|id| tokio::spawn(self.clone().worker(id, shutdown.clone())))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// QueuePacer
// ---------------------------------------------------------------------------

/// Sender-side bounds, steps, and latency-guard thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuePacerConfig {
    pub initial_batch: usize,
    pub min_batch: usize,
    pub max_batch: usize,
    pub initial_delay: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub slow_delay_step: Duration,
    pub slow_batch_step: usize,
    pub fast_delay_step: Duration,
    pub fast_batch_step: usize,
    /// Applied on `OK` to damp oscillation.
    pub ok_delay_step: Duration,
    /// Number of recent write latencies averaged by the guard.
    pub latency_window: usize,
    pub latency_high: Duration,
    pub latency_high_step: Duration,
    pub latency_low: Duration,
    pub latency_low_step: Duration,
    /// Padding bytes after the timestamp in each record.
    pub record_padding: usize,
}

impl Default for QueuePacerConfig {
    fn default() -> Self {
        let ms = Duration::from_millis;
        Self {
            initial_batch: 12,
            min_batch: 4,
            max_batch: 24,
            initial_delay: ms(12),
            min_delay: ms(4),
            max_delay: ms(50),
            slow_delay_step: ms(4),
            slow_batch_step: 2,
            fast_delay_step: ms(3),
            fast_batch_step: 1,
            ok_delay_step: ms(1),
            latency_window: 40,
            latency_high: ms(25),
            latency_high_step: ms(3),
            latency_low: ms(10),
            latency_low_step: ms(1),
            record_padding: 512,
        }
    }
}

/// Batched records per cycle, paced by queue feedback and write latency.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuePacer {
    cfg: Arc<QueuePacerConfig>,
    pub batch: usize,
    pub delay: Duration,
    pub last_level: Level,
    latencies: VecDeque<Duration>,
}

impl QueuePacer {
    pub fn new(cfg: QueuePacerConfig) -> Self {
        Self {
            batch: cfg.initial_batch.clamp(cfg.min_batch, cfg.max_batch),
            delay: cfg.initial_delay.clamp(cfg.min_delay, cfg.max_delay),
            last_level: Level::Ok,
            latencies: VecDeque::with_capacity(cfg.latency_window),
            cfg: Arc::new(cfg),
        }
    }

    pub fn config(&self) -> &QueuePacerConfig {
        &self.cfg
    }

    /// Mean of the latency window, once it is full.
    pub fn mean_latency(&self) -> Option<Duration> {
        let n = self.latencies.len();
        if n == 0 || n < self.cfg.latency_window {
            return None;
        }
        Some(self.latencies.iter().sum::<Duration>() / n as u32)
    }
}

impl Default for QueuePacer {
    fn default() -> Self {
        Self::new(QueuePacerConfig::default())
    }
}

impl Pacer for QueuePacer {
    fn on_feedback(&mut self, msg: &ControlMessage) {
        let ControlMessage::QueueStatus { level, .. } = msg else {
            return;
        };
        let c = &self.cfg;
        self.last_level = *level;
        match level {
            Level::Slow => {
                self.delay = step_duration(self.delay, true, c.slow_delay_step, c.min_delay, c.max_delay);
                self.batch = step_usize(self.batch, false, c.slow_batch_step, c.min_batch, c.max_batch);
            }
            Level::Fast => {
                self.delay = step_duration(self.delay, false, c.fast_delay_step, c.min_delay, c.max_delay);
                self.batch = step_usize(self.batch, true, c.fast_batch_step, c.min_batch, c.max_batch);
            }
            Level::Ok => {
                self.delay = step_duration(self.delay, true, c.ok_delay_step, c.min_delay, c.max_delay);
            }
        }
    }

    fn on_round(&mut self, report: &RoundReport) {
        self.latencies.extend(report.latencies.iter().copied());
        while self.latencies.len() > self.cfg.latency_window {
            self.latencies.pop_front();
        }

        let Some(mean) = self.mean_latency() else {
            return;
        };
        let c = &self.cfg;
        if mean > c.latency_high {
            self.delay = step_duration(self.delay, true, c.latency_high_step, c.min_delay, c.max_delay);
        } else if mean < c.latency_low {
            self.delay = step_duration(self.delay, false, c.latency_low_step, c.min_delay, c.max_delay);
        }
    }

    fn plan_round(&self, _round: u64) -> RoundPlan {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let mut record = format!("{now:.6}|").into_bytes();
        record.resize(record.len() + self.cfg.record_padding, b'A');
        RoundPlan {
            writes: vec![record; self.batch],
            gap: Duration::ZERO,
            pause: Pause::Cycle(self.delay),
        }
    }
}
