//! Case 1: watermark stop/go flow control.
//!
//! The receiver tracks application-buffer occupancy in bytes.  Every data
//! segment adds to it and a periodic drain removes a fixed quantum.  A status
//! task classifies occupancy against two watermarks:
//!
//! | occupancy       | level  |
//! |-----------------|--------|
//! | `>= high`       | `SLOW` |
//! | `<= low`        | `FAST` |
//! | otherwise       | `OK`   |
//!
//! The sender reacts by stretching or shrinking its inter-chunk delay and
//! chunk size inside fixed bounds.  No RTT signal is involved.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::control::{ControlMessage, Level};
use crate::pacing::{step_duration, step_usize, Pacer, Pause, RoundPlan};
use crate::policy::{lock, spawn_ticker, Admission, DropReason, FlowPolicy, PolicyStats, StatsCounter};

/// Receiver-side parameters.
#[derive(Debug, Clone)]
pub struct WatermarkConfig {
    /// Hard buffer size in bytes.
    pub limit: u64,
    pub low: u64,
    pub high: u64,
    /// Bytes removed per drain tick.
    pub drain_quantum: u64,
    pub drain_interval: Duration,
    pub status_interval: Duration,
}

impl WatermarkConfig {
    /// Watermarks at 50 % and 90 % of `limit`.
    pub fn with_limit(limit: u64) -> Self {
        Self {
            limit,
            low: limit / 2,
            high: limit * 9 / 10,
            ..Self::default()
        }
    }
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        let limit = 200 * 1024;
        Self {
            limit,
            low: limit / 2,
            high: limit * 9 / 10,
            drain_quantum: 4096,
            drain_interval: Duration::from_millis(10),
            status_interval: Duration::from_millis(200),
        }
    }
}

/// Map an occupancy onto the three-level signal.
pub fn classify(occupancy: u64, cfg: &WatermarkConfig) -> Level {
    if occupancy >= cfg.high {
        Level::Slow
    } else if occupancy <= cfg.low {
        Level::Fast
    } else {
        Level::Ok
    }
}

// ---------------------------------------------------------------------------
// WatermarkController
// ---------------------------------------------------------------------------

/// Per-connection occupancy tracker.
#[derive(Debug, Clone)]
pub struct WatermarkController {
    cfg: WatermarkConfig,
    occupancy: Arc<Mutex<u64>>,
    stats: Arc<StatsCounter>,
}

impl WatermarkController {
    pub fn new(cfg: WatermarkConfig) -> Self {
        Self {
            cfg,
            occupancy: Arc::new(Mutex::new(0)),
            stats: Arc::new(StatsCounter::default()),
        }
    }

    pub fn occupancy(&self) -> u64 {
        *lock(&self.occupancy)
    }

    /// Remove one drain quantum; never goes below zero.
    pub fn drain_once(&self) {
        let mut occ = lock(&self.occupancy);
        *occ -= (*occ).min(self.cfg.drain_quantum);
    }
}

impl FlowPolicy for WatermarkController {
    fn admit(&self, segment: Vec<u8>) -> Admission {
        let len = segment.len() as u64;
        let verdict = {
            let mut occ = lock(&self.occupancy);
            if *occ + len > self.cfg.limit {
                Admission::Dropped(DropReason::Overflow)
            } else {
                *occ += len;
                Admission::Admitted
            }
        };
        if !verdict.is_admitted() {
            log::debug!("[rx] buffer overflow, dropped {len} bytes");
        }
        self.stats.record(verdict, segment.len());
        verdict
    }

    fn status_tick(&self) -> ControlMessage {
        let occupancy = self.occupancy();
        ControlMessage::BufferStatus {
            occupancy,
            level: classify(occupancy, &self.cfg),
        }
    }

    fn status_interval(&self) -> Duration {
        self.cfg.status_interval
    }

    fn metric(&self) -> u64 {
        self.occupancy()
    }

    fn stats(&self) -> PolicyStats {
        self.stats.snapshot()
    }

    fn spawn_drain(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let this = self.clone();
        vec![spawn_ticker(self.cfg.drain_interval, shutdown, move || {
            this.drain_once()
        })]
    }
}

// ---------------------------------------------------------------------------
// WatermarkPacer
// ---------------------------------------------------------------------------

/// Sender-side bounds and step sizes.
#[derive(Debug, Clone, PartialEq)]
pub struct WatermarkPacerConfig {
    pub initial_delay: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub slow_delay_step: Duration,
    pub fast_delay_step: Duration,
    pub initial_chunk: usize,
    pub min_chunk: usize,
    pub max_chunk: usize,
    pub chunk_step: usize,
}

impl Default for WatermarkPacerConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            min_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            slow_delay_step: Duration::from_millis(5),
            fast_delay_step: Duration::from_millis(2),
            initial_chunk: 1024,
            min_chunk: 512,
            max_chunk: 2048,
            chunk_step: 128,
        }
    }
}

/// Length of the `PKT000000` frame header.
const FRAME_TAG_LEN: usize = 9;

/// One fixed-size frame per round, `delay` apart.
#[derive(Debug, Clone, PartialEq)]
pub struct WatermarkPacer {
    cfg: Arc<WatermarkPacerConfig>,
    pub delay: Duration,
    pub chunk_size: usize,
    pub last_level: Level,
}

impl WatermarkPacer {
    pub fn new(cfg: WatermarkPacerConfig) -> Self {
        Self {
            delay: cfg.initial_delay.clamp(cfg.min_delay, cfg.max_delay),
            chunk_size: cfg.initial_chunk.clamp(cfg.min_chunk, cfg.max_chunk),
            last_level: Level::Ok,
            cfg: Arc::new(cfg),
        }
    }

    pub fn config(&self) -> &WatermarkPacerConfig {
        &self.cfg
    }

    fn apply_level(&mut self, level: Level) {
        let c = &self.cfg;
        self.last_level = level;
        match level {
            Level::Slow => {
                self.delay = step_duration(self.delay, true, c.slow_delay_step, c.min_delay, c.max_delay);
                self.chunk_size = step_usize(self.chunk_size, false, c.chunk_step, c.min_chunk, c.max_chunk);
            }
            Level::Fast => {
                self.delay = step_duration(self.delay, false, c.fast_delay_step, c.min_delay, c.max_delay);
                self.chunk_size = step_usize(self.chunk_size, true, c.chunk_step, c.min_chunk, c.max_chunk);
            }
            Level::Ok => {}
        }
    }
}

impl Default for WatermarkPacer {
    fn default() -> Self {
        Self::new(WatermarkPacerConfig::default())
    }
}

impl Pacer for WatermarkPacer {
    fn on_feedback(&mut self, msg: &ControlMessage) {
        if let ControlMessage::BufferStatus { level, .. } = msg {
            self.apply_level(*level);
        }
    }

    fn plan_round(&self, round: u64) -> RoundPlan {
        let mut frame = format!("PKT{:06}", round % 1_000_000).into_bytes();
        frame.resize(self.chunk_size.max(FRAME_TAG_LEN), b'D');
        RoundPlan {
            writes: vec![frame],
            gap: Duration::ZERO,
            pause: Pause::After(self.delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(level: Level) -> ControlMessage {
        ControlMessage::BufferStatus {
            occupancy: 0,
            level,
        }
    }

    #[test]
    fn default_watermarks_match_limit() {
        let cfg = WatermarkConfig::default();
        assert_eq!(cfg.limit, 204_800);
        assert_eq!(cfg.high, 184_320);
        assert_eq!(cfg.low, 102_400);
    }

    #[test]
    fn classification_against_watermarks() {
        let cfg = WatermarkConfig::default();
        assert_eq!(classify(190_000, &cfg), Level::Slow);
        assert_eq!(classify(90_000, &cfg), Level::Fast);
        assert_eq!(classify(150_000, &cfg), Level::Ok);
        assert_eq!(classify(cfg.high, &cfg), Level::Slow);
        assert_eq!(classify(cfg.low, &cfg), Level::Fast);
    }

    #[test]
    fn admit_accumulates_and_drain_never_goes_negative() {
        let ctl = WatermarkController::new(WatermarkConfig::default());
        assert!(ctl.admit(vec![0; 3000]).is_admitted());
        assert_eq!(ctl.occupancy(), 3000);
        ctl.drain_once();
        assert_eq!(ctl.occupancy(), 0);
        ctl.drain_once();
        assert_eq!(ctl.occupancy(), 0);
    }

    #[test]
    fn segment_past_limit_overflows() {
        let ctl = WatermarkController::new(WatermarkConfig::with_limit(1000));
        assert!(ctl.admit(vec![0; 900]).is_admitted());
        assert_eq!(
            ctl.admit(vec![0; 200]),
            Admission::Dropped(DropReason::Overflow)
        );
        assert_eq!(ctl.occupancy(), 900);
        let stats = ctl.stats();
        assert_eq!(stats.dropped_segments, 1);
        assert_eq!(stats.dropped_bytes, 200);
    }

    #[test]
    fn status_reports_occupancy_and_level() {
        let ctl = WatermarkController::new(WatermarkConfig::default());
        ctl.admit(vec![0; 190_000]);
        assert_eq!(
            ctl.status_tick(),
            ControlMessage::BufferStatus {
                occupancy: 190_000,
                level: Level::Slow
            }
        );
    }

    #[test]
    fn slow_backs_off_and_fast_speeds_up() {
        let mut p = WatermarkPacer::default();
        p.on_feedback(&status(Level::Slow));
        assert_eq!(p.delay, Duration::from_millis(15));
        assert_eq!(p.chunk_size, 896);

        p.on_feedback(&status(Level::Fast));
        assert_eq!(p.delay, Duration::from_millis(13));
        assert_eq!(p.chunk_size, 1024);

        p.on_feedback(&status(Level::Ok));
        assert_eq!(p.delay, Duration::from_millis(13));
        assert_eq!(p.chunk_size, 1024);
    }

    #[test]
    fn other_feedback_is_ignored() {
        let mut p = WatermarkPacer::default();
        let before = p.clone();
        p.on_feedback(&ControlMessage::BandwidthBudget {
            budget: 1,
            interval_ms: 1,
        });
        assert_eq!(p, before);
    }

    #[test]
    fn frame_is_tagged_and_sized() {
        let p = WatermarkPacer::default();
        let plan = p.plan_round(42);
        assert_eq!(plan.writes.len(), 1);
        assert_eq!(plan.writes[0].len(), 1024);
        assert!(plan.writes[0].starts_with(b"PKT000042D"));
        assert_eq!(plan.pause, Pause::After(Duration::from_millis(10)));
    }

    #[test]
    fn random_feedback_stays_in_bounds() {
        use rand::Rng;

        let mut rng = rand::rng();
        let mut p = WatermarkPacer::default();
        let cfg = p.config().clone();
        for _ in 0..2000 {
            let level = match rng.random_range(0..3) {
                0 => Level::Slow,
                1 => Level::Fast,
                _ => Level::Ok,
            };
            p.on_feedback(&status(level));
            assert!((cfg.min_chunk..=cfg.max_chunk).contains(&p.chunk_size));
            assert!(p.delay >= cfg.min_delay && p.delay <= cfg.max_delay);
        }
    }
}
