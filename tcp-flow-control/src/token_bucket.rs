//! Case 3: token-bucket bandwidth policing with AIMD window adaptation.
//!
//! The receiver resets its bucket to a fixed `budget` once per `interval`
//! (a periodic reset, not continuous refill) and polices each inbound
//! segment: a segment that fits is admitted and consumes its size in tokens,
//! a segment that does not fit is dropped whole.  Each reset is announced to
//! the sender as a `BandwidthBudget`.
//!
//! The sender keeps a window `cwnd` in `[budget, 2 × budget]` and sends
//! `min(budget, cwnd)` bytes per interval in small paced chunks.  After every
//! interval it applies AIMD:
//!
//! ```text
//!   sent >= budget  →  cwnd = max(budget, round(cwnd × 0.95))
//!   otherwise       →  cwnd = min(2 × budget, cwnd + chunk)
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::control::ControlMessage;
use crate::pacing::{Pacer, Pause, RoundPlan, RoundReport};
use crate::policy::{lock, Admission, DropReason, FlowPolicy, PolicyStats, StatsCounter};

/// Receiver-side parameters.
#[derive(Debug, Clone)]
pub struct TokenBucketConfig {
    /// Bytes allowed per interval.
    pub budget: u64,
    pub interval: Duration,
}

impl TokenBucketConfig {
    /// Budget for a link of `bits_per_sec` sliced into `interval`s.
    pub fn from_rate(bits_per_sec: u64, interval: Duration) -> Self {
        Self {
            budget: (bits_per_sec / 8) * interval.as_millis() as u64 / 1000,
            interval,
        }
    }
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self::from_rate(300_000, Duration::from_millis(100))
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: u64,
    used: u64,
    last_used: u64,
}

// ---------------------------------------------------------------------------
// TokenBucket
// ---------------------------------------------------------------------------

/// Per-connection bandwidth policer.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    cfg: TokenBucketConfig,
    bucket: Arc<Mutex<Bucket>>,
    stats: Arc<StatsCounter>,
}

impl TokenBucket {
    pub fn new(cfg: TokenBucketConfig) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: cfg.budget,
                used: 0,
                last_used: 0,
            })),
            stats: Arc::new(StatsCounter::default()),
            cfg,
        }
    }

    pub fn tokens(&self) -> u64 {
        lock(&self.bucket).tokens
    }

    /// Restore the full budget, remembering how much of it was used.
    pub fn reset(&self) {
        let mut b = lock(&self.bucket);
        b.last_used = b.used;
        b.used = 0;
        b.tokens = self.cfg.budget;
    }
}

impl FlowPolicy for TokenBucket {
    fn admit(&self, segment: Vec<u8>) -> Admission {
        let len = segment.len() as u64;
        let verdict = {
            let mut b = lock(&self.bucket);
            if len <= b.tokens {
                b.tokens -= len;
                b.used += len;
                Admission::Admitted
            } else {
                Admission::Dropped(DropReason::BucketExhausted)
            }
        };
        self.stats.record(verdict, segment.len());
        verdict
    }

    fn status_tick(&self) -> ControlMessage {
        self.reset();
        ControlMessage::BandwidthBudget {
            budget: self.cfg.budget,
            interval_ms: self.cfg.interval.as_millis() as u64,
        }
    }

    fn status_interval(&self) -> Duration {
        self.cfg.interval
    }

    /// Bytes admitted during the last completed interval.
    fn metric(&self) -> u64 {
        lock(&self.bucket).last_used
    }

    fn stats(&self) -> PolicyStats {
        self.stats.snapshot()
    }

    fn spawn_drain(&self, _shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        // Tokens are restored by the status tick.
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// WindowPacer
// ---------------------------------------------------------------------------

/// Sender-side starting values and shaping.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowPacerConfig {
    pub initial_budget: usize,
    pub initial_cwnd: usize,
    pub initial_interval: Duration,
    pub chunk: usize,
    /// Sleep after each chunk.
    pub chunk_gap: Duration,
    pub decrease_factor: f64,
    /// Largest advertised budget the pacer will adopt.
    pub max_budget: usize,
    /// Longest advertised interval the pacer will adopt.
    pub max_interval: Duration,
}

impl Default for WindowPacerConfig {
    fn default() -> Self {
        Self {
            initial_budget: 4096,
            initial_cwnd: 4096,
            initial_interval: Duration::from_millis(100),
            chunk: 512,
            chunk_gap: Duration::from_millis(2),
            decrease_factor: 0.95,
            max_budget: 1024 * 1024,
            max_interval: Duration::from_secs(10),
        }
    }
}

/// One AIMD step at the end of an interval.
pub fn aimd(cwnd: usize, budget: usize, chunk: usize, sent: usize, decrease_factor: f64) -> usize {
    if sent >= budget {
        let cut = (cwnd as f64 * decrease_factor).round() as usize;
        cut.max(budget)
    } else {
        cwnd.saturating_add(chunk).min(budget.saturating_mul(2))
    }
}

/// Interval-shaped sender bounded by the advertised budget and its own window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowPacer {
    cfg: Arc<WindowPacerConfig>,
    pub budget: usize,
    pub cwnd: usize,
    pub interval: Duration,
}

impl WindowPacer {
    pub fn new(cfg: WindowPacerConfig) -> Self {
        Self {
            budget: cfg.initial_budget,
            cwnd: cfg.initial_cwnd,
            interval: cfg.initial_interval,
            cfg: Arc::new(cfg),
        }
    }

    pub fn config(&self) -> &WindowPacerConfig {
        &self.cfg
    }

    /// Bytes to send in the next interval.
    pub fn allowed(&self) -> usize {
        self.budget.min(self.cwnd)
    }
}

impl Default for WindowPacer {
    fn default() -> Self {
        Self::new(WindowPacerConfig::default())
    }
}

impl Pacer for WindowPacer {
    fn on_feedback(&mut self, msg: &ControlMessage) {
        let ControlMessage::BandwidthBudget {
            budget,
            interval_ms,
        } = *msg
        else {
            return;
        };
        let max_budget = self.cfg.max_budget;
        self.budget = usize::try_from(budget).map_or(max_budget, |b| b.min(max_budget));
        if interval_ms > 0 {
            self.interval = Duration::from_millis(interval_ms).min(self.cfg.max_interval);
        }
        self.cwnd = self.cwnd.max(self.budget).min(self.budget.saturating_mul(2));
    }

    fn on_round(&mut self, report: &RoundReport) {
        self.cwnd = aimd(
            self.cwnd,
            self.budget,
            self.cfg.chunk,
            report.bytes_sent,
            self.cfg.decrease_factor,
        );
    }

    fn plan_round(&self, _round: u64) -> RoundPlan {
        let chunk = self.cfg.chunk.max(1);
        let mut left = self.allowed();
        let mut writes = Vec::new();
        while left > 0 {
            let n = chunk.min(left);
            writes.push(vec![b'Z'; n]);
            left -= n;
        }
        RoundPlan {
            writes,
            gap: self.cfg.chunk_gap,
            pause: Pause::After(self.interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(budget: u64) -> TokenBucket {
        TokenBucket::new(TokenBucketConfig {
            budget,
            interval: Duration::from_millis(100),
        })
    }

    #[test]
    fn default_budget_from_rate() {
        assert_eq!(TokenBucketConfig::default().budget, 3750);
    }

    #[test]
    fn oversized_segment_is_dropped_whole() {
        let b = bucket(4096);
        assert_eq!(
            b.admit(vec![0; 5000]),
            Admission::Dropped(DropReason::BucketExhausted)
        );
        assert_eq!(b.tokens(), 4096);
    }

    #[test]
    fn segments_consume_tokens() {
        let b = bucket(4096);
        assert!(b.admit(vec![0; 2000]).is_admitted());
        assert!(b.admit(vec![0; 2000]).is_admitted());
        assert_eq!(b.tokens(), 96);
        assert!(!b.admit(vec![0; 97]).is_admitted());
        assert!(b.admit(vec![0; 96]).is_admitted());
        assert_eq!(b.tokens(), 0);
    }

    #[test]
    fn status_tick_resets_and_reports_usage() {
        let b = bucket(4096);
        b.admit(vec![0; 3000]);
        assert_eq!(b.metric(), 0);
        assert_eq!(
            b.status_tick(),
            ControlMessage::BandwidthBudget {
                budget: 4096,
                interval_ms: 100
            }
        );
        assert_eq!(b.tokens(), 4096);
        assert_eq!(b.metric(), 3000);
    }

    #[test]
    fn aimd_saturated_cuts_window() {
        assert_eq!(aimd(8000, 4096, 512, 4096, 0.95), 7600);
        assert_eq!(aimd(4100, 4096, 512, 4096, 0.95), 4096);
    }

    #[test]
    fn aimd_unsaturated_grows_to_cap() {
        assert_eq!(aimd(4096, 4096, 512, 2000, 0.95), 4608);
        assert_eq!(aimd(8000, 4096, 512, 2000, 0.95), 8192);
    }

    #[test]
    fn feedback_rebounds_window() {
        let mut p = WindowPacer::default();
        p.cwnd = 9000;
        p.on_feedback(&ControlMessage::BandwidthBudget {
            budget: 3750,
            interval_ms: 50,
        });
        assert_eq!(p.budget, 3750);
        assert_eq!(p.cwnd, 7500);
        assert_eq!(p.interval, Duration::from_millis(50));

        p.cwnd = 100;
        p.on_feedback(&ControlMessage::BandwidthBudget {
            budget: 3750,
            interval_ms: 50,
        });
        assert_eq!(p.cwnd, 3750);
    }

    #[test]
    fn plan_splits_allowance_into_chunks() {
        let mut p = WindowPacer::default();
        p.budget = 1300;
        p.cwnd = 2000;
        let plan = p.plan_round(0);
        let sizes: Vec<usize> = plan.writes.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![512, 512, 276]);
        assert_eq!(plan.gap, Duration::from_millis(2));
        assert_eq!(plan.pause, Pause::After(Duration::from_millis(100)));
    }

    #[test]
    fn oversized_advertisement_is_capped() {
        let mut p = WindowPacer::default();
        p.on_feedback(&ControlMessage::BandwidthBudget {
            budget: u64::MAX,
            interval_ms: u64::MAX,
        });
        let cfg = p.config().clone();
        assert_eq!(p.budget, cfg.max_budget);
        assert_eq!(p.cwnd, cfg.max_budget);
        assert_eq!(p.interval, cfg.max_interval);

        let plan = p.plan_round(0);
        let total: usize = plan.writes.iter().map(Vec::len).sum();
        assert_eq!(total, cfg.max_budget);

        p.on_round(&RoundReport {
            bytes_sent: 0,
            latencies: vec![],
        });
        assert_eq!(p.cwnd, cfg.max_budget + cfg.chunk);
    }

    #[test]
    fn aimd_saturates_instead_of_overflowing() {
        assert_eq!(aimd(usize::MAX - 10, usize::MAX, 512, 0, 0.95), usize::MAX);
    }

    #[test]
    fn round_report_drives_aimd() {
        let mut p = WindowPacer::default();
        p.cwnd = 8000;
        p.on_round(&RoundReport {
            bytes_sent: 4096,
            latencies: vec![],
        });
        assert_eq!(p.cwnd, 7600);
    }
}
