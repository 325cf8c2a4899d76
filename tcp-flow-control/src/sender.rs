//! Sender harness: paced data loop plus control listener.
//!
//! ```text
//!            ┌──────────────── TCP stream ────────────────┐
//!   send loop ──Data──▶                      ◀──Control── control listener
//!       │  ▲                                                    │
//!       │  └── snapshot (watch) ── pacing task ◀── Feedback ────┘
//!       └──────────── Round report ──────────▶
//! ```
//!
//! The send loop plans each round from the latest pacing snapshot, writes
//! it, reports the outcome, and pauses.  The listener polls the read half
//! with a short timeout so it can notice shutdown between frames; a timeout
//! just means no feedback has arrived yet.

use std::time::Duration;

use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};

use crate::codec::{Frame, FramingMode};
use crate::pacing::{spawn_pacing, Pacer, PacingEvent, RoundReport};
use crate::socket::{self, FrameReader, SocketError};

/// How long a run lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLength {
    /// Stop after this many rounds.
    Rounds(u64),
    /// Stop starting new rounds after this long.
    For(Duration),
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub framing: FramingMode,
    pub read_size: usize,
    /// Read timeout of the control listener.
    pub listen_timeout: Duration,
    pub run: RunLength,
    /// Log progress every this many rounds (0 disables).
    pub progress_every: u64,
    /// Keep the pacing snapshot of every round in [`SendSummary::pacing_trace`].
    pub record_trace: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            framing: FramingMode::Tagged,
            read_size: 4096,
            listen_timeout: Duration::from_millis(50),
            run: RunLength::For(Duration::from_secs(12)),
            progress_every: 0,
            record_trace: false,
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct SendSummary<P> {
    pub rounds: u64,
    pub writes: u64,
    pub bytes_sent: u64,
    /// Control messages handed to the pacing task.
    pub feedback: u64,
    /// Control frames that could not be parsed.
    pub malformed: u64,
    /// The receiver closed its side before the run finished.
    pub peer_closed: bool,
    /// Set when the run ended on a socket error.
    pub error: Option<String>,
    /// Pacing snapshot each round was planned from; empty unless
    /// [`SenderConfig::record_trace`] is set.
    pub pacing_trace: Vec<P>,
    pub final_pacing: P,
}

#[derive(Debug, Default)]
struct ListenerStats {
    feedback: u64,
    malformed: u64,
    peer_closed: bool,
}

/// Connect to `addr` and run `pacer` until the configured length elapses or
/// the connection fails.
///
/// Only the initial connect is reported as `Err`; a failure mid-run ends the
/// run and is recorded in [`SendSummary::error`].
pub async fn run<P: Pacer>(
    addr: impl ToSocketAddrs,
    cfg: &SenderConfig,
    pacer: P,
) -> Result<SendSummary<P>, SocketError> {
    let stream = TcpStream::connect(addr).await?;
    let (reader, mut writer) = socket::split(stream, cfg.framing, cfg.read_size);
    log::info!("[tx] connected to {}", reader.peer_addr()?);

    let (events, mut snapshots, pacing) = spawn_pacing(pacer);
    let (stop_tx, stop_rx) = watch::channel(false);
    let listener = tokio::spawn(control_listener(
        reader,
        events.clone(),
        cfg.listen_timeout,
        stop_rx,
    ));

    let deadline = match cfg.run {
        RunLength::For(d) => Some(Instant::now() + d),
        RunLength::Rounds(_) => None,
    };
    let mut round = 0u64;
    let mut writes = 0u64;
    let mut bytes_sent = 0u64;
    let mut error = None;
    let mut pacing_trace = Vec::new();

    'rounds: loop {
        let done = match cfg.run {
            RunLength::Rounds(n) => round >= n,
            RunLength::For(_) => deadline.is_some_and(|d| Instant::now() >= d),
        };
        if done {
            break;
        }

        let snapshot = snapshots.borrow_and_update().clone();
        let plan = snapshot.plan_round(round);
        if cfg.record_trace {
            pacing_trace.push(snapshot);
        }

        let started = Instant::now();
        let mut report = RoundReport::default();
        for payload in &plan.writes {
            let t0 = Instant::now();
            if let Err(e) = writer.send_data(payload).await {
                log::warn!("[tx] send error: {e}");
                error = Some(e.to_string());
                break 'rounds;
            }
            report.latencies.push(t0.elapsed());
            report.bytes_sent += payload.len();
            writes += 1;
            if !plan.gap.is_zero() {
                tokio::time::sleep(plan.gap).await;
            }
        }
        bytes_sent += report.bytes_sent as u64;
        round += 1;

        if events.send(PacingEvent::Round(report)).await.is_err() {
            log::warn!("[tx] pacing task stopped early");
            break;
        }
        if cfg.progress_every > 0 && round % cfg.progress_every == 0 {
            log::info!(
                "[tx] round={round} writes={writes} bytes={bytes_sent} pacing={:?}",
                &*snapshots.borrow()
            );
        }

        let pause = plan.pause.remaining(started.elapsed());
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }

    if let Err(e) = writer.shutdown().await {
        log::debug!("[tx] shutdown: {e}");
    }
    stop_tx.send_replace(true);
    let stats = listener.await.unwrap_or_else(|e| {
        log::warn!("[tx] control listener failed: {e}");
        ListenerStats::default()
    });

    drop(events);
    let final_pacing = match pacing.await {
        Ok(p) => p,
        Err(e) => {
            log::warn!("[tx] pacing task failed: {e}");
            snapshots.borrow().clone()
        }
    };

    log::info!("[tx] done: rounds={round} writes={writes} bytes={bytes_sent} feedback={}", stats.feedback);
    Ok(SendSummary {
        rounds: round,
        writes,
        bytes_sent,
        feedback: stats.feedback,
        malformed: stats.malformed,
        peer_closed: stats.peer_closed,
        error,
        pacing_trace,
        final_pacing,
    })
}

/// Decode feedback and forward it to the pacing task.
async fn control_listener(
    mut reader: FrameReader,
    events: mpsc::Sender<PacingEvent>,
    poll: Duration,
    stop: watch::Receiver<bool>,
) -> ListenerStats {
    let mut feedback = 0u64;
    let mut peer_closed = false;
    loop {
        if *stop.borrow() {
            break;
        }
        match timeout(poll, reader.next_frame()).await {
            Err(_elapsed) => continue,
            Ok(Ok(Some(Frame::Control(msg)))) => {
                match msg.level() {
                    Some(level) => log::debug!("[tx] ← feedback {level}"),
                    None => log::trace!("[tx] ← {msg:?}"),
                }
                if events.send(PacingEvent::Feedback(msg)).await.is_err() {
                    break;
                }
                feedback += 1;
            }
            Ok(Ok(Some(Frame::Data(d)))) => {
                log::debug!("[tx] ignoring {} data bytes from receiver", d.len());
            }
            Ok(Ok(None)) => {
                log::debug!("[tx] receiver closed the stream");
                peer_closed = true;
                break;
            }
            Ok(Err(e)) => {
                log::warn!("[tx] control stream error: {e}");
                break;
            }
        }
    }
    ListenerStats {
        feedback,
        malformed: reader.malformed(),
        peer_closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watermark::WatermarkPacer;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_failure_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let res = run(addr, &SenderConfig::default(), WatermarkPacer::default()).await;
        assert!(matches!(res, Err(SocketError::Io(_))));
    }

    #[tokio::test]
    async fn stops_after_requested_rounds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, _writer) = socket::split(stream, FramingMode::Tagged, 4096);
            let mut frames = Vec::new();
            while let Some(frame) = reader.next_frame().await.unwrap() {
                frames.push(frame);
            }
            frames
        });

        let cfg = SenderConfig {
            run: RunLength::Rounds(5),
            listen_timeout: Duration::from_millis(5),
            ..SenderConfig::default()
        };
        let summary = run(addr, &cfg, WatermarkPacer::default()).await.unwrap();
        assert_eq!(summary.rounds, 5);
        assert_eq!(summary.writes, 5);
        assert_eq!(summary.bytes_sent, 5 * 1024);
        assert_eq!(summary.feedback, 0);
        assert!(summary.error.is_none());
        assert_eq!(summary.final_pacing, WatermarkPacer::default());
        assert!(summary.pacing_trace.is_empty());

        let frames = server.await.unwrap();
        assert_eq!(frames.len(), 5);
        for (i, frame) in frames.iter().enumerate() {
            let Frame::Data(d) = frame else {
                panic!("unexpected control frame");
            };
            assert!(d.starts_with(format!("PKT{i:06}").as_bytes()));
        }
    }

    #[tokio::test]
    async fn trace_is_kept_only_when_requested() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, _writer) = socket::split(stream, FramingMode::Tagged, 4096);
            while reader.next_frame().await.unwrap().is_some() {}
        });

        let cfg = SenderConfig {
            run: RunLength::Rounds(3),
            listen_timeout: Duration::from_millis(5),
            record_trace: true,
            ..SenderConfig::default()
        };
        let summary = run(addr, &cfg, WatermarkPacer::default()).await.unwrap();
        assert_eq!(summary.pacing_trace.len(), 3);
        server.await.unwrap();
    }
}
