//! Receiver harness: accept, demultiplex, police, report.
//!
//! [`Receiver`] accepts one connection at a time.  For each connection it
//! builds a fresh [`FlowPolicy`] engine and runs three kinds of work:
//!
//! ```text
//!   socket ──▶ read loop ──Data──▶ policy.admit() ──▶ metric log
//!                                     ▲
//!              drain task(s) ─────────┤
//!                                     │
//!   socket ◀── status task ◀── policy.status_tick()   (every interval)
//! ```
//!
//! The connection ends when the peer closes its side or the socket fails;
//! either way the drain and status tasks are stopped and the engine dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::codec::{Frame, FramingMode};
use crate::metrics_log::MetricLog;
use crate::policy::{FlowPolicy, PolicyStats};
use crate::socket::{self, FrameWriter, SocketError};

/// Connection-level knobs shared by every case.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub framing: FramingMode,
    /// Bytes requested per socket read.
    pub read_size: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            framing: FramingMode::Tagged,
            read_size: 4096,
        }
    }
}

/// What happened on one connection.
#[derive(Debug, Clone)]
pub struct ConnectionSummary {
    pub peer: SocketAddr,
    pub stats: PolicyStats,
    /// Control frames from the peer that could not be parsed.
    pub malformed: u64,
    pub status_sent: u64,
    /// Set when the connection ended on a socket error rather than EOF.
    pub error: Option<String>,
}

/// Listening endpoint running one [`FlowPolicy`] per connection.
pub struct Receiver<F> {
    listener: TcpListener,
    cfg: ReceiverConfig,
    make_policy: F,
    metrics: Option<MetricLog>,
}

impl<P, F> Receiver<F>
where
    P: FlowPolicy,
    F: Fn() -> P,
{
    pub async fn bind(
        addr: impl ToSocketAddrs,
        cfg: ReceiverConfig,
        make_policy: F,
    ) -> Result<Self, SocketError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            cfg,
            make_policy,
            metrics: None,
        })
    }

    /// Forward the engine's metric to `log`.
    pub fn with_metrics(mut self, log: MetricLog) -> Self {
        self.metrics = Some(log);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept a single connection and serve it to completion.
    pub async fn serve_one(&self) -> Result<ConnectionSummary, SocketError> {
        let (stream, peer) = self.listener.accept().await?;
        log::info!("[rx] client {peer} connected");
        let policy = Arc::new((self.make_policy)());
        let summary = serve_connection(stream, peer, policy, &self.cfg, self.metrics.clone()).await;
        log::info!(
            "[rx] client {peer} closed: admitted {} seg / {} B, dropped {} seg / {} B, {} status sent",
            summary.stats.admitted_segments,
            summary.stats.admitted_bytes,
            summary.stats.dropped_segments,
            summary.stats.dropped_bytes,
            summary.status_sent,
        );
        Ok(summary)
    }

    /// Serve connections one after another until accepting fails.
    pub async fn run(&self) -> Result<(), SocketError> {
        loop {
            self.serve_one().await?;
        }
    }
}

async fn serve_connection<P: FlowPolicy>(
    stream: TcpStream,
    peer: SocketAddr,
    policy: Arc<P>,
    cfg: &ReceiverConfig,
    metrics: Option<MetricLog>,
) -> ConnectionSummary {
    let (mut reader, writer) = socket::split(stream, cfg.framing, cfg.read_size);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let drains = policy.spawn_drain(shutdown_rx.clone());
    let status = spawn_status(policy.clone(), writer, metrics.clone(), shutdown_rx);

    let mut error = None;
    loop {
        match reader.next_frame().await {
            Ok(Some(Frame::Data(segment))) => {
                policy.admit(segment);
                if let Some(m) = &metrics {
                    m.update_buffer_size(policy.metric());
                }
            }
            Ok(Some(Frame::Control(msg))) => {
                log::debug!("[rx] ignoring control frame from sender: {msg:?}");
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("[rx] connection error from {peer}: {e}");
                error = Some(e.to_string());
                break;
            }
        }
    }

    shutdown_tx.send_replace(true);
    let status_sent = status.await.unwrap_or_else(|e| {
        log::warn!("[rx] status task failed: {e}");
        0
    });
    for drain in drains {
        if let Err(e) = drain.await {
            log::warn!("[rx] drain task failed: {e}");
        }
    }

    ConnectionSummary {
        peer,
        stats: policy.stats(),
        malformed: reader.malformed(),
        status_sent,
        error,
    }
}

/// Broadcast status every interval until shutdown or a write fails.
fn spawn_status<P: FlowPolicy>(
    policy: Arc<P>,
    mut writer: FrameWriter,
    metrics: Option<MetricLog>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let period = policy.status_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sent = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let msg = policy.status_tick();
            if let Some(m) = &metrics {
                m.update_buffer_size(policy.metric());
            }
            if let Err(e) = writer.send_control(&msg).await {
                log::debug!("[rx] status send failed, stopping: {e}");
                break;
            }
            sent += 1;
            log::trace!("[rx] → {msg:?}");
        }
        sent
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlMessage;
    use crate::token_bucket::{TokenBucket, TokenBucketConfig};
    use std::time::Duration;

    #[tokio::test]
    async fn polices_data_and_broadcasts_status() {
        let cfg = TokenBucketConfig {
            budget: 4096,
            interval: Duration::from_millis(20),
        };
        let rx = Receiver::bind("127.0.0.1:0", ReceiverConfig::default(), move || {
            TokenBucket::new(cfg.clone())
        })
        .await
        .unwrap();
        let addr = rx.local_addr().unwrap();
        let server = tokio::spawn(async move { rx.serve_one().await });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut reader, mut writer) = socket::split(stream, FramingMode::Tagged, 1024);
        writer.send_data(&[0u8; 5000]).await.unwrap();

        // Wait for at least one budget broadcast before closing.
        let first = reader.next_frame().await.unwrap();
        assert_eq!(
            first,
            Some(Frame::Control(ControlMessage::BandwidthBudget {
                budget: 4096,
                interval_ms: 20
            }))
        );
        writer.shutdown().await.unwrap();
        while reader.next_frame().await.unwrap().is_some() {}

        let summary = server.await.unwrap().unwrap();
        assert_eq!(summary.stats.dropped_segments, 1);
        assert_eq!(summary.stats.dropped_bytes, 5000);
        assert!(summary.status_sent >= 1);
        assert!(summary.error.is_none());
    }
}
