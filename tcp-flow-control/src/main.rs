//! Entry point for `tcp-flow-control`.
//!
//! Parses CLI arguments and dispatches into either **receiver** or **sender**
//! mode for one of the three flow-control cases.  All protocol work is
//! delegated to library modules; `main.rs` owns only process setup (logging,
//! argument parsing, metric log lifetime).

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tcp_flow_control::metrics_log::MetricLog;
use tcp_flow_control::policy::FlowPolicy;
use tcp_flow_control::receiver::{Receiver, ReceiverConfig};
use tcp_flow_control::red::{QueuePacer, RedConfig, RedQueue};
use tcp_flow_control::sender::{self, RunLength, SenderConfig};
use tcp_flow_control::token_bucket::{TokenBucket, TokenBucketConfig, WindowPacer};
use tcp_flow_control::watermark::{WatermarkConfig, WatermarkController, WatermarkPacer};
use tcp_flow_control::FramingMode;

/// Feedback-driven flow control over one TCP stream.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept connections and police them with the chosen policy.
    Receiver {
        #[command(flatten)]
        common: Common,
        /// Local address to bind (defaults to 127.0.0.1:<case port>).
        #[arg(short, long)]
        bind: Option<String>,
        /// CSV file for the per-second metric log.
        #[arg(long)]
        log_file: Option<PathBuf>,
        /// Exit after the first connection closes.
        #[arg(long)]
        once: bool,
    },
    /// Connect and send with adaptive pacing.
    Sender {
        #[command(flatten)]
        common: Common,
        /// Receiver address (defaults to 127.0.0.1:<case port>).
        #[arg(short, long)]
        server: Option<String>,
        /// Number of frames to send (watermark case).
        #[arg(long, default_value_t = 2000)]
        frames: u64,
        /// Run length in seconds (red and token-bucket cases).
        #[arg(long, default_value_t = 12)]
        seconds: u64,
    },
}

#[derive(Args)]
struct Common {
    #[arg(short, long, value_enum)]
    case: Case,
    #[arg(long, value_enum, default_value_t = FramingMode::Tagged)]
    framing: FramingMode,
}

#[derive(Clone, Copy, ValueEnum)]
enum Case {
    /// Case 1: buffer watermarks.
    Watermark,
    /// Case 2: RED queue with a worker pool.
    Red,
    /// Case 3: token-bucket bandwidth cap.
    TokenBucket,
}

impl Case {
    fn default_port(self) -> u16 {
        match self {
            Case::Watermark => 5000,
            Case::Red => 5001,
            Case::TokenBucket => 5002,
        }
    }

    fn read_size(self) -> usize {
        match self {
            Case::Watermark => 8192,
            Case::Red | Case::TokenBucket => 4096,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Set RUST_LOG to control verbosity.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Receiver {
            common,
            bind,
            log_file,
            once,
        } => {
            let addr = bind.unwrap_or_else(|| format!("127.0.0.1:{}", common.case.default_port()));
            let cfg = ReceiverConfig {
                framing: common.framing,
                read_size: common.case.read_size(),
            };
            match common.case {
                Case::Watermark => {
                    serve(&addr, cfg, log_file, once, ctrl_c(), || {
                        WatermarkController::new(WatermarkConfig::default())
                    })
                    .await
                }
                Case::Red => {
                    serve(&addr, cfg, log_file, once, ctrl_c(), || {
                        RedQueue::new(RedConfig::default())
                    })
                    .await
                }
                Case::TokenBucket => {
                    serve(&addr, cfg, log_file, once, ctrl_c(), || {
                        TokenBucket::new(TokenBucketConfig::default())
                    })
                    .await
                }
            }
        }
        Mode::Sender {
            common,
            server,
            frames,
            seconds,
        } => {
            let addr = server.unwrap_or_else(|| format!("127.0.0.1:{}", common.case.default_port()));
            let mut cfg = SenderConfig {
                framing: common.framing,
                ..SenderConfig::default()
            };
            match common.case {
                Case::Watermark => {
                    cfg.run = RunLength::Rounds(frames);
                    cfg.progress_every = 200;
                    let summary = sender::run(&addr, &cfg, WatermarkPacer::default()).await?;
                    log::info!("[tx] final pacing: {:?}", summary.final_pacing);
                }
                Case::Red => {
                    cfg.run = RunLength::For(Duration::from_secs(seconds));
                    cfg.progress_every = 50;
                    let summary = sender::run(&addr, &cfg, QueuePacer::default()).await?;
                    log::info!("[tx] final pacing: {:?}", summary.final_pacing);
                }
                Case::TokenBucket => {
                    cfg.run = RunLength::For(Duration::from_secs(seconds));
                    cfg.progress_every = 10;
                    let summary = sender::run(&addr, &cfg, WindowPacer::default()).await?;
                    log::info!("[tx] final pacing: {:?}", summary.final_pacing);
                }
            }
            Ok(())
        }
    }
}

/// Resolves on the first Ctrl-C.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

/// Serve until `once` completes, accepting fails, or `shutdown` resolves;
/// the metric log is stopped and flushed in every case.
async fn serve<P, F>(
    addr: &str,
    cfg: ReceiverConfig,
    log_file: Option<PathBuf>,
    once: bool,
    shutdown: impl Future<Output = ()>,
    make_policy: F,
) -> anyhow::Result<()>
where
    P: FlowPolicy,
    F: Fn() -> P,
{
    let mut receiver = Receiver::bind(addr, cfg, make_policy)
        .await
        .with_context(|| format!("binding {addr}"))?;
    log::info!("[rx] listening on {}", receiver.local_addr()?);

    let metrics = match log_file {
        Some(path) => {
            let (log, task) = MetricLog::start(&path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            receiver = receiver.with_metrics(log.clone());
            Some((log, task))
        }
        None => None,
    };

    let serving = async {
        if once {
            receiver.serve_one().await.map(|_| ())
        } else {
            receiver.run().await
        }
    };
    let result = tokio::select! {
        r = serving => r,
        _ = shutdown => {
            log::info!("[rx] shutting down");
            Ok(())
        }
    };

    if let Some((log, task)) = metrics {
        let rows = task.stop().await?;
        log::info!("[metrics] wrote {rows} rows to {}", log.path().display());
    }
    Ok(result?)
}
