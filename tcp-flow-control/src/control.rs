//! Control messages exchanged from receiver to sender.
//!
//! A [`ControlMessage`] is produced by a receiver's periodic status task,
//! travels in-band on the same TCP stream as application data (see
//! [`crate::codec`]), and is applied by the sender's pacing task.
//!
//! The JSON body is kept wire-compatible with the line-oriented peers:
//!
//! ```text
//! {"type":"buffer_status","buffer":190000,"level":"SLOW"}
//! {"type":"queue","qlen":412,"level":"OK"}
//! {"type":"bw","budget":3750,"interval_ms":100}
//! ```

use serde::{Deserialize, Serialize};

/// Three-level congestion signal carried by occupancy-style feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    /// Hold the current rate.
    Ok,
    /// Receiver is congested; back off.
    Slow,
    /// Receiver has headroom; speed up.
    Fast,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Ok => write!(f, "OK"),
            Level::Slow => write!(f, "SLOW"),
            Level::Fast => write!(f, "FAST"),
        }
    }
}

/// Feedback broadcast by a receiver policy engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Watermark controller occupancy report.
    #[serde(rename = "buffer_status")]
    BufferStatus {
        #[serde(rename = "buffer")]
        occupancy: u64,
        level: Level,
    },
    /// RED queue length report.
    #[serde(rename = "queue")]
    QueueStatus {
        #[serde(rename = "qlen")]
        length: u64,
        level: Level,
    },
    /// Token-bucket budget for the next interval.
    #[serde(rename = "bw")]
    BandwidthBudget { budget: u64, interval_ms: u64 },
}

impl ControlMessage {
    /// Serialise the message body as compact JSON.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a JSON body.  Callers treat failures as malformed frames.
    pub fn from_json(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// The congestion level, for the occupancy-style variants.
    pub fn level(&self) -> Option<Level> {
        match self {
            Self::BufferStatus { level, .. } | Self::QueueStatus { level, .. } => Some(*level),
            Self::BandwidthBudget { .. } => None,
        }
    }
}
