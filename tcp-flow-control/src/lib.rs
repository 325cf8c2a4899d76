//! `tcp-flow-control`: feedback-driven flow and congestion control over a
//! single TCP byte stream.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐      data frames       ┌──────────────┐
//!  │    Sender    │───────────────────────▶│   Receiver   │
//!  │  send loop   │                        │  read loop   │──▶ FlowPolicy
//!  │      ▲       │     control frames     │              │      │
//!  │ pacing task ◀┼────────────────────────┼─ status task ◀──────┘
//!  └──────────────┘   (same TCP stream)    └──────────────┘
//! ```
//!
//! Three cases plug into the same harness:
//!
//! | case | receiver policy                         | sender pacer            |
//! |------|-----------------------------------------|-------------------------|
//! | 1    | [`watermark::WatermarkController`]      | [`watermark::WatermarkPacer`] |
//! | 2    | [`red::RedQueue`] + worker pool         | [`red::QueuePacer`]     |
//! | 3    | [`token_bucket::TokenBucket`]           | [`token_bucket::WindowPacer`] |
//!
//! Each module has a single responsibility:
//! - [`control`]       : control message schema
//! - [`codec`]         : frame model and tagged framing
//! - [`marker`]        : legacy inline-marker framing
//! - [`socket`]        : framed TCP halves
//! - [`policy`]        : receiver-side policy contract
//! - [`pacing`]        : sender-side pacer contract and pacing task
//! - [`watermark`], [`red`], [`token_bucket`] : the three cases
//! - [`receiver`]      : accept/read/status harness
//! - [`sender`]        : send loop and control listener
//! - [`metrics_log`]   : periodic CSV metric log

pub mod codec;
pub mod control;
pub mod marker;
pub mod metrics_log;
pub mod pacing;
pub mod policy;
pub mod receiver;
pub mod red;
pub mod sender;
pub mod socket;
pub mod token_bucket;
pub mod watermark;

pub use codec::{Frame, FramingMode};
pub use control::{ControlMessage, Level};
pub use socket::SocketError;
