//! Ackline Core - publish-acknowledgment tracking with bounded replay
//!
//! **Creator**: Shayan Golmezerji
//! **License**: Creative Commons Attribution 4.0 International (CC BY 4.0)
//!
//! This library sits between a producer of outbound sensor messages and a
//! publish-and-forget transport that only reports "accepted for send" and,
//! later and unordered, "delivery confirmed". A producing task publishes a
//! message and learns whether that specific message was confirmed within a
//! bound.
//!
//! # Design Principles
//! - Fixed-capacity tables; a full table is an explicit outcome, never growth
//! - One lock per table, held only across scan-and-mutate
//! - Orphaned confirmations are replayed a bounded number of times through
//!   the same path as live ones
//! - Failures with a waiting caller are returned as values; failures without
//!   one are logged and counted

pub mod config;
pub mod contracts;
pub mod errors;
pub mod feed;
pub mod metrics;
pub mod reconciler;
pub mod records;
pub mod registration;
pub mod replay;
pub mod telemetry;
pub mod tracker;
pub mod transport;

pub use config::TrackerConfig;
pub use contracts::{Confirmation, ConfirmationOrigin, Delivery, Outcome, SendId};
pub use errors::{AbandonReason, PublishError, Result, TransportError};
pub use feed::{ConfirmationFeed, ConfirmationSender};
pub use metrics::MetricsSnapshot;
pub use records::{Record, TraceChunk, UwbPacket};
pub use tracker::PublishTracker;
pub use transport::{LoopbackBroker, LoopbackConfig, Transport};

/// Concurrent callers that can wait on an outcome
pub const REGISTRATION_CAPACITY: usize = 16;

/// Orphaned confirmations that can await re-announcement
pub const REPLAY_CAPACITY: usize = 16;

/// Per-publish confirmation timeout in milliseconds
pub const PUBLISH_TIMEOUT_MS: u64 = 1000;

/// Delay before an orphaned confirmation is re-announced
pub const REPLAY_DELAY_MS: u64 = 500;

/// Re-announcements of one orphaned confirmation before it is abandoned
pub const MAX_REPLAYS: u32 = 2;

/// Longest wait of the reconciliation loop between expiry sweeps
pub const SWEEP_PERIOD_MS: u64 = 75;

/// Replay scheduler tick
pub const REPLAY_PERIOD_MS: u64 = 25;

/// Depth of the confirmation queue
pub const FEED_DEPTH: usize = 5;

/// Last-resort unblock for a publish whose registration is never resolved
pub const HARD_CEILING_MS: u64 = 5000;

/// Maximum payload size (in bytes) accepted by the loopback broker
pub const MAX_PAYLOAD_SIZE: usize = 4096;
