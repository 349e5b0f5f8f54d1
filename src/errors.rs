//! Error types for ackline operations
//!
//! Every failure that has a waiting caller is returned to that caller as a
//! [`PublishError`] value. Failures with nobody waiting (abandoned
//! confirmations) are described by [`AbandonReason`] and only ever logged
//! and counted.

use std::path::PathBuf;

use thiserror::Error;

use crate::contracts::SendId;

/// Result type alias for publish operations
pub type Result<T> = std::result::Result<T, PublishError>;

/// Outcome of a `publish` call that did not end in an acknowledgment
#[derive(Debug, Error)]
pub enum PublishError {
    /// The transport refused the message; nothing is tracked.
    #[error("transport rejected message: {0}")]
    TransportRejected(#[from] TransportError),

    /// The message was sent, but the registration table was full so its
    /// outcome is not tracked.
    #[error("message {send_id} sent untracked: no tracking capacity")]
    NoTrackingCapacity { send_id: SendId },

    /// No confirmation arrived before the registration deadline.
    #[error("message {send_id} timed out waiting for confirmation")]
    TimedOut { send_id: SendId },

    /// The transport handed out an identifier that is still outstanding.
    #[error("send id {send_id} is already registered")]
    DuplicateSendId { send_id: SendId },

    /// The hard ceiling elapsed before the reconciliation loop resolved
    /// the registration.
    #[error("message {send_id} was not resolved before the hard ceiling")]
    Stalled { send_id: SendId },

    /// The tracker was shut down while the caller was waiting.
    #[error("publish tracker is stopped")]
    TrackerStopped,

    /// A record could not be encoded into a payload.
    #[error("record encoding failed: {0}")]
    Encode(#[from] RecordError),
}

impl PublishError {
    /// Identifier of the message this error refers to, if it was sent.
    pub fn send_id(&self) -> Option<SendId> {
        match self {
            Self::NoTrackingCapacity { send_id }
            | Self::TimedOut { send_id }
            | Self::DuplicateSendId { send_id }
            | Self::Stalled { send_id } => Some(*send_id),
            Self::TransportRejected(_) | Self::TrackerStopped | Self::Encode(_) => None,
        }
    }
}

/// Send failure reported by a [`Transport`](crate::transport::Transport)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is disconnected")]
    Disconnected,

    #[error("payload too large: {size} bytes, limit {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Why a registration could not be created
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("registration table full ({capacity} slots)")]
    Full { capacity: usize },

    #[error("send id {0} already has an active registration")]
    Duplicate(SendId),
}

/// The replay buffer had no free slot for a new entry
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("replay buffer full ({capacity} slots)")]
pub struct ReplayFull {
    pub capacity: usize,
}

/// Why an orphaned confirmation was permanently dropped
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AbandonReason {
    #[error("replay budget exhausted after {attempts} re-announcements")]
    RetriesExhausted { attempts: u32 },

    #[error("no replay capacity")]
    NoReplayCapacity,
}

/// Failure pushing an event into the confirmation feed
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("confirmation feed is full")]
    Full,

    #[error("confirmation feed is closed")]
    Closed,
}

/// Invalid or unreadable tracker configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("hard ceiling {ceiling_ms} ms is below timeout plus sweep period ({minimum_ms} ms)")]
    CeilingTooShort { ceiling_ms: u128, minimum_ms: u128 },

    #[error("{field} exceeds the {limit_secs} s limit")]
    DurationTooLarge {
        field: &'static str,
        limit_secs: u64,
    },

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Sensor record decoding or encoding failure
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("invalid record length: expected {expected}, received {received}")]
    InvalidLength { expected: usize, received: usize },

    #[error("chunk holds no readings")]
    EmptyChunk,

    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}
