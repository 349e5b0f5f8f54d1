//! Core data structures shared by the tracker components
//!
//! Live confirmations from the transport and delayed re-announcements from
//! the replay buffer travel as the same [`Confirmation`] type, so the
//! reconciliation loop matches both with one code path.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Opaque identifier assigned by the transport when a message is accepted
/// for sending.
///
/// Unique among currently outstanding sends only; the transport may reuse
/// an identifier once its previous message is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SendId(pub u32);

impl fmt::Display for SendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for SendId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Where a confirmation event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOrigin {
    /// Delivery report from the transport.
    Transport,
    /// Re-announcement of an orphaned confirmation by the replay scheduler.
    Replay,
}

/// A "delivery confirmed" event for one send identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub send_id: SendId,

    /// Number of re-announcements already performed for this event.
    /// Always zero for transport confirmations.
    pub replays: u32,

    pub origin: ConfirmationOrigin,
}

impl Confirmation {
    /// Confirmation as reported by the transport
    pub fn delivered(send_id: SendId) -> Self {
        Self {
            send_id,
            replays: 0,
            origin: ConfirmationOrigin::Transport,
        }
    }

    /// Re-announcement carrying the accumulated replay count
    pub fn replayed(send_id: SendId, replays: u32) -> Self {
        Self {
            send_id,
            replays,
            origin: ConfirmationOrigin::Replay,
        }
    }

    pub fn is_replay(&self) -> bool {
        self.origin == ConfirmationOrigin::Replay
    }
}

/// Terminal result delivered to exactly one waiting caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acknowledged,
    TimedOut,
}

/// Successful publish: the message was confirmed before its deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub send_id: SendId,

    /// Time from handing the payload to the transport until the
    /// acknowledgment reached the caller.
    pub elapsed: Duration,
}
