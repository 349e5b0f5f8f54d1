//! Registration table - callers waiting on one outstanding send each
//!
//! A fixed array of slots behind one mutex. The scan for a slot and the
//! delivery on that slot's channel happen under the same lock, so a
//! registration can never be resolved twice and a resolution can never be
//! lost between the scan and the send.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::contracts::{Outcome, SendId};
use crate::errors::RegisterError;

// Stand-in for "never" when a deadline would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + after`, saturating instead of overflowing
pub(crate) fn deadline_after(now: Instant, after: Duration) -> Instant {
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// One occupied slot
#[derive(Debug)]
struct Registration {
    send_id: SendId,
    deadline: Instant,
    notify: oneshot::Sender<Outcome>,
}

/// How a caller's wait on its [`RegistrationHandle`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The reconciliation loop delivered an outcome.
    Resolved(Outcome),
    /// The hard ceiling elapsed first.
    CeilingElapsed,
    /// The slot was released without an outcome (tracker shut down).
    Released,
}

/// Caller side of a registration: the receiving end of its private
/// single-use channel
#[derive(Debug)]
pub struct RegistrationHandle {
    send_id: SendId,
    slot: usize,
    deadline: Instant,
    outcome: oneshot::Receiver<Outcome>,
}

impl RegistrationHandle {
    pub fn send_id(&self) -> SendId {
        self.send_id
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Non-blocking check for a delivered outcome
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        self.outcome.try_recv().ok()
    }

    /// Block until an outcome arrives or `ceiling` elapses
    ///
    /// Consumes the handle, so the channel is released on every exit path.
    pub async fn wait(self, ceiling: Duration) -> Resolution {
        match timeout(ceiling, self.outcome).await {
            Ok(Ok(outcome)) => Resolution::Resolved(outcome),
            Ok(Err(_)) => Resolution::Released,
            Err(_) => Resolution::CeilingElapsed,
        }
    }
}

/// Fixed-capacity set of active registrations
#[derive(Debug)]
pub struct RegistrationTable {
    slots: Mutex<Vec<Option<Registration>>>,
    capacity: usize,
}

impl RegistrationTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new((0..capacity).map(|_| None).collect()),
            capacity,
        }
    }

    // Every mutation is a single slot write, so a poisoned table is still
    // consistent.
    fn lock(&self) -> MutexGuard<'_, Vec<Option<Registration>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of occupied slots
    pub fn active(&self) -> usize {
        self.lock().iter().filter(|slot| slot.is_some()).count()
    }

    pub fn contains(&self, send_id: SendId) -> bool {
        self.lock().iter().flatten().any(|entry| entry.send_id == send_id)
    }

    /// Claim a free slot for `send_id` with a deadline `timeout` from now
    ///
    /// Never blocks on table space.
    ///
    /// # Errors
    /// - [`RegisterError::Duplicate`] if `send_id` already has an active slot
    /// - [`RegisterError::Full`] if every slot is occupied
    pub fn register(
        &self,
        send_id: SendId,
        timeout: Duration,
    ) -> Result<RegistrationHandle, RegisterError> {
        let deadline = deadline_after(Instant::now(), timeout);
        let mut slots = self.lock();

        if slots.iter().flatten().any(|entry| entry.send_id == send_id) {
            return Err(RegisterError::Duplicate(send_id));
        }
        let Some(slot) = slots.iter().position(Option::is_none) else {
            warn!(send_id = %send_id, capacity = self.capacity, "registration table full");
            return Err(RegisterError::Full {
                capacity: self.capacity,
            });
        };

        let (notify, outcome) = oneshot::channel();
        slots[slot] = Some(Registration {
            send_id,
            deadline,
            notify,
        });
        drop(slots);

        debug!(send_id = %send_id, slot, timeout_ms = timeout.as_millis() as u64, "registered");
        Ok(RegistrationHandle {
            send_id,
            slot,
            deadline,
            outcome,
        })
    }

    /// Deliver `outcome` to the registration for `send_id` and free its slot
    ///
    /// Returns false when no active slot matches; the caller then owns the
    /// event as an orphaned confirmation.
    pub fn resolve_by_id(&self, send_id: SendId, outcome: Outcome) -> bool {
        let mut slots = self.lock();
        let Some(entry) = slots
            .iter_mut()
            .find(|slot| matches!(slot, Some(entry) if entry.send_id == send_id))
            .and_then(Option::take)
        else {
            return false;
        };

        if entry.notify.send(outcome).is_err() {
            debug!(send_id = %send_id, "caller stopped waiting before resolution");
        }
        true
    }

    /// Time out every registration whose deadline is before `now`
    ///
    /// Returns the identifiers whose caller was still waiting. Slots of
    /// callers that already gave up (hard ceiling, dropped future) are freed
    /// without being reported.
    pub fn sweep_expired(&self, now: Instant) -> Vec<SendId> {
        let mut expired = Vec::new();
        let mut slots = self.lock();
        for slot in slots.iter_mut() {
            if !matches!(slot, Some(entry) if entry.deadline < now) {
                continue;
            }
            if let Some(entry) = slot.take() {
                if entry.notify.send(Outcome::TimedOut).is_ok() {
                    expired.push(entry.send_id);
                } else {
                    debug!(send_id = %entry.send_id, "reclaimed slot of departed caller");
                }
            }
        }
        expired
    }

    /// Free every slot without delivering an outcome
    ///
    /// Waiting callers observe [`Resolution::Released`].
    pub fn release_all(&self) -> usize {
        let mut slots = self.lock();
        slots.iter_mut().filter_map(Option::take).count()
    }
}
