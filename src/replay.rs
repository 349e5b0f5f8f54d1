//! Replay buffer and scheduler
//!
//! Orphaned confirmations wait here for a delayed re-announcement. The
//! scheduler frees a due slot before pushing its event back into the
//! confirmation feed, so one slot yields at most one re-announcement no
//! matter how far behind the reconciliation loop is.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::contracts::{Confirmation, SendId};
use crate::errors::ReplayFull;
use crate::feed::ConfirmationSender;
use crate::metrics::TrackerMetrics;

/// A confirmation scheduled for re-announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayEntry {
    pub send_id: SendId,

    /// When the entry becomes due.
    pub due: Instant,

    /// Re-announcements performed once this entry is emitted.
    pub attempts: u32,
}

impl ReplayEntry {
    pub fn is_due(&self, now: Instant) -> bool {
        self.due <= now
    }
}

/// Fixed-capacity set of pending re-announcements
#[derive(Debug)]
pub struct ReplayBuffer {
    slots: Mutex<Vec<Option<ReplayEntry>>>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; capacity]),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<ReplayEntry>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pending(&self) -> usize {
        self.lock().iter().flatten().count()
    }

    /// Insert an entry, or refresh the existing one for the same `send_id`
    ///
    /// A refreshed entry takes the new due time and keeps the higher of the
    /// two attempt counts.
    ///
    /// # Errors
    /// [`ReplayFull`] when no slot is free and `send_id` has no entry yet.
    pub fn schedule(&self, send_id: SendId, attempts: u32, due: Instant) -> Result<(), ReplayFull> {
        let mut slots = self.lock();

        if let Some(entry) = slots.iter_mut().flatten().find(|e| e.send_id == send_id) {
            entry.due = due;
            entry.attempts = entry.attempts.max(attempts);
            return Ok(());
        }

        let slot = slots.iter_mut().find(|slot| slot.is_none()).ok_or(ReplayFull {
            capacity: self.capacity,
        })?;
        *slot = Some(ReplayEntry {
            send_id,
            due,
            attempts,
        });
        Ok(())
    }

    /// Remove every entry due at `now` and return them as replay events
    pub fn take_due(&self, now: Instant) -> Vec<Confirmation> {
        let mut slots = self.lock();
        slots
            .iter_mut()
            .filter(|slot| matches!(slot, Some(entry) if entry.is_due(now)))
            .filter_map(Option::take)
            .map(|entry| Confirmation::replayed(entry.send_id, entry.attempts))
            .collect()
    }
}

/// Periodic task moving due replay entries back into the confirmation feed
pub struct ReplayScheduler {
    buffer: Arc<ReplayBuffer>,
    feed: ConfirmationSender,
    metrics: Arc<TrackerMetrics>,
    period: Duration,
}

impl ReplayScheduler {
    pub fn new(
        buffer: Arc<ReplayBuffer>,
        feed: ConfirmationSender,
        metrics: Arc<TrackerMetrics>,
        period: Duration,
    ) -> Self {
        Self {
            buffer,
            feed,
            metrics,
            period,
        }
    }

    /// One scheduler cycle; returns the number of events re-announced
    ///
    /// The buffer lock is released before any event is pushed, so a full
    /// feed never stalls the reconciliation loop's inserts.
    pub async fn tick(&self, now: Instant) -> usize {
        let due = self.buffer.take_due(now);
        let mut emitted = 0;
        for event in due {
            if self.feed.replay(event).await.is_err() {
                debug!(send_id = %event.send_id, "feed closed, replay dropped");
                break;
            }
            info!(send_id = %event.send_id, attempt = event.replays, "replayed confirmation");
            emitted += 1;
        }
        self.metrics.record_replays_emitted(emitted);
        emitted
    }

    /// Run until the confirmation feed closes
    pub async fn run(self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(period_ms = self.period.as_millis() as u64, "replay scheduler started");

        loop {
            ticker.tick().await;
            if self.feed.is_closed() {
                debug!("replay scheduler stopping: feed closed");
                return;
            }
            self.tick(Instant::now()).await;
        }
    }
}
