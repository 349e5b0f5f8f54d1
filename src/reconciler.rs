//! Reconciliation loop - the single owner of both tables
//!
//! Drains confirmation events, resolves matching registrations, routes
//! orphans into the replay buffer and expires registrations past their
//! deadline. A confirmation is matched against the table as it is at the
//! moment it is processed; a registration added later is only reached
//! through a replay.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::contracts::{Confirmation, Outcome};
use crate::errors::AbandonReason;
use crate::feed::ConfirmationStream;
use crate::metrics::TrackerMetrics;
use crate::registration::{deadline_after, RegistrationTable};
use crate::replay::ReplayBuffer;

/// What happened to one confirmation event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// A waiting caller received `Acknowledged`.
    Resolved,
    /// No caller was waiting; a re-announcement is scheduled.
    Replaying { attempt: u32, due: Instant },
    /// No caller was waiting and the event was dropped for good.
    Abandoned(AbandonReason),
}

pub struct Reconciler {
    registrations: Arc<RegistrationTable>,
    replays: Arc<ReplayBuffer>,
    metrics: Arc<TrackerMetrics>,
    replay_delay: Duration,
    max_replays: u32,
    sweep_period: Duration,
}

impl Reconciler {
    pub fn new(
        registrations: Arc<RegistrationTable>,
        replays: Arc<ReplayBuffer>,
        metrics: Arc<TrackerMetrics>,
        config: &crate::TrackerConfig,
    ) -> Self {
        Self {
            registrations,
            replays,
            metrics,
            replay_delay: config.replay_delay,
            max_replays: config.max_replays,
            sweep_period: config.sweep_period,
        }
    }

    /// Match one event against the registration table
    pub fn handle_confirmation(&self, event: Confirmation, now: Instant) -> Reconciliation {
        let send_id = event.send_id;

        if self.registrations.resolve_by_id(send_id, Outcome::Acknowledged) {
            info!(send_id = %send_id, replays = event.replays, "message acknowledged");
            self.metrics.record_acknowledged();
            return Reconciliation::Resolved;
        }

        if event.replays >= self.max_replays {
            return self.abandon(
                event,
                AbandonReason::RetriesExhausted {
                    attempts: event.replays,
                },
            );
        }

        let attempt = event.replays + 1;
        let due = deadline_after(now, self.replay_delay);
        match self.replays.schedule(send_id, attempt, due) {
            Ok(()) => {
                debug!(send_id = %send_id, attempt, "orphaned confirmation sent to replay buffer");
                self.metrics.record_replay_scheduled();
                Reconciliation::Replaying { attempt, due }
            }
            Err(_) => self.abandon(event, AbandonReason::NoReplayCapacity),
        }
    }

    fn abandon(&self, event: Confirmation, reason: AbandonReason) -> Reconciliation {
        warn!(
            send_id = %event.send_id,
            replays = event.replays,
            reason = %reason,
            "delivery abandoned"
        );
        self.metrics.record_abandoned(reason);
        Reconciliation::Abandoned(reason)
    }

    /// Time out registrations past their deadline; returns how many
    pub fn sweep(&self, now: Instant) -> usize {
        let expired = self.registrations.sweep_expired(now);
        for send_id in &expired {
            warn!(send_id = %send_id, "message timed out");
        }
        self.metrics.record_timed_out(expired.len());
        expired.len()
    }

    /// Run until every confirmation sender is gone
    ///
    /// The bounded wait for the next event is the loop's only suspension
    /// point; the sweep runs after every wake-up, event or not.
    pub async fn run(self, mut feed: ConfirmationStream) {
        debug!(
            sweep_period_ms = self.sweep_period.as_millis() as u64,
            "reconciliation loop started"
        );
        loop {
            match timeout(self.sweep_period, feed.recv()).await {
                Ok(Some(event)) => {
                    self.handle_confirmation(event, Instant::now());
                }
                Ok(None) => {
                    debug!("reconciliation loop stopping: feed closed");
                    return;
                }
                Err(_) => {}
            }
            self.sweep(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::SendId;
    use crate::TrackerConfig;

    const TIMEOUT: Duration = Duration::from_millis(1000);

    fn reconciler(capacity: usize, replay_capacity: usize) -> Reconciler {
        let config = TrackerConfig::new()
            .with_registration_capacity(capacity)
            .with_replay_capacity(replay_capacity)
            .with_replay_delay(Duration::from_millis(500))
            .with_max_replays(2);
        Reconciler::new(
            Arc::new(RegistrationTable::new(capacity)),
            Arc::new(ReplayBuffer::new(replay_capacity)),
            Arc::new(TrackerMetrics::new()),
            &config,
        )
    }

    #[test]
    fn test_confirmation_resolves_registration() {
        let reconciler = reconciler(4, 4);
        let mut handle = reconciler.registrations.register(SendId(1), TIMEOUT).unwrap();

        let result =
            reconciler.handle_confirmation(Confirmation::delivered(SendId(1)), Instant::now());

        assert_eq!(result, Reconciliation::Resolved);
        assert_eq!(handle.try_outcome(), Some(Outcome::Acknowledged));
        assert_eq!(reconciler.metrics.snapshot().acknowledged, 1);
    }

    #[test]
    fn test_orphan_goes_to_replay_with_delay() {
        let reconciler = reconciler(4, 4);
        let now = Instant::now();

        let result = reconciler.handle_confirmation(Confirmation::delivered(SendId(2)), now);

        assert_eq!(
            result,
            Reconciliation::Replaying {
                attempt: 1,
                due: now + Duration::from_millis(500)
            }
        );
        assert_eq!(reconciler.replays.pending(), 1);
    }

    #[test]
    fn test_orphan_abandoned_at_ceiling() {
        let reconciler = reconciler(4, 4);

        let result = reconciler
            .handle_confirmation(Confirmation::replayed(SendId(3), 2), Instant::now());

        assert_eq!(
            result,
            Reconciliation::Abandoned(AbandonReason::RetriesExhausted { attempts: 2 })
        );
        assert_eq!(reconciler.replays.pending(), 0);
        assert_eq!(reconciler.metrics.snapshot().abandoned_retries, 1);
    }

    #[test]
    fn test_orphan_abandoned_without_replay_capacity() {
        let reconciler = reconciler(4, 1);
        let now = Instant::now();
        reconciler.handle_confirmation(Confirmation::delivered(SendId(1)), now);

        let result = reconciler.handle_confirmation(Confirmation::delivered(SendId(2)), now);

        assert_eq!(
            result,
            Reconciliation::Abandoned(AbandonReason::NoReplayCapacity)
        );
        assert_eq!(reconciler.metrics.snapshot().abandoned_no_capacity, 1);
    }

    #[test]
    fn test_replay_resolves_late_registration() {
        let reconciler = reconciler(4, 4);
        let now = Instant::now();
        reconciler.handle_confirmation(Confirmation::delivered(SendId(5)), now);

        let mut handle = reconciler.registrations.register(SendId(5), TIMEOUT).unwrap();
        let due = reconciler.replays.take_due(now + Duration::from_millis(500));
        assert_eq!(due.len(), 1);

        assert_eq!(
            reconciler.handle_confirmation(due[0], now),
            Reconciliation::Resolved
        );
        assert_eq!(handle.try_outcome(), Some(Outcome::Acknowledged));
    }

    #[test]
    fn test_sweep_counts_timeouts() {
        let reconciler = reconciler(4, 4);
        let mut a = reconciler
            .registrations
            .register(SendId(1), Duration::from_millis(5))
            .unwrap();
        let _b = reconciler.registrations.register(SendId(2), TIMEOUT).unwrap();

        assert_eq!(reconciler.sweep(a.deadline() + Duration::from_millis(1)), 1);
        assert_eq!(a.try_outcome(), Some(Outcome::TimedOut));
        assert_eq!(reconciler.metrics.snapshot().timed_out, 1);
    }

    #[test]
    fn test_sweep_ignores_departed_caller() {
        let reconciler = reconciler(4, 4);
        let gone = reconciler
            .registrations
            .register(SendId(1), Duration::from_millis(5))
            .unwrap();
        let deadline = gone.deadline();
        drop(gone);

        assert_eq!(reconciler.sweep(deadline + Duration::from_millis(1)), 0);
        assert_eq!(reconciler.metrics.snapshot().timed_out, 0);
        assert_eq!(reconciler.registrations.active(), 0);
    }
}
