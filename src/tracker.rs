//! Publish tracker - the caller-facing entry point
//!
//! Sends through the transport, registers a wait record for the returned
//! identifier and blocks the calling task until the reconciliation loop
//! resolves it. Owns the two background loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::TrackerConfig;
use crate::contracts::{Delivery, Outcome, SendId};
use crate::errors::{ConfigError, PublishError, RegisterError, Result};
use crate::feed::ConfirmationFeed;
use crate::metrics::{MetricsSnapshot, TrackerMetrics};
use crate::reconciler::Reconciler;
use crate::records::Record;
use crate::registration::{RegistrationTable, Resolution};
use crate::replay::{ReplayBuffer, ReplayScheduler};
use crate::transport::Transport;

/// Reliable publish on top of a publish-and-forget transport
///
/// # Example
/// ```no_run
/// use ackline_core::{
///     ConfirmationFeed, LoopbackBroker, LoopbackConfig, PublishTracker, TrackerConfig,
/// };
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let config = TrackerConfig::default();
/// let feed = ConfirmationFeed::new(config.feed_depth);
/// let broker = LoopbackBroker::new(feed.sender(), LoopbackConfig::default());
/// let tracker = PublishTracker::start(config, broker, feed)?;
///
/// let delivery = tracker.publish(b"{\"Distance\":120}").await?;
/// println!("confirmed {} in {:?}", delivery.send_id, delivery.elapsed);
/// # Ok(())
/// # }
/// ```
pub struct PublishTracker<T: Transport> {
    transport: T,
    config: TrackerConfig,
    registrations: Arc<RegistrationTable>,
    replays: Arc<ReplayBuffer>,
    metrics: Arc<TrackerMetrics>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> PublishTracker<T> {
    /// Validate `config` and spawn the reconciliation loop and the replay
    /// scheduler on the current tokio runtime
    ///
    /// # Panics
    /// If called outside a tokio runtime.
    pub fn start(
        config: TrackerConfig,
        transport: T,
        feed: ConfirmationFeed,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let registrations = Arc::new(RegistrationTable::new(config.registration_capacity));
        let replays = Arc::new(ReplayBuffer::new(config.replay_capacity));
        let metrics = Arc::new(TrackerMetrics::new());
        let (sender, stream) = feed.split();

        let reconciler = Reconciler::new(
            Arc::clone(&registrations),
            Arc::clone(&replays),
            Arc::clone(&metrics),
            &config,
        );
        let scheduler = ReplayScheduler::new(
            Arc::clone(&replays),
            sender,
            Arc::clone(&metrics),
            config.replay_period,
        );
        let tasks = vec![
            tokio::spawn(reconciler.run(stream)),
            tokio::spawn(scheduler.run()),
        ];

        info!(
            registration_capacity = config.registration_capacity,
            replay_capacity = config.replay_capacity,
            timeout_ms = config.publish_timeout.as_millis() as u64,
            max_replays = config.max_replays,
            "publish tracker started"
        );
        Ok(Self {
            transport,
            config,
            registrations,
            replays,
            metrics,
            running: AtomicBool::new(true),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Registrations currently waiting for an outcome
    pub fn pending(&self) -> usize {
        self.registrations.active()
    }

    /// Orphaned confirmations awaiting re-announcement
    pub fn pending_replays(&self) -> usize {
        self.replays.pending()
    }

    /// Publish `payload` on the configured default topic
    pub async fn publish(&self, payload: &[u8]) -> Result<Delivery> {
        self.publish_to(&self.config.default_topic, payload).await
    }

    /// Encode `record` and publish it on the record's own topic
    pub async fn publish_record<R: Record + ?Sized>(&self, record: &R) -> Result<Delivery> {
        let document = record.to_document()?;
        self.publish_to(record.topic(), &document).await
    }

    /// Publish `payload` on `topic` and wait for its confirmation
    ///
    /// # Errors
    /// - [`PublishError::TransportRejected`] - nothing was sent
    /// - [`PublishError::NoTrackingCapacity`] - sent, outcome untracked
    /// - [`PublishError::TimedOut`] - no confirmation before the deadline
    /// - [`PublishError::Stalled`] - hard ceiling reached
    /// - [`PublishError::TrackerStopped`] - tracker shut down while waiting
    pub async fn publish_to(&self, topic: &str, payload: &[u8]) -> Result<Delivery> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(PublishError::TrackerStopped);
        }

        let started = Instant::now();
        let payload_crc = crc32fast::hash(payload);
        let send_id = match self.transport.send(topic, payload) {
            Ok(send_id) => send_id,
            Err(err) => {
                warn!(topic, payload_crc, error = %err, "transport rejected message");
                self.metrics.record_rejected();
                return Err(PublishError::TransportRejected(err));
            }
        };
        self.metrics.record_published();
        debug!(send_id = %send_id, topic, payload_crc, bytes = payload.len(), "message sent");

        let handle = match self
            .registrations
            .register(send_id, self.config.publish_timeout)
        {
            Ok(handle) => handle,
            Err(RegisterError::Full { .. }) => {
                self.metrics.record_untracked();
                return Err(PublishError::NoTrackingCapacity { send_id });
            }
            Err(RegisterError::Duplicate(_)) => {
                warn!(send_id = %send_id, "transport reused an outstanding send id");
                return Err(PublishError::DuplicateSendId { send_id });
            }
        };

        match handle.wait(self.config.hard_ceiling).await {
            Resolution::Resolved(Outcome::Acknowledged) => Ok(Delivery {
                send_id,
                elapsed: started.elapsed(),
            }),
            Resolution::Resolved(Outcome::TimedOut) => Err(PublishError::TimedOut { send_id }),
            Resolution::CeilingElapsed => {
                error!(send_id = %send_id, "registration unresolved at hard ceiling");
                self.metrics.record_stalled();
                Err(PublishError::Stalled { send_id })
            }
            Resolution::Released => Err(PublishError::TrackerStopped),
        }
    }

    /// Stop both loops and release every waiting caller
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        let released = self.registrations.release_all();
        info!(released, "publish tracker stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether a caller is still waiting on `send_id`
    pub fn is_pending(&self, send_id: SendId) -> bool {
        self.registrations.contains(send_id)
    }
}

impl<T: Transport> Drop for PublishTracker<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
