//! Transport seam and in-memory loopback broker
//!
//! A transport only accepts messages for sending and hands back an
//! identifier. Delivery reports arrive later, unordered, possibly twice or
//! never, through a [`ConfirmationSender`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::contracts::SendId;
use crate::errors::TransportError;
use crate::feed::ConfirmationSender;

/// Publish-and-forget message transport
pub trait Transport: Send + Sync + 'static {
    /// Accept `payload` for sending on `topic` without waiting for delivery
    fn send(&self, topic: &str, payload: &[u8]) -> Result<SendId, TransportError>;
}

/// A message accepted by the [`LoopbackBroker`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub send_id: SendId,
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Delivery behaviour of the [`LoopbackBroker`]
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Confirm deliveries automatically; when false, confirmations only
    /// arrive through the feed sender held by the caller.
    pub auto_confirm: bool,

    /// Base delay between send and confirmation.
    pub latency: Duration,

    /// Upper bound of a random extra delay added to `latency`.
    pub jitter: Duration,

    /// Probability that a delivery is never confirmed.
    pub drop_probability: f64,

    /// Probability that a delivery is confirmed a second time.
    pub duplicate_probability: f64,

    /// Largest accepted payload.
    pub max_payload: usize,

    pub seed: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            auto_confirm: true,
            latency: Duration::from_millis(20),
            jitter: Duration::ZERO,
            drop_probability: 0.0,
            duplicate_probability: 0.0,
            max_payload: crate::MAX_PAYLOAD_SIZE,
            seed: 0x5EED,
        }
    }
}

impl LoopbackConfig {
    /// Broker that never confirms on its own
    pub fn manual() -> Self {
        Self {
            auto_confirm: false,
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_drop_probability(mut self, probability: f64) -> Self {
        self.drop_probability = clamp_probability(probability);
        self
    }

    pub fn with_duplicate_probability(mut self, probability: f64) -> Self {
        self.duplicate_probability = clamp_probability(probability);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

// NaN counts as never.
fn clamp_probability(probability: f64) -> f64 {
    if probability.is_nan() {
        0.0
    } else {
        probability.clamp(0.0, 1.0)
    }
}

/// In-memory transport that confirms its own sends
///
/// Identifiers are handed out sequentially starting at 1. Confirmations are
/// delivered from spawned tasks, so sends must happen inside a tokio
/// runtime when `auto_confirm` is on.
pub struct LoopbackBroker {
    confirmations: ConfirmationSender,
    config: LoopbackConfig,
    next_id: AtomicU32,
    online: AtomicBool,
    rng: Mutex<StdRng>,
    sent: Mutex<Vec<SentMessage>>,
}

impl LoopbackBroker {
    pub fn new(confirmations: ConfirmationSender, mut config: LoopbackConfig) -> Self {
        config.drop_probability = clamp_probability(config.drop_probability);
        config.duplicate_probability = clamp_probability(config.duplicate_probability);
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            confirmations,
            config,
            next_id: AtomicU32::new(1),
            online: AtomicBool::new(true),
            rng: Mutex::new(rng),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Reject every send while offline
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Everything accepted so far, in send order
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Confirmation delays for one delivery: empty when dropped, two
    /// entries when duplicated
    fn plan_delivery(&self) -> Vec<Duration> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        if rng.gen_bool(self.config.drop_probability) {
            return Vec::new();
        }

        let mut delays = vec![self.delay(&mut rng)];
        if rng.gen_bool(self.config.duplicate_probability) {
            delays.push(self.delay(&mut rng));
        }
        delays
    }

    fn delay(&self, rng: &mut StdRng) -> Duration {
        let jitter_ms = self.config.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rng.gen_range(0..=jitter_ms)
        };
        self.config.latency.saturating_add(Duration::from_millis(extra))
    }
}

impl Transport for LoopbackBroker {
    fn send(&self, topic: &str, payload: &[u8]) -> Result<SendId, TransportError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        if payload.len() > self.config.max_payload {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                limit: self.config.max_payload,
            });
        }

        let runtime = if self.config.auto_confirm {
            let handle = Handle::try_current()
                .map_err(|err| TransportError::Unavailable(err.to_string()))?;
            Some(handle)
        } else {
            None
        };

        let send_id = SendId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentMessage {
                send_id,
                topic: topic.to_string(),
                payload: payload.to_vec(),
            });
        trace!(send_id = %send_id, topic, bytes = payload.len(), "loopback accepted message");

        let Some(runtime) = runtime else {
            return Ok(send_id);
        };
        let delays = self.plan_delivery();
        if delays.is_empty() {
            debug!(send_id = %send_id, "loopback dropping confirmation");
        }
        for delay in delays {
            let confirmations = self.confirmations.clone();
            runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = confirmations.confirm(send_id).await;
            });
        }
        Ok(send_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::Confirmation;
    use crate::feed::ConfirmationFeed;

    #[test]
    fn test_manual_broker_assigns_sequential_ids() {
        let feed = ConfirmationFeed::new(4);
        let broker = LoopbackBroker::new(feed.sender(), LoopbackConfig::manual());

        assert_eq!(broker.send("/t", b"a").unwrap(), SendId(1));
        assert_eq!(broker.send("/t", b"b").unwrap(), SendId(2));

        let sent = broker.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].payload, b"b".to_vec());
        assert_eq!(sent[0].topic, "/t");
    }

    #[test]
    fn test_offline_broker_rejects() {
        let feed = ConfirmationFeed::new(4);
        let broker = LoopbackBroker::new(feed.sender(), LoopbackConfig::manual());
        broker.set_online(false);

        assert_eq!(broker.send("/t", b"x"), Err(TransportError::Disconnected));
        assert!(broker.sent().is_empty());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let feed = ConfirmationFeed::new(4);
        let broker = LoopbackBroker::new(feed.sender(), LoopbackConfig::manual());
        let payload = vec![0u8; crate::MAX_PAYLOAD_SIZE + 1];

        assert!(matches!(
            broker.send("/t", &payload),
            Err(TransportError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_auto_confirm_needs_runtime() {
        let feed = ConfirmationFeed::new(4);
        let broker = LoopbackBroker::new(feed.sender(), LoopbackConfig::default());

        assert!(matches!(
            broker.send("/t", b"x"),
            Err(TransportError::Unavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_confirm_delivers_after_latency() {
        let feed = ConfirmationFeed::new(4);
        let broker = LoopbackBroker::new(
            feed.sender(),
            LoopbackConfig::default().with_latency(Duration::from_millis(30)),
        );
        let mut stream = feed.into_stream();

        let start = tokio::time::Instant::now();
        let send_id = broker.send("/t", b"x").unwrap();

        assert_eq!(stream.recv().await, Some(Confirmation::delivered(send_id)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_confirm_twice() {
        let feed = ConfirmationFeed::new(4);
        let broker = LoopbackBroker::new(
            feed.sender(),
            LoopbackConfig::default().with_duplicate_probability(1.0),
        );
        let mut stream = feed.into_stream();

        let send_id = broker.send("/t", b"x").unwrap();
        assert_eq!(stream.recv().await.map(|c| c.send_id), Some(send_id));
        assert_eq!(stream.recv().await.map(|c| c.send_id), Some(send_id));
    }

    #[test]
    fn test_drop_everything_plans_nothing() {
        let feed = ConfirmationFeed::new(4);
        let broker = LoopbackBroker::new(
            feed.sender(),
            LoopbackConfig::manual().with_drop_probability(1.0),
        );
        assert!(broker.plan_delivery().is_empty());
    }

    #[test]
    fn test_out_of_range_probabilities_are_clamped() {
        let feed = ConfirmationFeed::new(4);
        let mut config = LoopbackConfig::manual();
        config.drop_probability = 7.5;
        config.duplicate_probability = f64::NAN;
        let broker = LoopbackBroker::new(feed.sender(), config);

        assert_eq!(broker.config.drop_probability, 1.0);
        assert_eq!(broker.config.duplicate_probability, 0.0);
        assert!(broker.plan_delivery().is_empty());
    }

    #[test]
    fn test_negative_drop_probability_never_drops() {
        let feed = ConfirmationFeed::new(4);
        let mut config = LoopbackConfig::manual();
        config.drop_probability = -3.0;
        let broker = LoopbackBroker::new(feed.sender(), config);

        assert_eq!(broker.plan_delivery().len(), 1);
    }
}
