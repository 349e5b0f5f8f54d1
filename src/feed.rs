//! Confirmation feed - bounded queue into the reconciliation loop
//!
//! The transport's delivery callback holds a [`ConfirmationSender`]; the
//! replay scheduler holds another. The reconciliation loop is the single
//! consumer.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::contracts::{Confirmation, SendId};
use crate::errors::FeedError;

/// Cloneable producer handle for confirmation events
#[derive(Debug, Clone)]
pub struct ConfirmationSender {
    tx: mpsc::Sender<Confirmation>,
}

impl ConfirmationSender {
    /// Report that `send_id` was delivered, waiting for queue space
    pub async fn confirm(&self, send_id: SendId) -> Result<(), FeedError> {
        self.tx
            .send(Confirmation::delivered(send_id))
            .await
            .map_err(|_| FeedError::Closed)
    }

    /// Report a delivery without waiting; fails if the queue is full
    pub fn try_confirm(&self, send_id: SendId) -> Result<(), FeedError> {
        self.tx
            .try_send(Confirmation::delivered(send_id))
            .map_err(|err| match err {
                TrySendError::Full(_) => FeedError::Full,
                TrySendError::Closed(_) => FeedError::Closed,
            })
    }

    /// Report a delivery from a plain OS thread (e.g. a client library
    /// callback), blocking until there is queue space
    ///
    /// # Panics
    /// If called from within an async execution context.
    pub fn blocking_confirm(&self, send_id: SendId) -> Result<(), FeedError> {
        self.tx
            .blocking_send(Confirmation::delivered(send_id))
            .map_err(|_| FeedError::Closed)
    }

    pub(crate) async fn replay(&self, event: Confirmation) -> Result<(), FeedError> {
        self.tx.send(event).await.map_err(|_| FeedError::Closed)
    }

    /// True once the reconciliation loop is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer end, owned by the reconciliation loop
#[derive(Debug)]
pub struct ConfirmationStream {
    rx: mpsc::Receiver<Confirmation>,
}

impl ConfirmationStream {
    /// Next event, or `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<Confirmation> {
        self.rx.recv().await
    }
}

/// A confirmation queue not yet attached to a tracker
///
/// Create it first, hand [`ConfirmationFeed::sender`] to the transport, then
/// give the feed to [`PublishTracker::start`](crate::PublishTracker::start).
#[derive(Debug)]
pub struct ConfirmationFeed {
    sender: ConfirmationSender,
    stream: ConfirmationStream,
}

impl ConfirmationFeed {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth.max(1));
        Self {
            sender: ConfirmationSender { tx },
            stream: ConfirmationStream { rx },
        }
    }

    pub fn sender(&self) -> ConfirmationSender {
        self.sender.clone()
    }

    pub fn into_stream(self) -> ConfirmationStream {
        self.stream
    }

    pub(crate) fn split(self) -> (ConfirmationSender, ConfirmationStream) {
        (self.sender, self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_confirm_reaches_stream() {
        let feed = ConfirmationFeed::new(2);
        let sender = feed.sender();
        let mut stream = feed.into_stream();

        sender.confirm(SendId(3)).await.unwrap();
        assert_eq!(stream.recv().await, Some(Confirmation::delivered(SendId(3))));
    }

    #[test]
    fn test_try_confirm_reports_full() {
        let feed = ConfirmationFeed::new(1);
        let sender = feed.sender();

        assert!(sender.try_confirm(SendId(1)).is_ok());
        assert_eq!(sender.try_confirm(SendId(2)), Err(FeedError::Full));
    }

    #[test]
    fn test_closed_after_stream_dropped() {
        let feed = ConfirmationFeed::new(1);
        let sender = feed.sender();
        drop(feed);

        assert!(sender.is_closed());
        assert_eq!(sender.try_confirm(SendId(1)), Err(FeedError::Closed));
    }

    #[test]
    fn test_blocking_confirm_from_thread() {
        let feed = ConfirmationFeed::new(1);
        let sender = feed.sender();
        let mut stream = feed.into_stream();

        std::thread::spawn(move || sender.blocking_confirm(SendId(11)))
            .join()
            .unwrap()
            .unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        assert_eq!(
            runtime.block_on(stream.recv()),
            Some(Confirmation::delivered(SendId(11)))
        );
    }
}
