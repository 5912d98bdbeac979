use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::source::{Delivery, Disposition, Subscription, hand_off};

/// In-memory subscription for testing or local pipelines.
///
/// Payloads are pushed through the paired [`Feed`]; every delivery pulled and
/// every settlement is recorded in a shared [`Ledger`]. A pull failure can be
/// injected with [`Feed::fail`], and dropping the feed ends the subscription
/// cleanly.
pub struct InMemory {
    name: String,
    feed: Mutex<mpsc::UnboundedReceiver<Result<Vec<u8>, String>>>,
    next_id: AtomicU64,
    ledger: Ledger,
}

impl InMemory {
    /// Create a subscription named `name` and the feed that publishes to it.
    pub fn new(name: impl Into<String>) -> (Self, Feed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = Self {
            name: name.into(),
            feed: Mutex::new(rx),
            next_id: AtomicU64::new(1),
            ledger: Ledger::default(),
        };
        (subscription, Feed { tx })
    }

    /// Handle onto the pull and settlement records.
    pub fn ledger(&self) -> Ledger {
        self.ledger.clone()
    }
}

#[async_trait]
impl Subscription for InMemory {
    type Delivery = InMemoryDelivery;
    type Error = InMemorySourceError;

    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(skip_all, fields(subscription = %self.name))]
    async fn receive(
        &self,
        handoff: mpsc::Sender<Self::Delivery>,
        cancel: CancellationToken,
    ) -> Result<(), Self::Error> {
        let mut feed = self.feed.lock().await;

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                item = feed.recv() => item,
            };

            match item {
                Some(Ok(payload)) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    self.ledger.pulled.send_modify(|pulled| *pulled += 1);
                    let delivery = InMemoryDelivery {
                        id,
                        payload,
                        ledger: self.ledger.clone(),
                    };
                    hand_off(&handoff, delivery, &cancel).await;
                }
                Some(Err(reason)) => return Err(InMemorySourceError::pull(reason)),
                None => return Ok(()),
            }
        }
    }
}

/// Publishing side of an [`InMemory`] subscription.
#[derive(Clone)]
pub struct Feed {
    tx: mpsc::UnboundedSender<Result<Vec<u8>, String>>,
}

impl Feed {
    /// Make `payload` available to the next pull.
    pub fn publish(&self, payload: impl Into<Vec<u8>>) {
        // The subscription may already be gone; nothing to deliver to then.
        let _ = self.tx.send(Ok(payload.into()));
    }

    /// Make the next pull fail with `reason`.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Err(reason.into()));
    }
}

/// Delivery produced by [`InMemory`].
#[derive(Debug)]
pub struct InMemoryDelivery {
    id: u64,
    payload: Vec<u8>,
    ledger: Ledger,
}

impl InMemoryDelivery {
    /// Sequence number assigned at pull time, starting at 1.
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    type Error = std::convert::Infallible;

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(self) -> Result<(), Self::Error> {
        self.ledger.settle(self.id, Disposition::Ack);
        Ok(())
    }

    async fn nack(self) -> Result<(), Self::Error> {
        self.ledger.settle(self.id, Disposition::Nack);
        Ok(())
    }
}

/// Settlement recorded by the [`Ledger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settled {
    pub id: u64,
    pub disposition: Disposition,
}

/// Shared record of pulls and settlements of an [`InMemory`] subscription.
///
/// Backed by `watch` channels so tests can await a given count instead of
/// sleeping.
#[derive(Debug, Clone)]
pub struct Ledger {
    pulled: Arc<watch::Sender<usize>>,
    settled: Arc<watch::Sender<Vec<Settled>>>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            pulled: Arc::new(watch::Sender::new(0)),
            settled: Arc::new(watch::Sender::new(Vec::new())),
        }
    }
}

impl Ledger {
    fn settle(&self, id: u64, disposition: Disposition) {
        self.settled
            .send_modify(|settled| settled.push(Settled { id, disposition }));
    }

    /// Number of deliveries pulled so far.
    pub fn pulled(&self) -> usize {
        *self.pulled.borrow()
    }

    /// Settlements so far, in the order they happened.
    pub fn settled(&self) -> Vec<Settled> {
        self.settled.borrow().clone()
    }

    /// Wait until at least `count` deliveries have been pulled.
    pub async fn wait_pulled(&self, count: usize) {
        let mut rx = self.pulled.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|pulled| *pulled >= count).await;
    }

    /// Wait until at least `count` settlements happened and return them all.
    pub async fn wait_settled(&self, count: usize) -> Vec<Settled> {
        let mut rx = self.settled.subscribe();
        match rx.wait_for(|settled| settled.len() >= count).await {
            Ok(settled) => settled.clone(),
            Err(_) => self.settled(),
        }
    }

    /// Settlement of delivery `id`, if any.
    pub fn disposition_of(&self, id: u64) -> Option<Disposition> {
        self.settled
            .borrow()
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.disposition)
    }
}

/// Error type for [`InMemory`] subscriptions.
#[derive(Debug)]
pub struct InMemorySourceError {
    kind: InMemorySourceErrorKind,
}

impl InMemorySourceError {
    fn pull(reason: String) -> Self {
        Self {
            kind: InMemorySourceErrorKind::Pull(reason),
        }
    }
}

impl std::fmt::Display for InMemorySourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemorySourceErrorKind::Pull(reason) => write!(f, "Pull failed: {reason}"),
        }
    }
}

impl std::error::Error for InMemorySourceError {}

#[derive(Debug)]
enum InMemorySourceErrorKind {
    Pull(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivery_is_rejected_when_pipeline_is_gone() {
        let (subscription, feed) = InMemory::new("projects/test/subscriptions/gone");
        let ledger = subscription.ledger();
        let (handoff, receiver) = mpsc::channel(1);
        drop(receiver);

        feed.publish(b"orphan".to_vec());
        drop(feed);

        subscription
            .receive(handoff, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(ledger.pulled(), 1);
        assert_eq!(
            ledger.settled(),
            vec![Settled {
                id: 1,
                disposition: Disposition::Nack
            }]
        );
    }

    #[tokio::test]
    async fn waiting_handoff_is_rejected_on_cancel() {
        let (subscription, feed) = InMemory::new("projects/test/subscriptions/full");
        let ledger = subscription.ledger();
        // Receiver not read until the end: first delivery fills the slot,
        // second waits for room.
        let (handoff, mut receiver) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        feed.publish(b"first".to_vec());
        feed.publish(b"second".to_vec());

        let listener = {
            let cancel = cancel.clone();
            tokio::spawn(async move { subscription.receive(handoff, cancel).await })
        };

        ledger.wait_pulled(2).await;
        cancel.cancel();
        listener.await.unwrap().unwrap();

        let first = receiver.recv().await.unwrap();
        assert_eq!(first.id(), 1);
        assert_eq!(first.payload(), b"first");
        assert_eq!(ledger.disposition_of(1), None);
        assert_eq!(ledger.disposition_of(2), Some(Disposition::Nack));
    }

    #[tokio::test]
    async fn injected_failure_ends_receive_with_error() {
        let (subscription, feed) = InMemory::new("projects/test/subscriptions/broken");
        let (handoff, _receiver) = mpsc::channel(1);

        feed.fail("stream reset");

        let err = subscription
            .receive(handoff, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Pull failed: stream reset");
    }
}
