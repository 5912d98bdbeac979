//! Source subscription abstractions and listener backends.
//!
//! A [`Subscription`] is a pull point that yields [`Delivery`] values. Each
//! delivery carries immutable payload bytes and must be settled exactly once,
//! either with [`Delivery::ack`] or [`Delivery::nack`]. Both consume the
//! delivery, so settling twice does not compile.
//!
//! Backends:
//!
//! - [`InMemory`]: channel-fed subscription used by tests and local runs
//! - [`pubsub::PubSub`]: Google Cloud Pub/Sub (feature `pubsub`)

mod inmemory;

#[cfg(feature = "pubsub")]
pub mod pubsub;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use inmemory::{Feed, InMemory, InMemoryDelivery, InMemorySourceError, Ledger, Settled};

/// Terminal action applied to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Consumed; the source will not redeliver.
    Ack,
    /// Rejected; the source may redeliver.
    Nack,
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disposition::Ack => f.write_str("ack"),
            Disposition::Nack => f.write_str("nack"),
        }
    }
}

/// One unit of message data received from a subscription.
#[async_trait]
pub trait Delivery: Send + Sync + 'static {
    /// Backend-specific error raised while settling.
    type Error: Into<tower::BoxError> + Send;

    /// Raw payload bytes as published to the source topic.
    fn payload(&self) -> &[u8];

    /// Confirm consumption.
    async fn ack(self) -> Result<(), Self::Error>;

    /// Reject, requesting redelivery.
    async fn nack(self) -> Result<(), Self::Error>;

    /// Apply `disposition`.
    async fn settle(self, disposition: Disposition) -> Result<(), Self::Error>
    where
        Self: Sized,
    {
        match disposition {
            Disposition::Ack => self.ack().await,
            Disposition::Nack => self.nack().await,
        }
    }
}

/// A pull-based subscription.
///
/// Implementations pull deliveries until `cancel` fires or an unrecoverable
/// error occurs, handing every delivery to `handoff` through [`hand_off`].
/// Retry of transient pull failures, if any, is the backend client's concern.
#[async_trait]
pub trait Subscription: Send + Sync + 'static {
    type Delivery: Delivery;
    type Error: Into<tower::BoxError> + Send;

    /// Fully qualified subscription name, for diagnostics.
    fn name(&self) -> &str;

    /// Pull until cancelled (`Ok`) or until pulling fails (`Err`).
    async fn receive(
        &self,
        handoff: mpsc::Sender<Self::Delivery>,
        cancel: CancellationToken,
    ) -> Result<(), Self::Error>;
}

/// Hand a delivery to the pipeline, waiting for a free slot.
///
/// A slot is reserved before the delivery is moved, so nothing is lost if the
/// wait is abandoned. When `cancel` fires first, or the pipeline has gone
/// away, the delivery is rejected here and `false` is returned.
pub async fn hand_off<D: Delivery>(
    handoff: &mpsc::Sender<D>,
    delivery: D,
    cancel: &CancellationToken,
) -> bool {
    let permit = tokio::select! {
        _ = cancel.cancelled() => None,
        permit = handoff.reserve() => permit.ok(),
    };

    match permit {
        Some(permit) => {
            permit.send(delivery);
            true
        }
        None => {
            tracing::debug!("Pipeline not accepting deliveries, rejecting");
            if let Err(err) = delivery.nack().await {
                let err: tower::BoxError = err.into();
                tracing::warn!(error = ?err, "Failed to reject delivery that was not handed off");
            }
            false
        }
    }
}
