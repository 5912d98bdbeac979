//! Google Cloud Pub/Sub source backend built on `gcloud-pubsub`.

use async_trait::async_trait;
use gcloud_pubsub::{
    client::{Client, ClientConfig},
    subscriber::ReceivedMessage,
    subscription::{ReceiveConfig, Subscription as PubSubSubscription},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::source::{Delivery, Subscription, hand_off};

/// Pub/Sub subscription listener.
///
/// Uses streaming pull through the client's `receive`, with a single worker so
/// that deliveries reach the handoff queue one at a time and in the order the
/// client received them. The client is released when this value is dropped.
pub struct PubSub {
    name: String,
    subscription: PubSubSubscription,
    _client: Client,
}

impl PubSub {
    /// Connect to Pub/Sub for `project` and bind to `subscription`.
    ///
    /// Credentials are resolved the usual way (`GOOGLE_APPLICATION_CREDENTIALS`,
    /// metadata server, or the emulator through `PUBSUB_EMULATOR_HOST`).
    #[tracing::instrument]
    pub async fn connect(project: &str, subscription: &str) -> Result<Self, PubSubError> {
        let config = ClientConfig {
            project_id: Some(project.to_owned()),
            ..ClientConfig::default()
        }
        .with_auth()
        .await
        .map_err(|e| PubSubError::connect(e.into()))?;

        let client = Client::new(config)
            .await
            .map_err(|e| PubSubError::connect(e.into()))?;
        let handle = client.subscription(subscription);

        tracing::info!(subscription = %handle.fully_qualified_name(), "Connected to Pub/Sub");
        Ok(Self {
            name: handle.fully_qualified_name().to_owned(),
            subscription: handle,
            _client: client,
        })
    }
}

#[async_trait]
impl Subscription for PubSub {
    type Delivery = PubSubDelivery;
    type Error = PubSubError;

    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(skip_all, fields(subscription = %self.name))]
    async fn receive(
        &self,
        handoff: mpsc::Sender<Self::Delivery>,
        cancel: CancellationToken,
    ) -> Result<(), Self::Error> {
        let config = ReceiveConfig {
            worker_count: 1,
            ..ReceiveConfig::default()
        };

        self.subscription
            .receive(
                move |message, cancel| {
                    let handoff = handoff.clone();
                    async move {
                        let delivery = PubSubDelivery(message);
                        tracing::debug!(message_id = delivery.message_id(), "Pulled message");
                        hand_off(&handoff, delivery, &cancel).await;
                    }
                },
                cancel,
                Some(config),
            )
            .await
            .map_err(|e| PubSubError::receive(e.into()))
    }
}

/// A message received from Pub/Sub.
pub struct PubSubDelivery(ReceivedMessage);

impl PubSubDelivery {
    /// Server-assigned message id.
    pub fn message_id(&self) -> &str {
        &self.0.message.message_id
    }
}

#[async_trait]
impl Delivery for PubSubDelivery {
    type Error = PubSubError;

    fn payload(&self) -> &[u8] {
        &self.0.message.data
    }

    async fn ack(self) -> Result<(), Self::Error> {
        self.0
            .ack()
            .await
            .map_err(|e| PubSubError::settle(e.into()))
    }

    async fn nack(self) -> Result<(), Self::Error> {
        self.0
            .nack()
            .await
            .map_err(|e| PubSubError::settle(e.into()))
    }
}

/// Error returned by the Pub/Sub backend.
#[derive(Debug)]
pub struct PubSubError {
    context: SpanTrace,
    kind: PubSubErrorKind,
}

/// Pub/Sub error kinds.
#[derive(Debug)]
pub enum PubSubErrorKind {
    /// Client construction or authentication failed.
    Connect(tower::BoxError),
    /// Streaming pull terminated with an error.
    Receive(tower::BoxError),
    /// Acknowledge or negative-acknowledge failed.
    Settle(tower::BoxError),
}

impl PubSubError {
    fn connect(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: PubSubErrorKind::Connect(err),
        }
    }

    fn receive(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: PubSubErrorKind::Receive(err),
        }
    }

    fn settle(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: PubSubErrorKind::Settle(err),
        }
    }

    pub fn kind(&self) -> &PubSubErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for PubSubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PubSubErrorKind::Connect(err) => writeln!(f, "Connect error: {err}"),
            PubSubErrorKind::Receive(err) => writeln!(f, "Receive error: {err}"),
            PubSubErrorKind::Settle(err) => writeln!(f, "Settle error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for PubSubError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PubSubErrorKind::Connect(err)
            | PubSubErrorKind::Receive(err)
            | PubSubErrorKind::Settle(err) => Some(err.as_ref()),
        }
    }
}
