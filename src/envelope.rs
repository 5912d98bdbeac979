/// Outbound message container used by the publish pipeline.
///
/// `Envelope` bundles a message payload together with its associated headers.
/// It is generic over both and does not depend on any broker.
///
/// ## Design
///
/// - `H` represents message metadata (routing key, transaction id)
/// - `M` represents the actual message payload
///
/// Keeping headers and payload separated means only the payload ends up in
/// the published body, while the headers drive routing and broker-level
/// attributes.
///
/// ## Example
///
/// ```rust
/// use pubsub_adapter::{Envelope, PublishHeaders};
///
/// let envelope = Envelope {
///     headers: PublishHeaders::new("event.response.receipt", "abc-1"),
///     message: 42,
/// };
///
/// // or, equivalently
/// let headers = PublishHeaders::new("event.response.receipt", "abc-1");
/// let envelope: Envelope<_, _> = (headers, 42).into();
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<H, M> {
    /// Message metadata.
    pub headers: H,
    /// Message payload.
    pub message: M,
}

impl<H, M> From<(H, M)> for Envelope<H, M> {
    fn from(value: (H, M)) -> Self {
        Envelope {
            headers: value.0,
            message: value.1,
        }
    }
}

/// Headers attached to every message the processor publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishHeaders {
    routing_key: String,
    transaction_id: String,
}

impl PublishHeaders {
    pub fn new(routing_key: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self {
            routing_key: routing_key.into(),
            transaction_id: transaction_id.into(),
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Transaction id of the source message this envelope was converted from.
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }
}
