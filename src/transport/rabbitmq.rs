//! RabbitMQ destination backend built on `lapin`.

use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    options::{BasicPublishOptions, ConfirmSelectOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
};

use crate::{
    Envelope, PublishHeaders,
    processor::Resource,
    transport::{Sender, ToBytes},
};

/// AMQP delivery mode asking the broker to persist the message.
const PERSISTENT: u8 = 2;

const JSON_CONTENT_TYPE: &str = "application/json";

/// RabbitMQ transport sender.
///
/// Publishes messages to a single exchange over a `lapin::Channel`.
///
/// ## Design
///
/// - Messages are published to a **single exchange**
/// - The routing key is derived from the envelope headers
/// - Envelope headers are mapped to **AMQP message headers**
/// - The message payload is published as-is via `ToBytes`; pair the sender
///   with [`JsonLayer`](crate::transport::layers::JsonLayer) to publish
///   structured messages
/// - Every message is marked persistent with an `application/json` content type
///
/// The channel is only ever driven by one pipeline loop, so it is used
/// without locking. `lapin::Channel` is a cheap handle and is cloned per
/// publish by [`SenderService`](crate::transport::SenderService).
#[derive(Clone)]
pub struct RabbitMq {
    /// AMQP channel used for publishing.
    channel: Channel,
    /// Target exchange name.
    exchange: String,
    /// Whether the channel was put in confirm mode.
    confirms: bool,
}

impl RabbitMq {
    /// Create a sender publishing to `exchange` on `channel`.
    ///
    /// `confirms` must match the channel: pass `true` only if
    /// `confirm_select` was issued on it (see [`connect`]).
    pub fn new(channel: Channel, exchange: impl Into<String>, confirms: bool) -> Self {
        Self {
            channel,
            exchange: exchange.into(),
            confirms,
        }
    }
}

#[async_trait]
impl<H, M> Sender<H, M> for RabbitMq
where
    H: RoutingKey + RabbitMqAttributes + Send + Sync + 'static,
    M: ToBytes + Send + Sync + 'static,
{
    type Error = RabbitMqError;

    /// Publish a message to RabbitMQ.
    ///
    /// ## Mapping
    ///
    /// - `Envelope.headers.routing_key()` → AMQP routing key
    /// - `Envelope.headers.attributes()` → AMQP message headers
    /// - `Envelope.message` → message body
    ///
    /// The call waits for the publish to be written and, in confirm mode,
    /// for the broker to confirm it. A broker nack is reported as
    /// [`RabbitMqError::Nacked`].
    async fn send(&mut self, envelope: Envelope<H, M>) -> Result<(), Self::Error> {
        let mut amqp_headers = FieldTable::default();
        for (k, v) in envelope.headers.attributes() {
            amqp_headers.insert(k, v);
        }

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(PERSISTENT)
            .with_headers(amqp_headers);

        let routing_key = envelope.headers.routing_key();
        let body = envelope.message.to_bytes();

        let confirmation = self
            .channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await?
            .await?;

        if self.confirms && confirmation.is_nack() {
            return Err(RabbitMqError::Nacked);
        }

        tracing::debug!(
            exchange = %self.exchange,
            routing_key,
            body = %String::from_utf8_lossy(body),
            "Message published",
        );
        Ok(())
    }
}

/// Open a connection and a publishing channel.
///
/// When `confirms` is set, the channel is switched to publisher-confirm mode.
/// If the channel cannot be set up the connection is closed before the error
/// is returned.
#[tracing::instrument(skip(uri))]
pub async fn connect(uri: &str, confirms: bool) -> Result<(Connection, Channel), RabbitMqError> {
    let connection = Connection::connect(uri, ConnectionProperties::default()).await?;

    let channel = match open_channel(&connection, confirms).await {
        Ok(channel) => channel,
        Err(err) => {
            if let Err(close_err) = connection.close(200, "channel setup failed").await {
                tracing::warn!(error = ?close_err, "Failed to close connection after setup error");
            }
            return Err(err);
        }
    };

    tracing::info!(confirms, "Connected to RabbitMQ");
    Ok((connection, channel))
}

async fn open_channel(connection: &Connection, confirms: bool) -> Result<Channel, RabbitMqError> {
    let channel = connection.create_channel().await?;
    if confirms {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
    }
    Ok(channel)
}

#[async_trait]
impl Resource for Channel {
    fn describe(&self) -> &str {
        "rabbitmq channel"
    }

    async fn close(&self) -> Result<(), tower::BoxError> {
        Channel::close(self, 200, "processor shutdown").await?;
        Ok(())
    }
}

#[async_trait]
impl Resource for Connection {
    fn describe(&self) -> &str {
        "rabbitmq connection"
    }

    async fn close(&self) -> Result<(), tower::BoxError> {
        Connection::close(self, 200, "processor shutdown").await?;
        Ok(())
    }
}

/// Provides the routing key used when publishing to RabbitMQ.
pub trait RoutingKey {
    /// Return the routing key for the message.
    fn routing_key(&self) -> &str;
}

/// Provides AMQP-compatible message attributes.
///
/// ## Notes
///
/// - Keys must be valid AMQP short strings
/// - Values must be supported `AMQPValue`s
/// - The iterator is consumed during message publishing
pub trait RabbitMqAttributes {
    /// Iterator over AMQP header key-value pairs.
    fn attributes(&self) -> impl Iterator<Item = (ShortString, AMQPValue)>;
}

impl RoutingKey for PublishHeaders {
    fn routing_key(&self) -> &str {
        PublishHeaders::routing_key(self)
    }
}

impl RabbitMqAttributes for PublishHeaders {
    fn attributes(&self) -> impl Iterator<Item = (ShortString, AMQPValue)> {
        std::iter::once((
            ShortString::from("tx_id"),
            AMQPValue::LongString(LongString::from(self.transaction_id().to_owned())),
        ))
    }
}

/// Error returned by the RabbitMQ backend.
#[derive(Debug)]
pub enum RabbitMqError {
    /// Protocol or I/O error reported by `lapin`.
    Amqp(lapin::Error),
    /// The broker refused the message in confirm mode.
    Nacked,
}

impl From<lapin::Error> for RabbitMqError {
    fn from(err: lapin::Error) -> Self {
        Self::Amqp(err)
    }
}

impl std::fmt::Display for RabbitMqError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RabbitMqError::Amqp(err) => write!(f, "AMQP error: {err}"),
            RabbitMqError::Nacked => write!(f, "Publish was nacked by the broker"),
        }
    }
}

impl std::error::Error for RabbitMqError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RabbitMqError::Amqp(err) => Some(err),
            RabbitMqError::Nacked => None,
        }
    }
}
