//! Consume → transform → publish processor.
//!
//! A [`Processor`] binds one source subscription to one destination routing
//! key. It runs two tasks:
//!
//! - the **listener**, which pulls deliveries from the [`Subscription`] and
//!   hands them over through a single-slot queue, waiting while the slot is
//!   taken (this is the only backpressure between the two systems)
//! - the **pipeline**, which takes deliveries one at a time, decodes,
//!   converts and publishes them, then acks or nacks the delivery
//!
//! Disposition rules:
//!
//! - decode failure: ack (the payload will never decode), continue
//! - conversion failure: see [`ConversionFailurePolicy`]
//! - publish failure: nack, continue
//! - published: ack
//! - still queued when the processor is cancelled: nack
//!
//! A pull failure stops the listener and is reported once on the error sink
//! handed to [`ProcessorBuilder::start`]; restarting is up to whoever owns
//! that sink.

mod hook;
mod listener;
mod pipeline;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing_error::SpanTrace;

use crate::{
    ConversionError, Envelope, PublishHeaders, SourceMessage,
    message::ConversionFailurePolicy,
    source::Subscription,
    transport::Transport,
};

pub use hook::{DefaultProcessorHook, ProcessorHook};

use listener::Listener;
use pipeline::Pipeline;

/// Capacity of the queue between listener and pipeline.
///
/// One slot: the listener can only get one delivery ahead of the pipeline.
const HANDOFF_CAPACITY: usize = 1;

/// A connection or channel owned by a processor and released at shutdown.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Short name used in shutdown diagnostics.
    fn describe(&self) -> &str;

    async fn close(&self) -> Result<(), tower::BoxError>;
}

/// Builder wiring a subscription and a transport into a running [`Processor`].
///
/// ```rust
/// use pubsub_adapter::{
///     ConversionError, ProcessorBuilder, PublishHeaders, SourceMessage, source,
///     transport::{self, RawPayload, Transport, layers::JsonLayer},
/// };
/// use tokio_util::sync::CancellationToken;
///
/// struct Ping(String);
///
/// impl SourceMessage for Ping {
///     fn transaction_id(&self) -> &str {
///         &self.0
///     }
/// }
///
/// # #[tokio::main]
/// # async fn main() {
/// let (subscription, feed) = source::InMemory::new("projects/demo/subscriptions/pings");
/// let sink: transport::InMemory<PublishHeaders, RawPayload> = transport::InMemory::default();
/// let (errors, _failures) = tokio::sync::mpsc::channel(1);
///
/// let processor = ProcessorBuilder::new(
///     subscription,
///     Transport::new(sink.clone()).layer(JsonLayer),
///     "event.ping",
/// )
/// .start(
///     |payload: &[u8]| Ok(Ping(String::from_utf8(payload.to_vec())?)),
///     |ping: &Ping| Ok::<_, ConversionError<String>>(ping.0.clone()),
///     errors,
///     &CancellationToken::new(),
/// );
///
/// feed.publish("tx-1");
/// processor.shutdown().await;
/// # }
/// ```
pub struct ProcessorBuilder<Sub, T> {
    subscription: Sub,
    transport: Transport<T>,
    routing_key: String,
    hook: Arc<dyn ProcessorHook>,
    policy: ConversionFailurePolicy,
    resources: Vec<Box<dyn Resource>>,
}

impl<Sub, T> ProcessorBuilder<Sub, T>
where
    Sub: Subscription,
{
    /// Create a builder publishing to `routing_key` through `transport`.
    pub fn new(subscription: Sub, transport: Transport<T>, routing_key: impl Into<String>) -> Self {
        Self {
            subscription,
            transport,
            routing_key: routing_key.into(),
            hook: Arc::new(DefaultProcessorHook),
            policy: ConversionFailurePolicy::default(),
            resources: Vec::new(),
        }
    }

    /// Replace the default `tracing` hook.
    pub fn with_hook(mut self, hook: impl ProcessorHook + 'static) -> Self {
        self.hook = Arc::new(hook);
        self
    }

    /// Choose what happens to a delivery whose conversion fails.
    pub fn on_conversion_failure(mut self, policy: ConversionFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register a resource to close at shutdown.
    ///
    /// Resources are closed in registration order, after both tasks stopped.
    pub fn with_resource(mut self, resource: impl Resource + 'static) -> Self {
        self.resources.push(Box::new(resource));
        self
    }

    /// Spawn the listener and pipeline tasks.
    ///
    /// Both tasks are running when this returns. They stop when `cancel` (or
    /// the processor's own shutdown) fires. Must be called from within a
    /// Tokio runtime.
    pub fn start<S, M, U, C>(
        self,
        unmarshal: U,
        convert: C,
        errors: mpsc::Sender<ListenerError>,
        cancel: &CancellationToken,
    ) -> Processor
    where
        S: SourceMessage,
        M: Send + 'static,
        U: Fn(&[u8]) -> Result<S, tower::BoxError> + Send + Sync + 'static,
        C: Fn(&S) -> Result<M, ConversionError<M>> + Send + Sync + 'static,
        T: Service<Envelope<PublishHeaders, M>> + Clone + Send + 'static,
        T::Future: Send + 'static,
        T::Error: Into<tower::BoxError>,
    {
        let cancel = cancel.child_token();
        let (handoff, queue) = mpsc::channel(HANDOFF_CAPACITY);
        let name = self.subscription.name().to_owned();

        let pipeline = Pipeline {
            subscription: name.clone(),
            routing_key: self.routing_key,
            unmarshal: Arc::new(unmarshal),
            convert: Arc::new(convert),
            policy: self.policy,
            transport: self.transport,
            hook: Arc::clone(&self.hook),
        };
        let pipeline = tokio::spawn(pipeline.run(queue, cancel.clone()));

        let listener = Listener {
            subscription: self.subscription,
            errors,
            hook: Arc::clone(&self.hook),
        };
        let listener = tokio::spawn(listener.run(handoff, cancel.clone()));

        Processor {
            subscription: name,
            cancel,
            listener,
            pipeline,
            resources: self.resources,
            hook: self.hook,
        }
    }
}

/// A running subscription → exchange bridge.
///
/// Created by [`ProcessorBuilder::start`] or [`Processor::connect`]; torn
/// down exactly once with [`Processor::shutdown`].
pub struct Processor {
    subscription: String,
    cancel: CancellationToken,
    listener: JoinHandle<()>,
    pipeline: JoinHandle<()>,
    resources: Vec<Box<dyn Resource>>,
    hook: Arc<dyn ProcessorHook>,
}

impl Processor {
    /// Name of the source subscription.
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Whether both tasks have stopped.
    pub fn is_finished(&self) -> bool {
        self.listener.is_finished() && self.pipeline.is_finished()
    }

    /// Stop both tasks and release owned resources.
    ///
    /// Cancels the processor, waits for the listener to stop pulling and for
    /// the pipeline to settle the message in hand and reject anything still
    /// queued, then closes registered resources in order. Close failures are
    /// reported to the hook and do not stop the remaining closes. The source
    /// client is dropped together with the listener task.
    #[tracing::instrument(skip(self), fields(subscription = %self.subscription))]
    pub async fn shutdown(self) {
        let Processor {
            cancel,
            listener,
            pipeline,
            resources,
            hook,
            ..
        } = self;

        cancel.cancel();

        for (task, handle) in [("listener task", listener), ("pipeline task", pipeline)] {
            if let Err(err) = handle.await {
                hook.on_close_error(task, &err);
            }
        }

        close_all(&resources, hook.as_ref()).await;
    }
}

async fn close_all(resources: &[Box<dyn Resource>], hook: &dyn ProcessorHook) {
    for resource in resources {
        if let Err(err) = resource.close().await {
            hook.on_close_error(resource.describe(), err.as_ref());
        }
    }
}

#[cfg(all(feature = "pubsub", feature = "rabbitmq"))]
impl Processor {
    /// Connect to RabbitMQ and Pub/Sub and start processing.
    ///
    /// The RabbitMQ connection and channel are opened first, then the Pub/Sub
    /// client. Any failure closes whatever was already opened and returns
    /// without starting anything. Messages are JSON-encoded and published to
    /// `settings.events_exchange` with `pairing.routing_key`.
    #[tracing::instrument(
        skip_all,
        fields(subscription = %pairing.subscription, routing_key = %pairing.routing_key)
    )]
    pub async fn connect<S, M, U, C>(
        settings: &crate::config::Settings,
        pairing: &crate::config::Pairing,
        unmarshal: U,
        convert: C,
        errors: mpsc::Sender<ListenerError>,
        cancel: &CancellationToken,
    ) -> Result<Self, ProcessorError>
    where
        S: SourceMessage,
        M: serde::Serialize + Send + 'static,
        U: Fn(&[u8]) -> Result<S, tower::BoxError> + Send + Sync + 'static,
        C: Fn(&S) -> Result<M, ConversionError<M>> + Send + Sync + 'static,
    {
        use crate::{
            source::pubsub::PubSub,
            transport::{layers::JsonLayer, rabbitmq},
        };

        let (connection, channel) = rabbitmq::connect(
            &settings.rabbit_connection_string,
            settings.publisher_confirms,
        )
        .await
        .map_err(|e| ProcessorError::from_destination(e.into()))?;

        let subscription = match PubSub::connect(&pairing.project, &pairing.subscription).await {
            Ok(subscription) => subscription,
            Err(err) => {
                let opened: [Box<dyn Resource>; 2] = [Box::new(channel), Box::new(connection)];
                close_all(&opened, &DefaultProcessorHook).await;
                return Err(ProcessorError::from_source(err.into()));
            }
        };

        let sender = rabbitmq::RabbitMq::new(
            channel.clone(),
            settings.events_exchange.clone(),
            settings.publisher_confirms,
        );
        let transport = Transport::new(sender).layer(JsonLayer);

        Ok(
            ProcessorBuilder::new(subscription, transport, pairing.routing_key.clone())
                .on_conversion_failure(settings.conversion_failure)
                .with_resource(channel)
                .with_resource(connection)
                .start(unmarshal, convert, errors, cancel),
        )
    }
}

/// Error returned when a processor cannot be set up.
#[derive(Debug)]
pub struct ProcessorError {
    context: SpanTrace,
    kind: ProcessorErrorKind,
}

/// Classification of processor setup errors.
#[derive(Debug)]
pub enum ProcessorErrorKind {
    /// The source subscription could not be reached.
    Source(tower::BoxError),
    /// The destination broker could not be reached.
    Destination(tower::BoxError),
}

impl ProcessorError {
    pub(crate) fn from_source(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ProcessorErrorKind::Source(err),
        }
    }

    pub(crate) fn from_destination(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ProcessorErrorKind::Destination(err),
        }
    }

    pub fn kind(&self) -> &ProcessorErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ProcessorErrorKind::Source(err) => writeln!(f, "Source setup error: {err}"),
            ProcessorErrorKind::Destination(err) => writeln!(f, "Destination setup error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ProcessorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ProcessorErrorKind::Source(err) | ProcessorErrorKind::Destination(err) => {
                Some(err.as_ref())
            }
        }
    }
}

/// Unrecoverable listener failure, sent once on the processor's error sink.
#[derive(Debug)]
pub struct ListenerError {
    context: SpanTrace,
    subscription: String,
    source: tower::BoxError,
}

impl ListenerError {
    pub(crate) fn new(subscription: impl Into<String>, source: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            subscription: subscription.into(),
            source,
        }
    }

    /// Subscription whose listener failed.
    pub fn subscription(&self) -> &str {
        &self.subscription
    }
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Listener error on {}: {}", self.subscription, self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}
