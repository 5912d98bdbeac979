// The README example needs both backends.
#![cfg_attr(
    all(feature = "pubsub", feature = "rabbitmq"),
    doc = include_str!("../README.md")
)]
#![cfg_attr(
    not(all(feature = "pubsub", feature = "rabbitmq")),
    doc = "Bridges Google Cloud Pub/Sub subscriptions to RabbitMQ exchanges."
)]

pub mod config;
pub mod envelope;
pub mod logging;
pub mod message;
pub mod processor;
pub mod source;
pub mod transport;

#[doc(inline)]
pub use envelope::{Envelope, PublishHeaders};

#[doc(inline)]
pub use message::{ConversionError, ConversionFailurePolicy, SourceMessage};

#[doc(inline)]
pub use processor::{
    DefaultProcessorHook, ListenerError, Processor, ProcessorBuilder, ProcessorError,
    ProcessorErrorKind, ProcessorHook, Resource,
};

#[doc(inline)]
pub use source::{Delivery, Disposition, Subscription};

#[doc(inline)]
pub use transport::{Transport, TransportError, TransportErrorKind};
