//! Pluggable decode and convert steps.
//!
//! The processor is schema-agnostic: the caller supplies an unmarshaller that
//! turns source bytes into a [`SourceMessage`], and a converter that maps it
//! into the destination message. Both are plain functions, selected per
//! (source schema, destination schema) pairing and kept free of shared state
//! so they can be tested on their own.

use std::sync::Arc;

/// Decoded view over a source delivery.
pub trait SourceMessage: Send + Sync + 'static {
    /// Transaction identifier carried by the message.
    fn transaction_id(&self) -> &str;
}

/// Decodes raw source bytes into a source message.
pub type Unmarshaller<S> = Arc<dyn Fn(&[u8]) -> Result<S, tower::BoxError> + Send + Sync>;

/// Maps a source message into the destination message.
pub type Converter<S, M> = Arc<dyn Fn(&S) -> Result<M, ConversionError<M>> + Send + Sync>;

/// What the pipeline does when the converter fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionFailurePolicy {
    /// Publish the partial message carried by the error, if there is one.
    ///
    /// A failure without a partial message leaves nothing to publish and the
    /// delivery is rejected.
    #[default]
    PublishPartial,
    /// Reject the delivery without publishing.
    Reject,
}

/// Error returned by a converter.
///
/// A converter that could build part of the destination message may attach
/// it; whether it gets published is decided by [`ConversionFailurePolicy`].
#[derive(Debug)]
pub struct ConversionError<M> {
    partial: Option<M>,
    source: tower::BoxError,
}

impl<M> ConversionError<M> {
    /// Conversion failed and produced nothing.
    pub fn new(source: impl Into<tower::BoxError>) -> Self {
        Self {
            partial: None,
            source: source.into(),
        }
    }

    /// Conversion failed but produced a degraded `message`.
    pub fn partial(message: M, source: impl Into<tower::BoxError>) -> Self {
        Self {
            partial: Some(message),
            source: source.into(),
        }
    }

    /// Split into the partial message and the underlying cause.
    pub fn into_parts(self) -> (Option<M>, tower::BoxError) {
        (self.partial, self.source)
    }
}

impl<M> std::fmt::Display for ConversionError<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Conversion error: {}", self.source)?;
        if self.partial.is_some() {
            f.write_str(" (partial message available)")?;
        }
        Ok(())
    }
}

impl<M: std::fmt::Debug> std::error::Error for ConversionError<M> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}
