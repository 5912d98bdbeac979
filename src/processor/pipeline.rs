use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::{
    Envelope, PublishHeaders, SourceMessage,
    message::{ConversionFailurePolicy, Converter, Unmarshaller},
    processor::ProcessorHook,
    source::{Delivery, Disposition},
    transport::Transport,
};

/// Single consumer of the handoff queue.
///
/// Processes one delivery at a time: unmarshal, convert, publish, settle.
/// Cancellation is only observed between deliveries, so the delivery in hand
/// is always settled.
pub(super) struct Pipeline<S, M, T> {
    pub(super) subscription: String,
    pub(super) routing_key: String,
    pub(super) unmarshal: Unmarshaller<S>,
    pub(super) convert: Converter<S, M>,
    pub(super) policy: ConversionFailurePolicy,
    pub(super) transport: Transport<T>,
    pub(super) hook: Arc<dyn ProcessorHook>,
}

impl<S, M, T> Pipeline<S, M, T>
where
    S: SourceMessage,
    M: Send + 'static,
    T: Service<Envelope<PublishHeaders, M>> + Clone + Send + 'static,
    T::Future: Send + 'static,
    T::Error: Into<tower::BoxError>,
{
    /// Run until cancelled or until the listener side of the queue is gone.
    ///
    /// On cancellation the queue is closed and every delivery still in it is
    /// rejected before returning.
    #[tracing::instrument(skip_all, fields(subscription = %self.subscription))]
    pub(super) async fn run<D: Delivery>(
        mut self,
        mut queue: mpsc::Receiver<D>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                delivery = queue.recv() => match delivery {
                    Some(delivery) => self.process(delivery).await,
                    None => {
                        self.hook.on_pipeline_stop(&self.subscription, 0);
                        return;
                    }
                },
            }
        }

        queue.close();
        let mut rejected = 0;
        while let Some(delivery) = queue.recv().await {
            settle(self.hook.as_ref(), delivery, Disposition::Nack).await;
            rejected += 1;
        }
        self.hook.on_pipeline_stop(&self.subscription, rejected);
    }

    async fn process<D: Delivery>(&mut self, delivery: D) {
        self.hook.on_delivery_received(delivery.payload());
        let disposition = self.forward(delivery.payload()).await;
        settle(self.hook.as_ref(), delivery, disposition).await;
    }

    /// Decode, convert and publish `payload`, returning how to settle it.
    async fn forward(&mut self, payload: &[u8]) -> Disposition {
        let message = match guarded("unmarshaller", || (self.unmarshal)(payload)) {
            Ok(Ok(message)) => message,
            Ok(Err(err)) => {
                self.hook.on_unmarshal_error(payload, err.as_ref());
                return Disposition::Ack;
            }
            Err(panic) => {
                self.hook.on_unmarshal_error(payload, panic.as_ref());
                return Disposition::Nack;
            }
        };

        let transaction_id = message.transaction_id().to_owned();
        self.hook.on_transaction(&transaction_id);

        let outbound = match guarded("converter", || (self.convert)(&message)) {
            Ok(Ok(outbound)) => outbound,
            Err(panic) => {
                self.hook.on_conversion_error(&transaction_id, panic.as_ref());
                return Disposition::Nack;
            }
            Ok(Err(err)) => {
                let (partial, cause) = err.into_parts();
                self.hook.on_conversion_error(&transaction_id, cause.as_ref());
                match (self.policy, partial) {
                    (ConversionFailurePolicy::PublishPartial, Some(partial)) => partial,
                    _ => return Disposition::Nack,
                }
            }
        };
        drop(message);

        let envelope = Envelope {
            headers: PublishHeaders::new(self.routing_key.clone(), transaction_id.clone()),
            message: outbound,
        };

        match self.transport.send(envelope).await {
            Ok(()) => {
                self.hook.on_published(&transaction_id, &self.routing_key);
                Disposition::Ack
            }
            Err(err) => {
                self.hook.on_publish_error(&transaction_id, &err);
                Disposition::Nack
            }
        }
    }
}

/// Run an injected step, turning a panic into an error.
///
/// Callers reject the delivery on panic.
fn guarded<R>(step: &str, f: impl FnOnce() -> R) -> Result<R, tower::BoxError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|panic| {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        format!("{step} panicked: {reason}").into()
    })
}

async fn settle<D: Delivery>(hook: &dyn ProcessorHook, delivery: D, disposition: Disposition) {
    if let Err(err) = delivery.settle(disposition).await {
        let err: tower::BoxError = err.into();
        hook.on_settle_error(disposition, err.as_ref());
    }
}
