use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    processor::{ListenerError, ProcessorHook},
    source::Subscription,
};

/// Drives the subscription's pull loop and reports its failure.
pub(super) struct Listener<Sub> {
    pub(super) subscription: Sub,
    pub(super) errors: mpsc::Sender<ListenerError>,
    pub(super) hook: Arc<dyn ProcessorHook>,
}

impl<Sub: Subscription> Listener<Sub> {
    /// Pull until cancelled, until the subscription fails, or until the
    /// pipeline stops taking deliveries.
    ///
    /// A failure is reported to the hook and sent once on the error sink. The
    /// send gives up if the processor is cancelled while the sink is full.
    /// The subscription is dropped on return.
    pub(super) async fn run(
        self,
        handoff: mpsc::Sender<Sub::Delivery>,
        cancel: CancellationToken,
    ) {
        let name = self.subscription.name().to_owned();
        self.hook.on_listener_start(&name);

        let outcome = pull(&self.subscription, handoff, &cancel).await;

        match outcome {
            Ok(()) => self.hook.on_listener_stop(&name),
            Err(err) => {
                let err = ListenerError::new(name.as_str(), err);
                self.hook.on_listener_error(&name, &err);
                tokio::select! {
                    _ = self.errors.send(err) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }
    }
}

/// Run `receive`, stopping it early if the pipeline end of the queue closes
/// while the processor is still live.
async fn pull<Sub: Subscription>(
    subscription: &Sub,
    handoff: mpsc::Sender<Sub::Delivery>,
    cancel: &CancellationToken,
) -> Result<(), tower::BoxError> {
    let queue = handoff.clone();
    let receiving = cancel.child_token();
    let mut receive = subscription.receive(handoff, receiving.clone());

    tokio::select! {
        result = &mut receive => result.map_err(Into::<tower::BoxError>::into),
        _ = queue.closed() => {
            // Deliveries caught mid-handoff are rejected by `hand_off`.
            receiving.cancel();
            receive.await.map_err(Into::<tower::BoxError>::into)?;
            if cancel.is_cancelled() {
                Ok(())
            } else {
                Err("pipeline stopped while the subscription was live".into())
            }
        }
    }
}
