use crate::source::Disposition;

/// Hook trait for observing processor lifecycle and per-message events.
///
/// The processor never logs directly; every diagnostic goes through the hook
/// it was built with. Hooks are invoked synchronously from the listener and
/// pipeline tasks and should avoid heavy or blocking work.
pub trait ProcessorHook: Send + Sync {
    fn on_listener_start(&self, subscription: &str);
    fn on_listener_stop(&self, subscription: &str);
    fn on_listener_error(&self, subscription: &str, error: &dyn std::error::Error);
    fn on_delivery_received(&self, payload: &[u8]);
    fn on_unmarshal_error(&self, payload: &[u8], error: &dyn std::error::Error);
    fn on_transaction(&self, transaction_id: &str);
    fn on_conversion_error(&self, transaction_id: &str, error: &dyn std::error::Error);
    fn on_publish_error(&self, transaction_id: &str, error: &dyn std::error::Error);
    fn on_published(&self, transaction_id: &str, routing_key: &str);
    fn on_settle_error(&self, disposition: Disposition, error: &dyn std::error::Error);
    fn on_pipeline_stop(&self, subscription: &str, rejected_on_drain: usize);
    fn on_close_error(&self, resource: &str, error: &dyn std::error::Error);
}

/// Default processor hook implementation.
///
/// Logs events using `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultProcessorHook;

impl ProcessorHook for DefaultProcessorHook {
    fn on_listener_start(&self, subscription: &str) {
        tracing::info!(subscription, "Launching subscription listener");
    }

    fn on_listener_stop(&self, subscription: &str) {
        tracing::info!(subscription, "Subscription listener stopped");
    }

    fn on_listener_error(&self, subscription: &str, error: &dyn std::error::Error) {
        tracing::error!(subscription, %error, "Subscription listener failed");
    }

    fn on_delivery_received(&self, payload: &[u8]) {
        tracing::debug!(payload = %String::from_utf8_lossy(payload), "Got message");
    }

    fn on_unmarshal_error(&self, payload: &[u8], error: &dyn std::error::Error) {
        tracing::error!(
            payload = %String::from_utf8_lossy(payload),
            %error,
            "Error unmarshalling message, dropping it",
        );
    }

    fn on_transaction(&self, transaction_id: &str) {
        tracing::debug!(tx_id = transaction_id, "Processing message");
    }

    fn on_conversion_error(&self, transaction_id: &str, error: &dyn std::error::Error) {
        tracing::error!(tx_id = transaction_id, %error, "Failed to convert message");
    }

    fn on_publish_error(&self, transaction_id: &str, error: &dyn std::error::Error) {
        tracing::error!(tx_id = transaction_id, %error, "Failed to publish message");
    }

    fn on_published(&self, transaction_id: &str, routing_key: &str) {
        tracing::info!(tx_id = transaction_id, routing_key, "Message published");
    }

    fn on_settle_error(&self, disposition: Disposition, error: &dyn std::error::Error) {
        tracing::error!(%disposition, %error, "Failed to settle delivery");
    }

    fn on_pipeline_stop(&self, subscription: &str, rejected_on_drain: usize) {
        tracing::info!(subscription, rejected_on_drain, "Pipeline stopped");
    }

    fn on_close_error(&self, resource: &str, error: &dyn std::error::Error) {
        tracing::error!(resource, %error, "Error closing resource during shutdown");
    }
}
