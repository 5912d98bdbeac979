use std::{marker::PhantomData, sync::Arc};

use tokio::sync::Mutex;

use crate::{Envelope, transport::Sender};

/// In-memory destination for tests and local pipelines.
///
/// Every "published" envelope is appended to a shared queue. Clones share the
/// same queue, so a test keeps one handle and gives the other to the
/// [`Transport`](crate::transport::Transport) under test.
///
/// ## Type Parameters
///
/// - `H`: type of the message headers
/// - `M`: type of the message payload
pub struct InMemory<H, M> {
    /// Shared message queue
    msg_queue: Arc<Mutex<Vec<Envelope<H, M>>>>,
    _marker: PhantomData<fn() -> (H, M)>,
}

impl<H, M> InMemory<H, M> {
    /// Return all messages published so far and clear the internal queue.
    pub async fn sent_messages(&self) -> Vec<Envelope<H, M>> {
        let mut queue = self.msg_queue.lock().await;
        std::mem::take(&mut *queue)
    }

    /// Number of messages currently held.
    pub async fn len(&self) -> usize {
        self.msg_queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<H, M> Clone for InMemory<H, M> {
    fn clone(&self) -> Self {
        Self {
            msg_queue: Arc::clone(&self.msg_queue),
            _marker: PhantomData,
        }
    }
}

impl<H, M> Default for InMemory<H, M> {
    fn default() -> Self {
        Self {
            msg_queue: Arc::new(Mutex::new(Vec::new())),
            _marker: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<H, M> Sender<H, M> for InMemory<H, M>
where
    H: std::fmt::Debug + Send + 'static,
    M: std::fmt::Debug + Send + 'static,
{
    type Error = std::convert::Infallible;

    /// "Publish" a message by appending it to the in-memory queue.
    #[tracing::instrument(skip_all)]
    async fn send(&mut self, envelope: Envelope<H, M>) -> Result<(), Self::Error> {
        tracing::debug!(
            headers = ?envelope.headers,
            msg = ?envelope.message,
            "Message published to in-memory queue",
        );
        self.msg_queue.lock().await.push(envelope);
        Ok(())
    }
}
