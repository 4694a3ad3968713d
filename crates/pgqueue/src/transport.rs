use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::message::TransportMessage;
use crate::transaction_context::TransactionContext;

/// A queue transport: moves messages between named queues inside the
/// caller's unit of work.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Provision a queue. Backends without per-queue setup do nothing.
    fn create_queue(&self, address: &str);

    /// Enqueue a message for `destination`. The message becomes durable when
    /// `context` is completed.
    async fn send(
        &self,
        destination: &str,
        message: &TransportMessage,
        context: &TransactionContext,
    ) -> Result<(), TransportError>;

    /// Claim the next message addressed to this transport's own queue.
    /// Returns `Ok(None)` when no message is available. The claim becomes
    /// permanent when `context` is completed.
    async fn receive(
        &self,
        context: &TransactionContext,
        cancel: &CancellationToken,
    ) -> Result<Option<TransportMessage>, TransportError>;

    /// The queue this transport receives from; `None` for a send-only transport.
    fn address(&self) -> Option<&str>;
}
