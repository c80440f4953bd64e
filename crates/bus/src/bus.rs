use std::time::Duration;

use async_trait::async_trait;
use common::ScheduleToken;
use tokio::sync::mpsc;

use crate::{Message, Result};

/// A live subscription to a message type or queue.
///
/// Messages arrive in delivery order for the subscription; the stream ends
/// when the bus side is dropped.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    /// Creates a subscription from the receiving half of a channel.
    pub fn new(receiver: mpsc::UnboundedReceiver<Message>) -> Self {
        Self { receiver }
    }

    /// Receives the next message, or `None` once the bus side is closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

/// Core trait for message bus implementations.
///
/// Delivery semantics are at-least-once with no ordering guarantee across
/// distinct correlation ids. All implementations must be thread-safe.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes an event to every subscriber of its message type.
    async fn publish(&self, message: Message) -> Result<()>;

    /// Sends a message to a named queue.
    async fn send(&self, queue: &str, message: Message) -> Result<()>;

    /// Schedules a message for delivery to a queue after `delay`.
    ///
    /// Returns a token that can be used to cancel the delivery before it
    /// becomes due.
    async fn schedule_send(
        &self,
        queue: &str,
        message: Message,
        delay: Duration,
    ) -> Result<ScheduleToken>;

    /// Cancels a scheduled delivery.
    ///
    /// Cancelling a token that is unknown or has already fired is a
    /// harmless no-op.
    async fn cancel_scheduled(&self, token: ScheduleToken) -> Result<()>;

    /// Subscribes to all events published with the given message type.
    async fn subscribe(&self, message_type: &str) -> Result<Subscription>;

    /// Subscribes to all messages sent to the given queue.
    async fn subscribe_queue(&self, queue: &str) -> Result<Subscription>;
}
