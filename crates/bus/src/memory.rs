use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::ScheduleToken;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;

use crate::{
    Message, Result,
    bus::{MessageBus, Subscription},
};

/// In-memory message bus implementation for testing.
///
/// Fan-out is done over unbounded channels per message type and queue.
/// Published and sent messages are additionally recorded so tests can
/// inspect exactly what crossed the bus. Scheduled sends run on tokio
/// timers and honour `tokio::time::pause`.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    topic_subscribers: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>,
    queue_subscribers: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>,
    published: RwLock<Vec<Message>>,
    sent: RwLock<HashMap<String, Vec<Message>>>,
    scheduled: RwLock<HashMap<ScheduleToken, JoinHandle<()>>>,
}

impl InMemoryBus {
    /// Creates a new empty in-memory bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all events published so far, in publish order.
    pub async fn published(&self) -> Vec<Message> {
        self.inner.published.read().await.clone()
    }

    /// Returns all published events of the given message type.
    pub async fn published_of_type(&self, message_type: &str) -> Vec<Message> {
        self.inner
            .published
            .read()
            .await
            .iter()
            .filter(|m| m.message_type == message_type)
            .cloned()
            .collect()
    }

    /// Returns all messages sent to a queue, in send order.
    pub async fn sent_to(&self, queue: &str) -> Vec<Message> {
        self.inner
            .sent
            .read()
            .await
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the number of scheduled deliveries that have not yet fired
    /// or been cancelled.
    pub async fn scheduled_count(&self) -> usize {
        self.inner.scheduled.read().await.len()
    }

    async fn deliver(
        subscribers: &RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>,
        key: &str,
        message: &Message,
    ) {
        let mut map = subscribers.write().await;
        if let Some(senders) = map.get_mut(key) {
            // Prune subscribers whose receivers were dropped.
            senders.retain(|tx| tx.send(message.clone()).is_ok());
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, message: Message) -> Result<()> {
        Self::deliver(
            &self.inner.topic_subscribers,
            &message.message_type,
            &message,
        )
        .await;
        self.inner.published.write().await.push(message);
        Ok(())
    }

    async fn send(&self, queue: &str, message: Message) -> Result<()> {
        Self::deliver(&self.inner.queue_subscribers, queue, &message).await;
        self.inner
            .sent
            .write()
            .await
            .entry(queue.to_string())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn schedule_send(
        &self,
        queue: &str,
        message: Message,
        delay: Duration,
    ) -> Result<ScheduleToken> {
        let token = ScheduleToken::new();
        let bus = self.clone();
        let queue = queue.to_string();

        // The handle goes into the map before the task can reach its own
        // cleanup, so a zero-delay fire cannot race the insert.
        let mut scheduled = self.inner.scheduled.write().await;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = bus.send(&queue, message).await {
                tracing::error!(error = %e, queue = %queue, "scheduled send failed");
            }
            bus.inner.scheduled.write().await.remove(&token);
        });
        scheduled.insert(token, handle);
        Ok(token)
    }

    async fn cancel_scheduled(&self, token: ScheduleToken) -> Result<()> {
        if let Some(handle) = self.inner.scheduled.write().await.remove(&token) {
            handle.abort();
        }
        Ok(())
    }

    async fn subscribe(&self, message_type: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .topic_subscribers
            .write()
            .await
            .entry(message_type.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }

    async fn subscribe_queue(&self, queue: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .queue_subscribers
            .write()
            .await
            .entry(queue.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }
}
