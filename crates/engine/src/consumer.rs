//! Consumer middleware: bounded parallelism, retry and the fault path.
//!
//! Wraps the engine's `handle` call. Transient failures are re-invoked per
//! the retry policy; the outbox defers all side effects until the save
//! commits, so a failed attempt leaves nothing behind. Exhausted or fatal
//! failures are forwarded to the fault queue for inspection.

use std::sync::Arc;

use bus::{Message, MessageBus, Subscription};
use tokio::sync::Semaphore;

use crate::engine::{EngineResult, SagaEngine};
use crate::error::{EngineError, Result};
use crate::retry::RetryPolicy;
use store::SagaStore;

/// Per-consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Maximum number of concurrently in-flight handler invocations.
    pub concurrent_message_limit: usize,

    /// Retry policy for transient failures.
    pub retry_policy: RetryPolicy,

    /// Queue receiving messages that exhausted their retries or failed
    /// fatally.
    pub fault_queue: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrent_message_limit: 20,
            retry_policy: RetryPolicy::default(),
            fault_queue: "saga-faults".to_string(),
        }
    }
}

/// Drives the engine from a bus subscription.
pub struct SagaConsumer<S, B> {
    engine: Arc<SagaEngine<S, B>>,
    config: ConsumerConfig,
    semaphore: Arc<Semaphore>,
}

impl<S, B> Clone for SagaConsumer<S, B> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            config: self.config.clone(),
            semaphore: Arc::clone(&self.semaphore),
        }
    }
}

impl<S, B> SagaConsumer<S, B>
where
    S: SagaStore + 'static,
    B: MessageBus + 'static,
{
    /// Creates a consumer over a shared engine.
    pub fn new(engine: Arc<SagaEngine<S, B>>, config: ConsumerConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrent_message_limit));
        Self {
            engine,
            config,
            semaphore,
        }
    }

    /// Handles one message with retry, under the concurrency bound.
    ///
    /// Returns the engine result of the successful attempt, or the final
    /// error after the message was routed to the fault queue.
    pub async fn consume(&self, message: Message) -> Result<EngineResult> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::ConsumerClosed)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.engine.handle(message.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && self.config.retry_policy.should_retry(attempt) => {
                    let delay = self.config.retry_policy.delay_for_attempt(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        event_type = %message.message_type,
                        "transient failure, retrying"
                    );
                    metrics::counter!("saga_handler_retries").increment(1);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.dead_letter(&message, &e, attempt).await;
                    return Err(e);
                }
            }
        }
    }

    /// Pulls messages from a subscription until it closes, dispatching each
    /// on its own task.
    pub async fn run(&self, mut subscription: Subscription) {
        while let Some(message) = subscription.recv().await {
            let consumer = self.clone();
            tokio::spawn(async move {
                // Faults were already routed inside consume.
                let _ = consumer.consume(message).await;
            });
        }
        tracing::info!("subscription closed, consumer stopping");
    }

    async fn dead_letter(&self, message: &Message, error: &EngineError, attempts: u32) {
        tracing::error!(
            error = %error,
            attempts,
            event_type = %message.message_type,
            fault_queue = %self.config.fault_queue,
            "handler failed, routing to fault queue"
        );
        metrics::counter!("saga_dead_letters").increment(1);

        let mut fault = Message::from_value(
            "Fault",
            serde_json::json!({
                "message": message,
                "error": error.to_string(),
                "attempts": attempts,
            }),
        );
        fault.correlation_id = message.correlation_id;

        if let Err(e) = self.engine.bus().send(&self.config.fault_queue, fault).await {
            tracing::error!(error = %e, "failed to dead-letter message");
        }
    }
}
