//! Saga orchestration engine.
//!
//! Ties the store and bus crates together: registered saga definitions map
//! `(state, event type)` pairs to transitions, the engine applies them with
//! optimistic concurrency and an outbox, the scheduler arms durable timers,
//! and the consumer drives everything from bus subscriptions with retry.

pub mod consumer;
pub mod definition;
pub mod engine;
pub mod error;
pub mod outbox;
pub mod retry;
pub mod scheduler;

pub use consumer::{ConsumerConfig, SagaConsumer};
pub use definition::{DefinitionError, Effect, SagaDefinition, SagaDefinitionBuilder};
pub use engine::{Disposition, EngineConfig, EngineResult, SagaEngine};
pub use error::{EngineError, Result};
pub use retry::{Backoff, RetryPolicy};
pub use scheduler::Scheduler;
