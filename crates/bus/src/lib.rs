//! Message bus abstraction for the saga orchestration engine.
//!
//! The engine only needs four primitives from its transport: publish an
//! event, send a message to a queue, schedule a message for future delivery,
//! and subscribe to a stream of messages. Delivery is at-least-once with no
//! ordering guarantee across distinct correlation ids; everything stronger
//! is built on top by the engine.

pub mod bus;
pub mod error;
pub mod memory;
pub mod message;

pub use bus::{MessageBus, Subscription};
pub use error::{BusError, Result};
pub use memory::InMemoryBus;
pub use message::Message;
