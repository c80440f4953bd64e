//! Keyed batch consumption.
//!
//! Items are buffered into one open window per key and handed to a
//! [`BatchHandler`] when the window fills to its count limit or its time
//! limit elapses, whichever comes first.

pub mod consumer;
pub mod error;

pub use consumer::{BatchConfig, BatchConsumer, BatchHandler};
pub use error::{BatchError, Result};
