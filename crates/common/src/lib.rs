pub mod types;

pub use types::{CorrelationId, ScheduleToken};
