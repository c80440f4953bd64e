use common::CorrelationId;
use serde::{Deserialize, Serialize};

/// An immutable, typed message travelling over the bus.
///
/// The payload is carried as JSON so the bus stays agnostic of saga types;
/// consumers deserialize into their own structs. The optional correlation id
/// tags the message with the saga instance it belongs to; events without
/// one rely on a per-event-type extractor registered on the saga definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// The type of the message (e.g. "AllocationCreated").
    pub message_type: String,

    /// The saga instance this message correlates to, if tagged.
    pub correlation_id: Option<CorrelationId>,

    /// The named schedule that delivered this message, when it is the
    /// expiry of a scheduled send.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_name: Option<String>,

    /// The message payload as JSON.
    pub payload: serde_json::Value,
}

impl Message {
    /// Creates a message from a serializable payload.
    pub fn new<T: Serialize>(
        message_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_type: message_type.into(),
            correlation_id: None,
            schedule_name: None,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Creates a message from a raw JSON payload.
    pub fn from_value(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            message_type: message_type.into(),
            correlation_id: None,
            schedule_name: None,
            payload,
        }
    }

    /// Tags the message with a correlation id.
    pub fn correlated(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Tags the message as the expiry of a named schedule.
    pub fn via_schedule(mut self, schedule_name: impl Into<String>) -> Self {
        self.schedule_name = Some(schedule_name.into());
        self
    }

    /// Deserializes the payload into a typed value.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}
