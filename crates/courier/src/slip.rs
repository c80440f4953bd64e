//! Routing slips: an ordered itinerary of activities with their arguments.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One itinerary entry: which activity to run and with what arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItineraryStep {
    /// The registered name of the activity.
    pub activity: String,

    /// Arguments passed to the activity's forward action.
    pub arguments: Value,
}

/// The compensation log of a completed forward action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLog {
    /// The activity that completed.
    pub activity: String,

    /// The data its compensation needs.
    pub data: Value,
}

/// An immutable routing slip: a tracking id and the itinerary to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSlip {
    tracking_id: Uuid,
    itinerary: Vec<ItineraryStep>,
}

impl RoutingSlip {
    /// Starts building a slip with a fresh tracking id.
    pub fn builder() -> RoutingSlipBuilder {
        RoutingSlipBuilder {
            tracking_id: Uuid::new_v4(),
            itinerary: Vec::new(),
        }
    }

    /// The slip's tracking id.
    pub fn tracking_id(&self) -> Uuid {
        self.tracking_id
    }

    /// The itinerary in execution order.
    pub fn itinerary(&self) -> &[ItineraryStep] {
        &self.itinerary
    }
}

/// Builder for [`RoutingSlip`].
pub struct RoutingSlipBuilder {
    tracking_id: Uuid,
    itinerary: Vec<ItineraryStep>,
}

impl RoutingSlipBuilder {
    /// Overrides the generated tracking id.
    pub fn tracking_id(mut self, tracking_id: Uuid) -> Self {
        self.tracking_id = tracking_id;
        self
    }

    /// Appends an activity to the itinerary.
    pub fn add_activity(mut self, activity: impl Into<String>, arguments: Value) -> Self {
        self.itinerary.push(ItineraryStep {
            activity: activity.into(),
            arguments,
        });
        self
    }

    /// Builds the slip.
    pub fn build(self) -> RoutingSlip {
        RoutingSlip {
            tracking_id: self.tracking_id,
            itinerary: self.itinerary,
        }
    }
}
