//! Compensating activity execution over routing slips.
//!
//! A routing slip carries an ordered itinerary of named activities. The
//! executor runs their forward actions in order, keeping each completion's
//! compensation log on an explicit stack; when a forward action fails, the
//! stack is unwound in strict reverse order, best effort.

pub mod activity;
pub mod error;
pub mod executor;
pub mod slip;

pub use activity::Activity;
pub use error::{ActivityError, CourierError, Result};
pub use executor::{CompensationFailure, RoutingSlipExecutor, SlipOutcome};
pub use slip::{ActivityLog, ItineraryStep, RoutingSlip, RoutingSlipBuilder};
