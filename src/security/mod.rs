//! Security-system aggregation over all zones.

pub mod aggregator;
pub mod arming;

pub use aggregator::{SecurityAggregator, SecurityState};
pub use arming::{ArmedState, SecurityMode};
