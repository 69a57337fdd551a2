//! Alarm zones: the pin registry and the debounce timers that decide when a
//! raw reading becomes a zone's logical state.

pub mod debounce;
pub mod registry;

pub use debounce::{Debouncer, SettleTick};
pub use registry::{ContactState, Zone, ZoneRegistry};
