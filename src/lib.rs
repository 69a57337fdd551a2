//! Alarm bridge library.
//!
//! Mirrors wired alarm zones (door and window contacts on GPIO inputs) to a
//! home-automation webhook endpoint. Raw edges are debounced into logical
//! zone states, every change is delivered through a single serialized
//! dispatcher, and a periodic resync repairs anything a lost interrupt or a
//! failed call left out of step. An optional security-system accessory is
//! latched to "triggered" when any zone opens while armed.

pub mod config;
pub mod engine;
pub mod error;
pub mod gpio;
pub mod instance_lock;
pub mod pins;
pub mod security;
pub mod webhooks;
pub mod zones;
