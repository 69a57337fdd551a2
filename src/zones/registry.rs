//! Static pin -> zone mapping with per-zone runtime state.
//!
//! The mapping is built once at startup and never changes; only the state
//! fields of each [`Zone`] move at runtime.

use crate::error::{BridgeError, Result};
use crate::gpio::{GpioPin, Level};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::time::Instant;

/// Debounced state of a contact loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ContactState {
    /// No contact (loop broken, door/window open).
    Open,
    /// Contact made.
    Closed,
}

impl ContactState {
    /// Inputs use pull-down: a closed loop pulls the pin high.
    pub fn from_level(level: Level) -> Self {
        match level {
            Level::High => ContactState::Closed,
            Level::Low => ContactState::Open,
        }
    }

    /// Webhook `state` parameter: `true` means contact detected.
    pub fn webhook_value(self) -> &'static str {
        match self {
            ContactState::Closed => "true",
            ContactState::Open => "false",
        }
    }
}

/// One alarm zone.
#[derive(Debug, Clone)]
pub struct Zone {
    pin: GpioPin,
    accessory_id: String,
    /// Last debounced state; `None` until the first resync has read the pin.
    pub logical_state: Option<ContactState>,
    /// Last state acknowledged by the webhook endpoint; `None` means unknown.
    pub last_sent_state: Option<ContactState>,
    pub last_change_at: Option<Instant>,
}

impl Zone {
    fn new(pin: GpioPin, accessory_id: String) -> Self {
        Self {
            pin,
            accessory_id,
            logical_state: None,
            last_sent_state: None,
            last_change_at: None,
        }
    }

    pub fn pin(&self) -> GpioPin {
        self.pin
    }

    pub fn accessory_id(&self) -> &str {
        &self.accessory_id
    }

    /// Whether the endpoint may hold a stale view of this zone.
    pub fn needs_report(&self) -> bool {
        self.logical_state.is_some() && self.logical_state != self.last_sent_state
    }
}

#[derive(Debug, Default)]
pub struct ZoneRegistry {
    zones: BTreeMap<GpioPin, Zone>,
}

impl ZoneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pin: GpioPin, accessory_id: impl Into<String>) -> Result<()> {
        let accessory_id = accessory_id.into();
        if accessory_id.trim().is_empty() {
            return Err(BridgeError::config(format!(
                "empty accessory id for {}",
                pin
            )));
        }
        if self.zones.contains_key(&pin) {
            return Err(BridgeError::config(format!("{} mapped twice", pin)));
        }
        self.zones.insert(pin, Zone::new(pin, accessory_id));
        Ok(())
    }

    pub fn get(&self, pin: GpioPin) -> Result<&Zone> {
        self.zones.get(&pin).ok_or(BridgeError::UnknownPin(pin))
    }

    pub fn get_mut(&mut self, pin: GpioPin) -> Result<&mut Zone> {
        self.zones.get_mut(&pin).ok_or(BridgeError::UnknownPin(pin))
    }

    pub fn pins(&self) -> Vec<GpioPin> {
        self.zones.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_register_and_get() {
        let mut registry = ZoneRegistry::new();
        assert_ok!(registry.register(GpioPin::new(17), "zone1"));
        assert_ok!(registry.register(GpioPin::new(27), "zone2"));

        let zone = assert_ok!(registry.get(GpioPin::new(27)));
        assert_eq!(zone.accessory_id(), "zone2");
        assert_eq!(zone.logical_state, None);
        assert_eq!(zone.last_sent_state, None);
        assert_eq!(registry.pins(), vec![GpioPin::new(17), GpioPin::new(27)]);
    }

    #[test]
    fn test_duplicate_pin_rejected() {
        let mut registry = ZoneRegistry::new();
        assert_ok!(registry.register(GpioPin::new(17), "zone1"));
        let err = assert_err!(registry.register(GpioPin::new(17), "other"));
        assert!(matches!(err, BridgeError::Configuration(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_empty_accessory_rejected() {
        let mut registry = ZoneRegistry::new();
        let err = assert_err!(registry.register(GpioPin::new(4), "  "));
        assert!(matches!(err, BridgeError::Configuration(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_pin() {
        let mut registry = ZoneRegistry::new();
        let err = assert_err!(registry.get_mut(GpioPin::new(9)));
        assert!(matches!(err, BridgeError::UnknownPin(pin) if pin == GpioPin::new(9)));
    }

    #[test]
    fn test_needs_report() {
        let mut registry = ZoneRegistry::new();
        assert_ok!(registry.register(GpioPin::new(17), "zone1"));
        let zone = assert_ok!(registry.get_mut(GpioPin::new(17)));
        assert!(!zone.needs_report());

        zone.logical_state = Some(ContactState::Open);
        assert!(zone.needs_report());

        zone.last_sent_state = Some(ContactState::Open);
        assert!(!zone.needs_report());
    }

    #[test]
    fn test_contact_mapping() {
        assert_eq!(ContactState::from_level(Level::High), ContactState::Closed);
        assert_eq!(ContactState::from_level(Level::Low), ContactState::Open);
        assert_eq!(ContactState::Closed.webhook_value(), "true");
        assert_eq!(ContactState::Open.to_string(), "open");
    }
}
