//! Arming state reported by the upstream security-system accessory.

use crate::error::{BridgeError, Result};
use serde_json::Value;

/// Whether zone openings should raise the alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ArmedState {
    #[default]
    Off,
    Armed,
}

/// `currentState` of a HomeKit security system as served by the webhook
/// plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SecurityMode {
    Home,
    Away,
    Night,
    Off,
    Triggered,
}

impl SecurityMode {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(SecurityMode::Home),
            1 => Some(SecurityMode::Away),
            2 => Some(SecurityMode::Night),
            3 => Some(SecurityMode::Off),
            4 => Some(SecurityMode::Triggered),
            _ => None,
        }
    }

    /// Decode the plugin's JSON answer. `currentState` may be a number or a
    /// numeric string.
    pub fn from_response(data: &Value) -> Result<Self> {
        let raw = data
            .get("currentState")
            .ok_or_else(|| BridgeError::InvalidSecurityState(format!("no currentState in {}", data)))?;
        let code = match raw {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        code.and_then(Self::from_code).ok_or_else(|| {
            BridgeError::InvalidSecurityState(format!("currentState {} in {}", raw, data))
        })
    }

    pub fn armed_state(self) -> ArmedState {
        match self {
            SecurityMode::Off => ArmedState::Off,
            SecurityMode::Home
            | SecurityMode::Away
            | SecurityMode::Night
            | SecurityMode::Triggered => ArmedState::Armed,
        }
    }
}
