use crate::gpio::GpioPin;
use std::time::Duration;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown GPIO pin: {0}")]
    UnknownPin(GpioPin),

    #[error("Webhook request for '{accessory_id}' timed out after {timeout:?}")]
    DispatchTimeout {
        accessory_id: String,
        timeout: Duration,
    },

    #[error("Webhook request for '{accessory_id}' failed: {reason}")]
    DispatchTransport {
        accessory_id: String,
        reason: String,
    },

    #[error("Failed to read {pin}: {source}")]
    HardwareRead {
        pin: GpioPin,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid security response: {0}")]
    InvalidSecurityState(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

impl BridgeError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        BridgeError::Configuration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
