//! GPIO capability consumed by the zone engine.
//!
//! The engine never talks to hardware directly. It configures inputs, reads
//! levels and receives edge notifications through [`GpioPort`]; edge
//! callbacks are turned into messages on a channel so the engine can handle
//! them on its own task.
//!
//! Backends:
//! - `sysfs`: Linux `/sys/class/gpio` interface
//! - `simulated`: in-memory pins for tests and dry runs

mod simulated;
mod sysfs;

pub use simulated::SimulatedGpio;
pub use sysfs::SysfsGpio;

use crate::error::Result;
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;

/// BCM GPIO number identifying one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct GpioPin(u8);

impl GpioPin {
    pub const fn new(number: u8) -> Self {
        Self(number)
    }

    pub fn number(self) -> u8 {
        self.0
    }

    /// Physical header pin on the Raspberry Pi, if routed.
    pub fn header_pin(self) -> Option<u8> {
        crate::pins::header_pin(self.0)
    }
}

impl fmt::Display for GpioPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPIO{}", self.0)
    }
}

/// Raw electrical level of an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Level {
    #[strum(serialize = "0")]
    Low,
    #[strum(serialize = "1")]
    High,
}

impl Level {
    /// Parse a sysfs style value (`"0"` / `"1"`, trailing newline allowed).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "0" => Some(Level::Low),
            "1" => Some(Level::High),
            _ => None,
        }
    }
}

/// Hardware access needed by the engine.
///
/// Implementations must be usable from the engine task and from their own
/// watcher threads at the same time.
pub trait GpioPort: Send + Sync + 'static {
    /// Configure `pin` as an input with both-edge detection.
    fn configure_input(&self, pin: GpioPin) -> Result<()>;

    /// Read the current level of `pin`.
    fn read(&self, pin: GpioPin) -> Result<Level>;

    /// Deliver every edge on `pin` as a message on `events`.
    ///
    /// Edges are only hints: the receiver re-reads the pin to learn the level.
    fn on_edge(&self, pin: GpioPin, events: mpsc::UnboundedSender<GpioPin>) -> Result<()>;

    /// Stop edge delivery for `pin` and release it.
    fn release(&self, pin: GpioPin);
}
