//! In-memory GPIO backend.
//!
//! Pins start `High` (contact closed). Tests drive levels with
//! [`SimulatedGpio::set_level`], which emits an edge like real hardware, or
//! with [`SimulatedGpio::set_level_silently`] to model a missed interrupt.

use super::{GpioPin, GpioPort, Level};
use crate::error::{BridgeError, Result};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use tokio::sync::mpsc;

struct SimPin {
    level: Level,
    configured: bool,
    failing: bool,
    subscriber: Option<mpsc::UnboundedSender<GpioPin>>,
}

impl Default for SimPin {
    fn default() -> Self {
        Self {
            level: Level::High,
            configured: false,
            failing: false,
            subscriber: None,
        }
    }
}

#[derive(Default)]
pub struct SimulatedGpio {
    pins: Mutex<HashMap<GpioPin, SimPin>>,
}

impl SimulatedGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Change the level and emit an edge if it changed.
    pub fn set_level(&self, pin: GpioPin, level: Level) {
        let mut pins = self.pins.lock();
        let sim = pins.entry(pin).or_default();
        if sim.level == level {
            return;
        }
        sim.level = level;
        if let Some(tx) = &sim.subscriber {
            debug!("[GPIO] simulated edge on {} -> {}", pin, level);
            let _ = tx.send(pin);
        }
    }

    /// Change the level without emitting an edge.
    pub fn set_level_silently(&self, pin: GpioPin, level: Level) {
        self.pins.lock().entry(pin).or_default().level = level;
    }

    /// Emit an edge without changing the level (contact bounce).
    pub fn glitch(&self, pin: GpioPin) {
        if let Some(tx) = self.pins.lock().get(&pin).and_then(|p| p.subscriber.as_ref()) {
            let _ = tx.send(pin);
        }
    }

    /// Make reads of `pin` fail until cleared.
    pub fn fail_reads(&self, pin: GpioPin, failing: bool) {
        self.pins.lock().entry(pin).or_default().failing = failing;
    }

    pub fn is_configured(&self, pin: GpioPin) -> bool {
        self.pins.lock().get(&pin).is_some_and(|p| p.configured)
    }

    pub fn is_watched(&self, pin: GpioPin) -> bool {
        self.pins
            .lock()
            .get(&pin)
            .is_some_and(|p| p.subscriber.is_some())
    }
}

impl GpioPort for SimulatedGpio {
    fn configure_input(&self, pin: GpioPin) -> Result<()> {
        self.pins.lock().entry(pin).or_default().configured = true;
        Ok(())
    }

    fn read(&self, pin: GpioPin) -> Result<Level> {
        let pins = self.pins.lock();
        let sim = pins.get(&pin).ok_or(BridgeError::UnknownPin(pin))?;
        if sim.failing {
            return Err(BridgeError::HardwareRead {
                pin,
                source: io::Error::other("simulated read failure"),
            });
        }
        Ok(sim.level)
    }

    fn on_edge(&self, pin: GpioPin, events: mpsc::UnboundedSender<GpioPin>) -> Result<()> {
        self.pins.lock().entry(pin).or_default().subscriber = Some(events);
        Ok(())
    }

    fn release(&self, pin: GpioPin) {
        if let Some(sim) = self.pins.lock().get_mut(&pin) {
            sim.subscriber = None;
            sim.configured = false;
        }
    }
}
