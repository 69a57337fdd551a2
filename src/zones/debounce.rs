//! Cancellable per-pin settle timers.
//!
//! Scheduling a settle for a pin cancels whatever was pending for it, so at
//! most one timer per pin is ever live. Each schedule gets a fresh generation
//! number; a tick that was already in flight when it got superseded carries a
//! stale generation and is rejected by [`Debouncer::complete`].

use crate::gpio::GpioPin;
use log::trace;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Fired when a pin has been quiet for the full debounce window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleTick {
    pub pin: GpioPin,
    pub generation: u64,
}

struct PendingSettle {
    generation: u64,
    task: JoinHandle<()>,
}

pub struct Debouncer {
    window: Duration,
    pending: HashMap<GpioPin, PendingSettle>,
    next_generation: u64,
    ticks: mpsc::UnboundedSender<SettleTick>,
}

impl Debouncer {
    /// Create a debouncer and the receiver its settle ticks arrive on.
    pub fn new(window: Duration) -> (Self, mpsc::UnboundedReceiver<SettleTick>) {
        let (ticks, rx) = mpsc::unbounded_channel();
        let debouncer = Self {
            window,
            pending: HashMap::new(),
            next_generation: 0,
            ticks,
        };
        (debouncer, rx)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Start (or restart) the quiet interval for `pin`.
    pub fn schedule(&mut self, pin: GpioPin) {
        self.cancel(pin);

        self.next_generation += 1;
        let generation = self.next_generation;
        let window = self.window;
        let ticks = self.ticks.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = ticks.send(SettleTick { pin, generation });
        });

        trace!("[Zone] settle #{} scheduled for {}", generation, pin);
        self.pending.insert(pin, PendingSettle { generation, task });
    }

    /// Drop the pending settle for `pin`. Returns whether one was pending.
    pub fn cancel(&mut self, pin: GpioPin) -> bool {
        match self.pending.remove(&pin) {
            Some(pending) => {
                pending.task.abort();
                trace!("[Zone] settle #{} for {} cancelled", pending.generation, pin);
                true
            }
            None => false,
        }
    }

    /// Accept a tick if it belongs to the live schedule for its pin.
    pub fn complete(&mut self, tick: SettleTick) -> bool {
        match self.pending.get(&tick.pin) {
            Some(pending) if pending.generation == tick.generation => {
                self.pending.remove(&tick.pin);
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self, pin: GpioPin) -> bool {
        self.pending.contains_key(&pin)
    }

    pub fn cancel_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.task.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
