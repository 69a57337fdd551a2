//! Zone synchronization engine.
//!
//! The engine is a single task that owns every piece of mutable state: the
//! zone registry, the debounce timers and the security aggregator. Edge
//! watchers, settle timers, the dispatcher and external callers only ever
//! talk to it through channels, so no lock is needed around zone state and a
//! debounce commit can never race a resync of the same zone.
//!
//! ```text
//!   GPIO edges ──┐
//!   settle ticks ┤
//!   resync tick ─┼──▶ Engine ──▶ Dispatcher queue ──▶ sender ──▶ webhook
//!   arming tick ─┤        ▲                              │
//!   control ─────┘        └──────── dispatch reports ◀───┘
//! ```

mod sync;

use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::gpio::{GpioPin, GpioPort};
use crate::security::{ArmedState, SecurityAggregator, SecurityState};
use crate::webhooks::{
    DispatchReport, DispatchSender, DispatchSettings, Dispatcher, WebhookTransport,
};
use crate::zones::{ContactState, Debouncer, SettleTick, ZoneRegistry};
use log::{debug, error, info};
use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Requests from outside the engine task.
#[derive(Debug)]
enum Control {
    Arming(ArmedState),
    Resync,
    Snapshot(oneshot::Sender<EngineSnapshot>),
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneSnapshot {
    pub pin: GpioPin,
    pub accessory_id: String,
    pub logical_state: Option<ContactState>,
    pub last_sent_state: Option<ContactState>,
    /// A new reading is waiting out the debounce window.
    pub settling: bool,
}

/// Point-in-time view of the engine state.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub zones: Vec<ZoneSnapshot>,
    pub security: SecurityState,
    pub armed: ArmedState,
    pub pending_jobs: usize,
}

impl EngineSnapshot {
    pub fn zone(&self, accessory_id: &str) -> Option<&ZoneSnapshot> {
        self.zones.iter().find(|z| z.accessory_id == accessory_id)
    }
}

/// Cloneable handle for talking to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Control>,
}

impl EngineHandle {
    /// Feed an arming state from an external source.
    pub fn report_arming(&self, armed: ArmedState) -> bool {
        self.tx.send(Control::Arming(armed)).is_ok()
    }

    /// Run a full resync now instead of waiting for the next interval.
    pub fn resync_now(&self) -> bool {
        self.tx.send(Control::Resync).is_ok()
    }

    /// `None` once the engine has stopped.
    pub async fn snapshot(&self) -> Option<EngineSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Control::Snapshot(reply)).ok()?;
        rx.await.ok()
    }
}

pub struct Engine {
    gpio: Arc<dyn GpioPort>,
    registry: ZoneRegistry,
    debouncer: Debouncer,
    settle_rx: mpsc::UnboundedReceiver<SettleTick>,
    security: SecurityAggregator,
    dispatcher: Dispatcher,
    sender: Option<DispatchSender>,
    reports: mpsc::UnboundedReceiver<DispatchReport>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    update_interval: Duration,
    arming_interval: Duration,
}

impl Engine {
    /// Build the engine from validated configuration.
    pub fn new(
        config: &Config,
        gpio: Arc<dyn GpioPort>,
        transport: Arc<dyn WebhookTransport>,
    ) -> Result<(Self, EngineHandle)> {
        let mut registry = ZoneRegistry::new();
        for zone in &config.zones {
            registry.register(zone.pin, zone.id.clone())?;
        }

        let (debouncer, settle_rx) = Debouncer::new(config.debounce_window());
        let (dispatcher, sender, reports) = Dispatcher::new(
            transport,
            DispatchSettings {
                delay: config.dispatch_delay(),
                timeout: config.url_timeout(),
            },
        );
        let (tx, control_rx) = mpsc::unbounded_channel();

        let engine = Self {
            gpio,
            registry,
            debouncer,
            settle_rx,
            security: SecurityAggregator::new(&config.security.id),
            dispatcher,
            sender: Some(sender),
            reports,
            control_rx,
            update_interval: config.update_interval(),
            arming_interval: config.arming_poll_interval(),
        };
        Ok((engine, EngineHandle { tx }))
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Fails only if the GPIO inputs cannot be brought up.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let (edge_tx, mut edge_rx) = mpsc::unbounded_channel();
        // sysfs export blocks while udev settles the new pin
        let gpio = self.gpio.clone();
        let pins = self.registry.pins();
        tokio::task::spawn_blocking(move || bring_up(gpio.as_ref(), &pins, edge_tx))
            .await
            .map_err(|e| BridgeError::IoError(io::Error::other(e.to_string())))??;
        for zone in self.registry.iter() {
            info!(
                "[Engine] {} (header pin {}) -> accessoryId='{}'",
                zone.pin(),
                zone.pin()
                    .header_pin()
                    .map_or_else(|| "?".to_string(), |p| p.to_string()),
                zone.accessory_id()
            );
        }

        let sender_task = self
            .sender
            .take()
            .map(|sender| sender.spawn(shutdown.child_token()));

        let mut resync = tokio::time::interval(self.update_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut arming = self.security.is_enabled().then(|| {
            let mut interval = tokio::time::interval(self.arming_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        info!(
            "[Engine] running: {} zone(s), resync every {:?}, debounce {:?}, security {}",
            self.registry.len(),
            self.update_interval,
            self.debouncer.window(),
            self.security.accessory_id().unwrap_or("disabled")
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(pin) = edge_rx.recv() => self.handle_edge(pin),
                Some(tick) = self.settle_rx.recv() => self.handle_settle(tick),
                Some(report) = self.reports.recv() => self.handle_report(report),
                Some(control) = self.control_rx.recv() => self.handle_control(control),
                _ = resync.tick() => self.resync_all(),
                _ = tick_optional(&mut arming) => self.poll_arming(),
            }
        }

        self.tear_down(sender_task).await;
        Ok(())
    }

    async fn tear_down(&mut self, sender_task: Option<JoinHandle<()>>) {
        info!("[Engine] shutting down");
        self.debouncer.cancel_all();
        // releasing joins the edge watcher threads
        let gpio = self.gpio.clone();
        let pins = self.registry.pins();
        let released = tokio::task::spawn_blocking(move || {
            for pin in pins {
                gpio.release(pin);
            }
        });
        if let Err(e) = released.await {
            error!("[Engine] releasing GPIO inputs failed: {}", e);
        }
        let dropped = self.dispatcher.discard_pending();
        if dropped > 0 {
            info!("[Engine] {} pending notification(s) not delivered", dropped);
        }
        if let Some(task) = sender_task
            && let Err(e) = task.await
        {
            error!("[Engine] dispatcher task failed: {}", e);
        }
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Arming(armed) => self.security.set_armed(armed),
            Control::Resync => self.resync_all(),
            Control::Snapshot(reply) => {
                if reply.send(self.snapshot()).is_err() {
                    debug!("[Engine] snapshot requester went away");
                }
            }
        }
    }

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            zones: self
                .registry
                .iter()
                .map(|zone| ZoneSnapshot {
                    pin: zone.pin(),
                    accessory_id: zone.accessory_id().to_string(),
                    logical_state: zone.logical_state,
                    last_sent_state: zone.last_sent_state,
                    settling: self.debouncer.is_pending(zone.pin()),
                })
                .collect(),
            security: self.security.state(),
            armed: self.security.armed_state(),
            pending_jobs: self.dispatcher.pending(),
        }
    }
}

/// Configure every pin and subscribe to its edges. All or nothing: pins
/// already brought up are released again on failure.
fn bring_up(
    gpio: &dyn GpioPort,
    pins: &[GpioPin],
    edge_tx: mpsc::UnboundedSender<GpioPin>,
) -> Result<()> {
    for (idx, pin) in pins.iter().copied().enumerate() {
        let result = gpio
            .configure_input(pin)
            .and_then(|_| gpio.on_edge(pin, edge_tx.clone()));
        if let Err(e) = result {
            error!("[Engine] failed to bring up {}: {}", pin, e);
            for done in &pins[..idx] {
                gpio.release(*done);
            }
            return Err(e);
        }
    }
    Ok(())
}

async fn tick_optional(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
