//! Edge, settle and resync handling: the path from a raw pin reading to a
//! committed zone state and the notifications it causes.

use super::Engine;
use crate::gpio::GpioPin;
use crate::webhooks::{DispatchJob, DispatchReport, TargetState, UpdateRequest, Urgency};
use crate::zones::{ContactState, SettleTick};
use log::{debug, error, info, trace, warn};
use tokio::time::Instant;

impl Engine {
    /// A pin reported an edge. Start (or restart) the quiet interval if the
    /// level disagrees with the zone, drop it if the pin bounced back.
    pub(super) fn handle_edge(&mut self, pin: GpioPin) {
        let logical = match self.registry.get(pin) {
            Ok(zone) => zone.logical_state,
            Err(e) => {
                warn!("[Zone] edge ignored: {}", e);
                return;
            }
        };
        let Some(reading) = self.read_state(pin) else {
            return;
        };

        if Some(reading) != logical {
            trace!("[Zone] {} reads {}, waiting for it to settle", pin, reading);
            self.debouncer.schedule(pin);
        } else if self.debouncer.cancel(pin) {
            debug!("[Zone] {} bounced back to {}", pin, reading);
        }
    }

    /// The quiet interval elapsed without another edge.
    pub(super) fn handle_settle(&mut self, tick: SettleTick) {
        if !self.debouncer.complete(tick) {
            trace!("[Zone] superseded settle #{} for {}", tick.generation, tick.pin);
            return;
        }
        let Ok(zone) = self.registry.get(tick.pin) else {
            return;
        };
        let logical = zone.logical_state;
        let Some(reading) = self.read_state(tick.pin) else {
            return;
        };
        if Some(reading) != logical {
            self.commit(tick.pin, reading);
        }
    }

    /// Read every zone directly, bypassing debounce.
    pub(super) fn resync_all(&mut self) {
        debug!("[Zone] resync of {} zone(s)", self.registry.len());
        for pin in self.registry.pins() {
            self.resync_zone(pin);
        }
        if let Some(trigger) = self.security.retry_trigger() {
            self.dispatcher.enqueue_update(trigger);
        }
    }

    fn resync_zone(&mut self, pin: GpioPin) {
        let Some(reading) = self.read_state(pin) else {
            return;
        };
        let Ok(zone) = self.registry.get(pin) else {
            return;
        };

        if zone.logical_state != Some(reading) {
            if zone.logical_state.is_some() {
                warn!("[Zone] {} found {} on resync, edge was missed", pin, reading);
            }
            self.debouncer.cancel(pin);
            self.commit(pin, reading);
        } else if zone.needs_report() {
            info!(
                "[Zone] re-sending {} for accessoryId='{}'",
                reading,
                zone.accessory_id()
            );
            let request = UpdateRequest::contact(pin, zone.accessory_id(), reading);
            self.dispatcher.enqueue_update(request);
        }
    }

    /// Accept `state` as the zone's logical state and notify.
    fn commit(&mut self, pin: GpioPin, state: ContactState) {
        let Ok(zone) = self.registry.get_mut(pin) else {
            return;
        };
        let previous = zone.logical_state.replace(state);
        zone.last_change_at = Some(Instant::now());
        let accessory_id = zone.accessory_id().to_string();

        match previous {
            Some(previous) => info!(
                "[Zone] {} accessoryId='{}' {} -> {}",
                pin, accessory_id, previous, state
            ),
            None => info!(
                "[Zone] {} accessoryId='{}' initially {}",
                pin, accessory_id, state
            ),
        }

        self.dispatcher
            .enqueue_update(UpdateRequest::contact(pin, &accessory_id, state));
        if let Some(job) = self.security.on_zone_state(&accessory_id, state) {
            self.dispatcher.enqueue(job);
        }
    }

    fn read_state(&self, pin: GpioPin) -> Option<ContactState> {
        match self.gpio.read(pin) {
            Ok(level) => Some(ContactState::from_level(level)),
            Err(e) => {
                error!("[GPIO] {}", e);
                None
            }
        }
    }

    pub(super) fn handle_report(&mut self, report: DispatchReport) {
        match report {
            DispatchReport::Update {
                request,
                result: Ok(()),
            } => match (request.target_state, request.zone) {
                (TargetState::Contact(state), Some(pin)) => {
                    if let Ok(zone) = self.registry.get_mut(pin) {
                        zone.last_sent_state = Some(state);
                    }
                }
                (TargetState::Triggered, _) => {
                    info!("[Security] triggered id='{}'", request.target_accessory_id);
                    self.security.on_trigger_result(true);
                }
                (TargetState::Contact(_), None) => {}
            },
            DispatchReport::Update {
                request,
                result: Err(_),
            } => {
                if request.target_state == TargetState::Triggered {
                    self.security.on_trigger_result(false);
                } else {
                    debug!(
                        "[Zone] '{}' left for the next resync ({:?} after enqueue)",
                        request.target_accessory_id,
                        request.enqueued_at.elapsed()
                    );
                }
            }
            DispatchReport::SecurityState { result, .. } => {
                if let Some(trigger) = self.security.on_arming_report(result.ok()) {
                    self.dispatcher.enqueue_update(trigger);
                }
            }
        }
    }

    pub(super) fn poll_arming(&mut self) {
        if let Some(accessory_id) = self.security.accessory_id() {
            self.dispatcher.enqueue(DispatchJob::QuerySecurity {
                accessory_id: accessory_id.to_string(),
                urgency: Urgency::Normal,
            });
        }
    }
}
