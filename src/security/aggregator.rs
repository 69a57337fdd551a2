//! Derived "security triggered" signal.
//!
//! A one-way latch: a zone opening while the system is armed moves the
//! aggregator from `Idle` to `Triggered` and yields a single critical update
//! for the security accessory. Closing zones never clears it; only an
//! external arming report does.
//!
//! The cached arming state can lag behind the panel by up to one poll
//! interval. A zone that opens while the cache says `Off` is therefore held
//! as unconfirmed and a critical arming check is queued; the answer to that
//! check decides whether it triggers.

use super::arming::{ArmedState, SecurityMode};
use crate::webhooks::{DispatchJob, UpdateRequest, Urgency};
use crate::zones::ContactState;
use log::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SecurityState {
    #[default]
    Idle,
    Triggered,
}

/// Whether the upstream accessory has the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sending,
    Delivered,
    Failed,
}

#[derive(Debug)]
pub struct SecurityAggregator {
    accessory_id: Option<String>,
    armed: ArmedState,
    state: SecurityState,
    delivery: Option<Delivery>,
    /// Zones that opened while the cached arming state was `Off`.
    unconfirmed: Vec<String>,
}

impl SecurityAggregator {
    /// An empty accessory id disables the feature.
    pub fn new(accessory_id: &str) -> Self {
        let accessory_id = accessory_id.trim();
        Self {
            accessory_id: (!accessory_id.is_empty()).then(|| accessory_id.to_string()),
            armed: ArmedState::Off,
            state: SecurityState::Idle,
            delivery: None,
            unconfirmed: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.accessory_id.is_some()
    }

    pub fn accessory_id(&self) -> Option<&str> {
        self.accessory_id.as_deref()
    }

    pub fn armed_state(&self) -> ArmedState {
        self.armed
    }

    pub fn state(&self) -> SecurityState {
        self.state
    }

    pub fn set_armed(&mut self, armed: ArmedState) {
        if !self.is_enabled() {
            return;
        }
        if self.armed != armed {
            info!("[Security] arming state {} -> {}", self.armed, armed);
        }
        self.armed = armed;
        if armed == ArmedState::Off {
            self.clear("disarmed");
        }
    }

    /// Apply the mode read back from the security accessory.
    ///
    /// `Triggered` upstream latches without emitting. Another armed mode
    /// while latched means the alarm was reset upstream, but only once the
    /// upstream has actually received our trigger.
    pub fn observe_upstream(&mut self, mode: SecurityMode) {
        if !self.is_enabled() {
            return;
        }
        debug!("[Security] upstream reports {}", mode);
        self.set_armed(mode.armed_state());
        match mode {
            SecurityMode::Triggered => {
                self.state = SecurityState::Triggered;
                self.delivery = Some(Delivery::Delivered);
            }
            SecurityMode::Off => {}
            _ if self.delivery == Some(Delivery::Delivered) => self.clear("reset upstream"),
            _ => {
                if self.state == SecurityState::Triggered {
                    debug!("[Security] upstream reports {} before our trigger landed", mode);
                }
            }
        }
    }

    /// Feed a committed zone state.
    ///
    /// Returns the trigger update when the zone opened while armed, or an
    /// arming check when the cached state says `Off` and needs confirming.
    pub fn on_zone_state(&mut self, zone: &str, state: ContactState) -> Option<DispatchJob> {
        let accessory_id = self.accessory_id.clone()?;
        if state != ContactState::Open {
            return None;
        }
        if self.state == SecurityState::Triggered {
            debug!("[Security] already triggered, zone '{}' opened", zone);
            return None;
        }

        if self.armed == ArmedState::Armed {
            return Some(DispatchJob::Update(self.latch(zone)));
        }

        if !self.unconfirmed.iter().any(|z| z == zone) {
            self.unconfirmed.push(zone.to_string());
        }
        debug!(
            "[Security] zone '{}' opened while believed {}, checking '{}'",
            zone, self.armed, accessory_id
        );
        Some(DispatchJob::QuerySecurity {
            accessory_id,
            urgency: Urgency::Critical,
        })
    }

    /// Answer to an arming query; `None` when the query failed.
    ///
    /// Decides the zones that opened while unconfirmed. A failed query
    /// leaves them judged against the last known arming state.
    pub fn on_arming_report(&mut self, mode: Option<SecurityMode>) -> Option<UpdateRequest> {
        if !self.is_enabled() {
            return None;
        }
        let waiting = std::mem::take(&mut self.unconfirmed);
        match mode {
            Some(mode) => self.observe_upstream(mode),
            None if !waiting.is_empty() => warn!(
                "[Security] arming check failed, {} zone opening(s) judged as {}",
                waiting.len(),
                self.armed
            ),
            None => {}
        }

        let zone = waiting.first()?;
        if self.armed == ArmedState::Off || self.state == SecurityState::Triggered {
            return None;
        }
        Some(self.latch(zone))
    }

    /// Outcome of sending the trigger update.
    pub fn on_trigger_result(&mut self, delivered: bool) {
        if self.state != SecurityState::Triggered {
            return;
        }
        if delivered {
            self.delivery = Some(Delivery::Delivered);
        } else {
            warn!("[Security] trigger not delivered, will retry on the next resync");
            self.delivery = Some(Delivery::Failed);
        }
    }

    /// Re-issue a trigger whose delivery failed.
    pub fn retry_trigger(&mut self) -> Option<UpdateRequest> {
        if self.state != SecurityState::Triggered || self.delivery != Some(Delivery::Failed) {
            return None;
        }
        let accessory_id = self.accessory_id.as_deref()?;
        info!("[Security] re-sending trigger for '{}'", accessory_id);
        self.delivery = Some(Delivery::Sending);
        Some(UpdateRequest::security_triggered(accessory_id))
    }

    fn latch(&mut self, zone: &str) -> UpdateRequest {
        let accessory_id = self.accessory_id.as_deref().unwrap_or_default();
        warn!(
            "[Security] zone '{}' opened while armed, triggering '{}'",
            zone, accessory_id
        );
        self.state = SecurityState::Triggered;
        self.delivery = Some(Delivery::Sending);
        UpdateRequest::security_triggered(accessory_id)
    }

    fn clear(&mut self, reason: &str) {
        if self.state == SecurityState::Triggered {
            info!("[Security] trigger cleared ({})", reason);
        }
        self.state = SecurityState::Idle;
        self.delivery = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhooks::TargetState;

    fn armed(id: &str) -> SecurityAggregator {
        let mut aggregator = SecurityAggregator::new(id);
        aggregator.set_armed(ArmedState::Armed);
        aggregator
    }

    fn trigger_of(job: Option<DispatchJob>) -> UpdateRequest {
        match job {
            Some(DispatchJob::Update(request)) => request,
            other => panic!("expected a trigger, got {:?}", other),
        }
    }

    #[test]
    fn test_open_while_armed_triggers_once() {
        let mut aggregator = armed("alarm");

        let request = trigger_of(aggregator.on_zone_state("zone1", ContactState::Open));
        assert_eq!(request.target_accessory_id, "alarm");
        assert_eq!(request.target_state, TargetState::Triggered);
        assert_eq!(request.urgency, Urgency::Critical);
        assert_eq!(aggregator.state(), SecurityState::Triggered);

        // second zone opening is idempotent
        assert!(aggregator.on_zone_state("zone2", ContactState::Open).is_none());
    }

    #[test]
    fn test_latch_survives_zone_closing() {
        let mut aggregator = armed("alarm");
        aggregator.on_zone_state("zone1", ContactState::Open);
        assert!(aggregator.on_zone_state("zone1", ContactState::Closed).is_none());
        assert_eq!(aggregator.state(), SecurityState::Triggered);
    }

    #[test]
    fn test_disarmed_open_asks_for_confirmation() {
        let mut aggregator = SecurityAggregator::new("alarm");
        match aggregator.on_zone_state("zone1", ContactState::Open) {
            Some(DispatchJob::QuerySecurity {
                accessory_id,
                urgency,
            }) => {
                assert_eq!(accessory_id, "alarm");
                assert_eq!(urgency, Urgency::Critical);
            }
            other => panic!("expected an arming check, got {:?}", other),
        }
        assert_eq!(aggregator.state(), SecurityState::Idle);

        // still off upstream: inhibited
        assert!(aggregator.on_arming_report(Some(SecurityMode::Off)).is_none());
        assert_eq!(aggregator.state(), SecurityState::Idle);
    }

    #[test]
    fn test_confirmed_arming_triggers_held_opening() {
        let mut aggregator = SecurityAggregator::new("alarm");
        aggregator.on_zone_state("zone1", ContactState::Open);
        aggregator.on_zone_state("zone2", ContactState::Open);

        let request = aggregator
            .on_arming_report(Some(SecurityMode::Away))
            .expect("trigger");
        assert_eq!(request.target_state, TargetState::Triggered);
        assert_eq!(aggregator.state(), SecurityState::Triggered);

        // held openings were consumed by that answer
        assert!(aggregator.on_arming_report(Some(SecurityMode::Away)).is_none());
    }

    #[test]
    fn test_failed_check_uses_last_known_state() {
        let mut aggregator = SecurityAggregator::new("alarm");
        aggregator.on_zone_state("zone1", ContactState::Open);
        assert!(aggregator.on_arming_report(None).is_none());
        assert_eq!(aggregator.state(), SecurityState::Idle);
    }

    #[test]
    fn test_disabled_feature() {
        let mut aggregator = SecurityAggregator::new("");
        aggregator.set_armed(ArmedState::Armed);
        aggregator.observe_upstream(SecurityMode::Away);
        assert!(!aggregator.is_enabled());
        assert_eq!(aggregator.armed_state(), ArmedState::Off);
        assert!(aggregator.on_zone_state("zone1", ContactState::Open).is_none());
        assert!(aggregator.on_arming_report(Some(SecurityMode::Away)).is_none());
    }

    #[test]
    fn test_external_clearing() {
        let mut aggregator = armed("alarm");
        aggregator.on_zone_state("zone1", ContactState::Open);
        aggregator.on_trigger_result(true);

        // still triggered upstream: stays latched
        aggregator.observe_upstream(SecurityMode::Triggered);
        assert_eq!(aggregator.state(), SecurityState::Triggered);

        // operator reset the alarm upstream
        aggregator.observe_upstream(SecurityMode::Away);
        assert_eq!(aggregator.state(), SecurityState::Idle);
        assert!(aggregator.on_zone_state("zone1", ContactState::Open).is_some());

        aggregator.set_armed(ArmedState::Off);
        assert_eq!(aggregator.state(), SecurityState::Idle);
    }

    #[test]
    fn test_unacknowledged_trigger_is_not_reset() {
        let mut aggregator = armed("alarm");
        aggregator.on_zone_state("zone1", ContactState::Open);

        // an arming poll answered before the trigger call finished
        aggregator.observe_upstream(SecurityMode::Away);
        assert_eq!(aggregator.state(), SecurityState::Triggered);
        assert!(aggregator.retry_trigger().is_none());
    }

    #[test]
    fn test_failed_trigger_is_retried() {
        let mut aggregator = armed("alarm");
        aggregator.on_zone_state("zone1", ContactState::Open);
        aggregator.on_trigger_result(false);

        aggregator.observe_upstream(SecurityMode::Away);
        assert_eq!(aggregator.state(), SecurityState::Triggered);

        let retry = aggregator.retry_trigger().expect("retry");
        assert_eq!(retry.target_state, TargetState::Triggered);
        // only one retry in flight at a time
        assert!(aggregator.retry_trigger().is_none());

        aggregator.on_trigger_result(true);
        aggregator.observe_upstream(SecurityMode::Away);
        assert_eq!(aggregator.state(), SecurityState::Idle);
    }

    #[test]
    fn test_upstream_trigger_latches_silently() {
        let mut aggregator = SecurityAggregator::new("alarm");
        aggregator.observe_upstream(SecurityMode::Triggered);
        assert_eq!(aggregator.state(), SecurityState::Triggered);
        assert_eq!(aggregator.armed_state(), ArmedState::Armed);
        assert!(aggregator.on_zone_state("zone1", ContactState::Open).is_none());
        assert!(aggregator.retry_trigger().is_none());
    }
}
