//! Jobs handed to the webhook dispatcher.

use crate::gpio::GpioPin;
use crate::zones::ContactState;
use std::fmt;
use tokio::time::Instant;

/// `currentstate` value the webhook plugin uses for an alarm in progress.
pub(crate) const SECURITY_TRIGGERED_CODE: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Urgency {
    Normal,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Contact(ContactState),
    Triggered,
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetState::Contact(state) => write!(f, "{}", state),
            TargetState::Triggered => f.write_str("triggered"),
        }
    }
}

/// Snapshot of a state the endpoint should be told about.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub target_accessory_id: String,
    pub target_state: TargetState,
    pub urgency: Urgency,
    pub enqueued_at: Instant,
    /// Zone whose `last_sent_state` an acknowledgment updates.
    pub zone: Option<GpioPin>,
}

impl UpdateRequest {
    pub fn contact(zone: GpioPin, accessory_id: impl Into<String>, state: ContactState) -> Self {
        Self {
            target_accessory_id: accessory_id.into(),
            target_state: TargetState::Contact(state),
            urgency: Urgency::Normal,
            enqueued_at: Instant::now(),
            zone: Some(zone),
        }
    }

    pub fn security_triggered(accessory_id: impl Into<String>) -> Self {
        Self {
            target_accessory_id: accessory_id.into(),
            target_state: TargetState::Triggered,
            urgency: Urgency::Critical,
            enqueued_at: Instant::now(),
            zone: None,
        }
    }

    /// Same accessory and same desired state.
    pub fn same_target(&self, other: &UpdateRequest) -> bool {
        self.target_accessory_id == other.target_accessory_id
            && self.target_state == other.target_state
    }
}

/// Unit of work for the dispatcher sender.
#[derive(Debug, Clone)]
pub enum DispatchJob {
    Update(UpdateRequest),
    /// Read the security accessory's current state. `Critical` when a zone
    /// opened and the arming state has to be confirmed before deciding.
    QuerySecurity {
        accessory_id: String,
        urgency: Urgency,
    },
}

impl DispatchJob {
    pub fn urgency(&self) -> Urgency {
        match self {
            DispatchJob::Update(request) => request.urgency,
            DispatchJob::QuerySecurity { urgency, .. } => *urgency,
        }
    }

    pub fn accessory_id(&self) -> &str {
        match self {
            DispatchJob::Update(request) => &request.target_accessory_id,
            DispatchJob::QuerySecurity { accessory_id, .. } => accessory_id,
        }
    }

    /// Query string parameters understood by the webhook plugin.
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("accessoryId", self.accessory_id().to_string())];
        if let DispatchJob::Update(request) = self {
            match request.target_state {
                TargetState::Contact(state) => {
                    params.push(("state", state.webhook_value().to_string()));
                }
                TargetState::Triggered => {
                    params.push(("currentstate", SECURITY_TRIGGERED_CODE.to_string()));
                }
            }
        }
        params
    }

    /// Same kind of job for the same accessory. Only the newest pending job
    /// of a subject decides what the endpoint ends up with.
    pub fn same_subject(&self, other: &DispatchJob) -> bool {
        let same_kind = matches!(
            (self, other),
            (DispatchJob::Update(_), DispatchJob::Update(_))
                | (DispatchJob::QuerySecurity { .. }, DispatchJob::QuerySecurity { .. })
        );
        same_kind && self.accessory_id() == other.accessory_id()
    }

    /// Whether queueing `other` right after this job would only repeat it.
    pub fn duplicates(&self, other: &DispatchJob) -> bool {
        match (self, other) {
            (DispatchJob::Update(a), DispatchJob::Update(b)) => a.same_target(b),
            (
                DispatchJob::QuerySecurity {
                    accessory_id: a,
                    urgency: ua,
                },
                DispatchJob::QuerySecurity {
                    accessory_id: b,
                    urgency: ub,
                },
            ) => a == b && ua == ub,
            _ => false,
        }
    }
}
