//! Outbound notifications to the webhook endpoint.

mod client;
mod dispatcher;
mod request;

pub use client::{HttpTransport, WebhookTransport};
pub use dispatcher::{DispatchReport, DispatchSender, DispatchSettings, Dispatcher};
pub use request::{DispatchJob, TargetState, UpdateRequest, Urgency};
