//! Serialized delivery of webhook jobs.
//!
//! One queue, one sender task. The sender starts consecutive calls at least
//! `delay` apart (start to start, so a slow call is followed immediately) and
//! bounds each call by `timeout`. Failed calls are reported, never retried;
//! the periodic resync re-enqueues whatever the endpoint missed.

use super::client::WebhookTransport;
use super::request::{DispatchJob, UpdateRequest, Urgency};
use crate::error::{BridgeError, Result};
use crate::security::SecurityMode;
use log::{debug, error, info};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of one delivered job, sent back to the engine.
#[derive(Debug)]
pub enum DispatchReport {
    Update {
        request: UpdateRequest,
        result: Result<()>,
    },
    SecurityState {
        accessory_id: String,
        result: Result<SecurityMode>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    /// Minimum spacing between the start of consecutive calls.
    pub delay: Duration,
    /// Upper bound for a single call.
    pub timeout: Duration,
}

#[derive(Default)]
pub(crate) struct DispatchQueue {
    jobs: Mutex<VecDeque<DispatchJob>>,
    notify: Notify,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a job. Critical jobs go ahead of every queued normal job but
    /// behind earlier critical ones.
    ///
    /// Returns `false` when the job would change nothing: an update equal to
    /// the newest pending update for the same accessory, or a query already
    /// waiting with the same urgency.
    pub fn push(&self, job: DispatchJob) -> bool {
        {
            let mut jobs = self.jobs.lock();
            let redundant = match &job {
                DispatchJob::Update(_) => jobs
                    .iter()
                    .rev()
                    .find(|queued| queued.same_subject(&job))
                    .is_some_and(|queued| queued.duplicates(&job)),
                DispatchJob::QuerySecurity { .. } => {
                    jobs.iter().any(|queued| queued.duplicates(&job))
                }
            };
            if redundant {
                return false;
            }
            match job.urgency() {
                Urgency::Normal => jobs.push_back(job),
                Urgency::Critical => {
                    let at = jobs
                        .iter()
                        .position(|queued| queued.urgency() == Urgency::Normal)
                        .unwrap_or(jobs.len());
                    jobs.insert(at, job);
                }
            }
        }
        self.notify.notify_one();
        true
    }

    pub fn pop(&self) -> Option<DispatchJob> {
        self.jobs.lock().pop_front()
    }

    /// Wait for the next job.
    pub async fn next(&self) -> DispatchJob {
        loop {
            if let Some(job) = self.pop() {
                return job;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Discard everything still queued, returning how many jobs were dropped.
    pub fn clear(&self) -> usize {
        let mut jobs = self.jobs.lock();
        let dropped = jobs.len();
        jobs.clear();
        dropped
    }
}

/// Producer side of the dispatcher, held by the engine.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<DispatchQueue>,
}

impl Dispatcher {
    /// Create the queue handle, the sender that drains it, and the channel
    /// its reports arrive on.
    pub fn new(
        transport: Arc<dyn WebhookTransport>,
        settings: DispatchSettings,
    ) -> (Self, DispatchSender, mpsc::UnboundedReceiver<DispatchReport>) {
        let queue = Arc::new(DispatchQueue::new());
        let (reports, rx) = mpsc::unbounded_channel();
        let sender = DispatchSender {
            queue: queue.clone(),
            transport,
            settings,
            reports,
        };
        (Self { queue }, sender, rx)
    }

    pub fn enqueue(&self, job: DispatchJob) -> bool {
        let accessory_id = job.accessory_id().to_string();
        let queued = self.queue.push(job);
        if queued {
            debug!(
                "[Webhook] queued job for '{}' ({} pending)",
                accessory_id,
                self.queue.len()
            );
        } else {
            debug!("[Webhook] identical job for '{}' already pending", accessory_id);
        }
        queued
    }

    pub fn enqueue_update(&self, request: UpdateRequest) -> bool {
        self.enqueue(DispatchJob::Update(request))
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn discard_pending(&self) -> usize {
        self.queue.clear()
    }
}

/// Consumer side: drains the queue against the transport.
pub struct DispatchSender {
    queue: Arc<DispatchQueue>,
    transport: Arc<dyn WebhookTransport>,
    settings: DispatchSettings,
    reports: mpsc::UnboundedSender<DispatchReport>,
}

impl DispatchSender {
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "[Webhook] sender started (delay {:?}, timeout {:?})",
            self.settings.delay, self.settings.timeout
        );
        let mut last_start: Option<Instant> = None;

        loop {
            let job = tokio::select! {
                _ = shutdown.cancelled() => break,
                job = self.queue.next() => job,
            };

            if let Some(previous) = last_start {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep_until(previous + self.settings.delay) => {}
                }
            }
            last_start = Some(Instant::now());

            let job_id = job.accessory_id().to_string();
            let report = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("[Webhook] in-flight call for '{}' abandoned", job_id);
                    break;
                }
                report = self.deliver(job) => report,
            };

            if self.reports.send(report).is_err() {
                debug!("[Webhook] report receiver closed");
                break;
            }
        }

        let dropped = self.queue.clear();
        if dropped > 0 {
            info!("[Webhook] discarded {} pending job(s) on shutdown", dropped);
        }
        info!("[Webhook] sender stopped");
    }

    async fn deliver(&self, job: DispatchJob) -> DispatchReport {
        let params = job.query_params();
        let accessory_id = job.accessory_id().to_string();

        let outcome = match tokio::time::timeout(
            self.settings.timeout,
            self.transport.call(&accessory_id, &params),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BridgeError::DispatchTimeout {
                accessory_id: accessory_id.clone(),
                timeout: self.settings.timeout,
            }),
        };

        match job {
            DispatchJob::Update(request) => {
                match &outcome {
                    Ok(data) => info!(
                        "[Webhook] {} accessoryId='{}' data={}",
                        request.target_state, accessory_id, data
                    ),
                    Err(e) => error!("[Webhook] {}", e),
                }
                DispatchReport::Update {
                    request,
                    result: outcome.map(|_| ()),
                }
            }
            DispatchJob::QuerySecurity { accessory_id, .. } => {
                let result = outcome.and_then(|data| SecurityMode::from_response(&data));
                if let Err(e) = &result {
                    error!("[Webhook] security query: {}", e);
                }
                DispatchReport::SecurityState {
                    accessory_id,
                    result,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::GpioPin;
    use crate::zones::ContactState;
    use async_trait::async_trait;
    use serde_json::{Value, json};

    /// Transport double recording when each call started.
    struct RecordingTransport {
        latency: Duration,
        calls: Mutex<Vec<(Instant, String)>>,
    }

    impl RecordingTransport {
        fn new(latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                latency,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn starts(&self) -> Vec<Instant> {
            self.calls.lock().iter().map(|(at, _)| *at).collect()
        }

        fn accessories(&self) -> Vec<String> {
            self.calls.lock().iter().map(|(_, id)| id.clone()).collect()
        }
    }

    #[async_trait]
    impl WebhookTransport for RecordingTransport {
        async fn call(&self, accessory_id: &str, _params: &[(&'static str, String)]) -> Result<Value> {
            self.calls
                .lock()
                .push((Instant::now(), accessory_id.to_string()));
            tokio::time::sleep(self.latency).await;
            Ok(json!({ "success": true, "currentState": 1 }))
        }
    }

    fn update(id: &str, state: ContactState) -> DispatchJob {
        DispatchJob::Update(UpdateRequest::contact(GpioPin::new(17), id, state))
    }

    fn settings(delay_ms: u64) -> DispatchSettings {
        DispatchSettings {
            delay: Duration::from_millis(delay_ms),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_critical_jumps_normal_jobs() {
        let queue = DispatchQueue::new();
        assert!(queue.push(update("a", ContactState::Open)));
        assert!(queue.push(update("b", ContactState::Open)));
        assert!(queue.push(DispatchJob::Update(UpdateRequest::security_triggered("alarm1"))));
        assert!(queue.push(DispatchJob::Update(UpdateRequest::security_triggered("alarm2"))));

        let order: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|job| job.accessory_id().to_string())
            .collect();
        assert_eq!(order, vec!["alarm1", "alarm2", "a", "b"]);
    }

    #[test]
    fn test_identical_pending_jobs_coalesce() {
        let queue = DispatchQueue::new();
        assert!(queue.push(update("a", ContactState::Open)));
        assert!(!queue.push(update("a", ContactState::Open)));
        assert!(queue.push(update("a", ContactState::Closed)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reopen_behind_pending_close_is_queued() {
        let queue = DispatchQueue::new();
        assert!(queue.push(update("a", ContactState::Open)));
        assert!(queue.push(update("a", ContactState::Closed)));
        assert!(queue.push(update("b", ContactState::Open)));
        // newest pending job for "a" is Closed, so a new Open must go out
        assert!(queue.push(update("a", ContactState::Open)));
        // and repeating it now is redundant
        assert!(!queue.push(update("a", ContactState::Open)));

        let order: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|job| match job {
                DispatchJob::Update(request) => {
                    format!("{}={}", request.target_accessory_id, request.target_state)
                }
                other => other.accessory_id().to_string(),
            })
            .collect();
        assert_eq!(order, vec!["a=open", "a=closed", "b=open", "a=open"]);
    }

    #[test]
    fn test_critical_check_not_merged_into_poll() {
        let queue = DispatchQueue::new();
        let query = |urgency| DispatchJob::QuerySecurity {
            accessory_id: "alarm".to_string(),
            urgency,
        };
        assert!(queue.push(update("a", ContactState::Open)));
        assert!(queue.push(query(Urgency::Normal)));
        assert!(queue.push(query(Urgency::Critical)));
        assert!(!queue.push(query(Urgency::Critical)));

        let first = queue.pop().expect("job");
        assert_eq!(first.urgency(), Urgency::Critical);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_spacing_honours_delay() {
        let transport = RecordingTransport::new(Duration::from_millis(20));
        let (dispatcher, sender, mut reports) = Dispatcher::new(transport.clone(), settings(400));
        let shutdown = CancellationToken::new();
        let task = sender.spawn(shutdown.clone());

        for i in 0..6 {
            let state = if i % 2 == 0 {
                ContactState::Open
            } else {
                ContactState::Closed
            };
            assert!(dispatcher.enqueue(update(&format!("zone{}", i), state)));
        }

        for _ in 0..6 {
            let report = reports.recv().await.expect("report");
            assert!(matches!(report, DispatchReport::Update { result: Ok(()), .. }));
        }

        let starts = transport.starts();
        assert_eq!(starts.len(), 6);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(400));
        }
        assert_eq!(
            transport.accessories(),
            vec!["zone0", "zone1", "zone2", "zone3", "zone4", "zone5"]
        );

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_is_followed_immediately() {
        let transport = RecordingTransport::new(Duration::from_secs(1));
        let (dispatcher, sender, mut reports) = Dispatcher::new(transport.clone(), settings(400));
        let shutdown = CancellationToken::new();
        let task = sender.spawn(shutdown.clone());

        dispatcher.enqueue(update("a", ContactState::Open));
        dispatcher.enqueue(update("b", ContactState::Open));
        reports.recv().await.expect("first report");
        reports.recv().await.expect("second report");

        let starts = transport.starts();
        assert_eq!(starts[1] - starts[0], Duration::from_secs(1));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reported() {
        let transport = RecordingTransport::new(Duration::from_secs(30));
        let (dispatcher, sender, mut reports) = Dispatcher::new(transport, settings(400));
        let shutdown = CancellationToken::new();
        let task = sender.spawn(shutdown.clone());

        let started = Instant::now();
        dispatcher.enqueue(update("zone1", ContactState::Open));
        match reports.recv().await.expect("report") {
            DispatchReport::Update { request, result } => {
                assert_eq!(request.target_accessory_id, "zone1");
                assert!(matches!(result, Err(BridgeError::DispatchTimeout { .. })));
            }
            other => panic!("unexpected report {:?}", other),
        }
        assert_eq!(started.elapsed(), Duration::from_secs(5));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_security_query_decoded() {
        let transport = RecordingTransport::new(Duration::ZERO);
        let (dispatcher, sender, mut reports) = Dispatcher::new(transport, settings(400));
        let shutdown = CancellationToken::new();
        let task = sender.spawn(shutdown.clone());

        dispatcher.enqueue(DispatchJob::QuerySecurity {
            accessory_id: "alarm".to_string(),
            urgency: Urgency::Normal,
        });
        match reports.recv().await.expect("report") {
            DispatchReport::SecurityState {
                accessory_id,
                result,
            } => {
                assert_eq!(accessory_id, "alarm");
                assert_eq!(result.ok(), Some(SecurityMode::Away));
            }
            other => panic!("unexpected report {:?}", other),
        }

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_discards_queue() {
        let transport = RecordingTransport::new(Duration::from_secs(3));
        let (dispatcher, sender, _reports) = Dispatcher::new(transport.clone(), settings(400));
        let shutdown = CancellationToken::new();
        let task = sender.spawn(shutdown.clone());

        dispatcher.enqueue(update("a", ContactState::Open));
        dispatcher.enqueue(update("b", ContactState::Open));
        dispatcher.enqueue(update("c", ContactState::Open));
        tokio::time::sleep(Duration::from_millis(100)).await;

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(dispatcher.pending(), 0);
        assert_eq!(transport.accessories(), vec!["a"]);
    }
}
