// vigil: Notification dispatch

pub mod email;
pub mod router;
pub mod teams;
pub mod template;
pub mod webhook;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::events::AlertEvent;
use crate::metrics::InternalMetrics;
use crate::notify::router::{ChannelRouter, ChannelTarget};

pub use router::ChannelRule;

/// Sink failure taxonomy
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("Sink not configured")]
    NotConfigured,

    #[error("No recipients configured")]
    NoRecipients,

    #[error("Transient delivery failure: {0}")]
    Transient(String),

    #[error("Permanent delivery failure: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            SinkError::Transient(err.to_string())
        } else if let Some(status) = err.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                SinkError::Transient(err.to_string())
            } else {
                SinkError::Permanent(err.to_string())
            }
        } else {
            SinkError::Transient(err.to_string())
        }
    }
}

/// Outbound notification adapter
///
/// `format` renders the event into the sink's native payload; `send`
/// delivers a previously formatted payload. The split keeps formatting
/// data-driven and lets the dispatcher enqueue fully prepared tasks.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Stable identifier
    fn name(&self) -> &'static str;

    /// Render the event; the payload embeds any routed destination
    fn format(&self, event: &AlertEvent, target: Option<&ChannelTarget>) -> Result<Value, SinkError>;

    /// Deliver a formatted payload
    async fn send(&self, event: &AlertEvent, payload: &Value) -> Result<(), SinkError>;

    /// Deliver a short test message
    async fn test(&self, message: &str) -> Result<(), SinkError>;
}

/// Backoff mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffMode {
    Linear,
    Exponential,
}

/// Per-delivery retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub mode: BackoffMode,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            mode: BackoffMode::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> std::time::Duration {
        let ms = match self.mode {
            BackoffMode::Linear => self.initial_delay_ms.saturating_mul(attempt as u64),
            BackoffMode::Exponential => {
                let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
                (self.initial_delay_ms as f64 * factor) as u64
            }
        };
        std::time::Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// The configured sinks, shared between the dispatcher and the API
pub struct SinkSet {
    sinks: Vec<Arc<dyn Sink>>,
}

impl SinkSet {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self { sinks }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Sink>> {
        self.sinks.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Sink>> {
        self.sinks.iter().find(|s| s.name() == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

struct DeliveryTask {
    sink: Arc<dyn Sink>,
    event: AlertEvent,
    payload: Value,
}

/// Fans transition events out to every configured sink
///
/// Tasks for the same (sink, rule) pair always land on the same worker, so
/// their delivery order follows event order. Workers retry transient
/// failures with backoff up to the attempt budget, then drop.
pub struct Dispatcher {
    sinks: Arc<SinkSet>,
    router: ChannelRouter,
    retry: RetryPolicy,
    worker_count: usize,
    queue_capacity: usize,
}

impl Dispatcher {
    pub fn new(
        sinks: Arc<SinkSet>,
        router: ChannelRouter,
        retry: RetryPolicy,
        workers: Option<usize>,
    ) -> Self {
        let worker_count = workers.unwrap_or_else(|| (sinks.len() * 2).max(1));
        Self {
            sinks,
            router,
            retry,
            worker_count,
            queue_capacity: 256,
        }
    }

    /// Consume events until shutdown, then drain the worker queues
    pub async fn run(
        self,
        mut events: mpsc::Receiver<AlertEvent>,
        mut shutdown: watch::Receiver<bool>,
        drain_deadline: std::time::Duration,
    ) {
        let mut senders = Vec::with_capacity(self.worker_count);
        let mut handles = Vec::with_capacity(self.worker_count);
        for worker in 0..self.worker_count {
            let (tx, rx) = mpsc::channel::<DeliveryTask>(self.queue_capacity);
            senders.push(tx);
            handles.push(tokio::spawn(worker_loop(worker, rx, self.retry.clone())));
        }
        info!(workers = self.worker_count, sinks = self.sinks.len(), "Notification dispatcher started");

        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => self.dispatch(&senders, event),
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Notification dispatcher stopping");
                        break;
                    }
                }
            }
        }

        // closing the queues lets workers drain what is already enqueued
        drop(senders);
        for handle in handles {
            if tokio::time::timeout(drain_deadline, handle).await.is_err() {
                warn!("Notification worker did not drain before the deadline");
            }
        }
    }

    fn dispatch(&self, senders: &[mpsc::Sender<DeliveryTask>], event: AlertEvent) {
        let target = self
            .router
            .select(event.kind.route_type(), event.instance.severity);

        for sink in self.sinks.iter() {
            let payload = match sink.format(&event, target.as_ref()) {
                Ok(payload) => payload,
                Err(SinkError::NotConfigured) | Err(SinkError::NoRecipients) => {
                    // this sink is bypassed; the others still deliver
                    debug!(sink = sink.name(), "Sink not configured, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(sink = sink.name(), error = %e, "Failed to format payload");
                    InternalMetrics::global()
                        .deliveries
                        .with_label_values(&[sink.name(), "format_error"])
                        .inc();
                    continue;
                }
            };

            let index = worker_index(sink.name(), &event, senders.len());
            let task = DeliveryTask {
                sink: Arc::clone(sink),
                event: event.clone(),
                payload,
            };
            match senders[index].try_send(task) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(task)) => {
                    warn!(
                        sink = task.sink.name(),
                        rule = %task.event.instance.rule_id,
                        "Delivery queue full, dropping notification"
                    );
                    InternalMetrics::global()
                        .deliveries
                        .with_label_values(&[task.sink.name(), "queue_full"])
                        .inc();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

fn worker_index(sink: &str, event: &AlertEvent, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    sink.hash(&mut hasher);
    event.instance.rule_id.hash(&mut hasher);
    (hasher.finish() as usize) % workers.max(1)
}

async fn worker_loop(worker: usize, mut rx: mpsc::Receiver<DeliveryTask>, retry: RetryPolicy) {
    while let Some(task) = rx.recv().await {
        deliver(worker, task, &retry).await;
    }
}

async fn deliver(worker: usize, task: DeliveryTask, retry: &RetryPolicy) {
    let metrics = InternalMetrics::global();
    let mut attempt = 1u32;
    loop {
        match task.sink.send(&task.event, &task.payload).await {
            Ok(()) => {
                debug!(
                    worker,
                    sink = task.sink.name(),
                    rule = %task.event.instance.rule_id,
                    attempt,
                    "Notification delivered"
                );
                metrics
                    .deliveries
                    .with_label_values(&[task.sink.name(), "ok"])
                    .inc();
                return;
            }
            Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                metrics.delivery_retries.inc();
                let delay = retry.delay(attempt);
                debug!(
                    worker,
                    sink = task.sink.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient delivery failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(
                    worker,
                    sink = task.sink.name(),
                    rule = %task.event.instance.rule_id,
                    attempt,
                    error = %e,
                    "Notification dropped"
                );
                metrics
                    .deliveries
                    .with_label_values(&[task.sink.name(), "dropped"])
                    .inc();
                return;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::alerts::rule::{Action, Condition, Rule, RuleSpec, Severity, Threshold, ThresholdOp};
    use crate::alerts::state::AlertInstance;
    use crate::events::TransitionKind;
    use std::collections::BTreeMap;

    pub fn fired_event_named(rule_name: &str) -> AlertEvent {
        let rule = Rule::from_spec(RuleSpec {
            name: rule_name.to_string(),
            description: String::new(),
            severity: Severity::Critical,
            priority: 1,
            enabled: true,
            condition: Condition::Simple {
                metric: "cpu".to_string(),
                threshold: Threshold {
                    op: ThresholdOp::Gt,
                    value: 80.0,
                    value2: None,
                },
                time_frame: None,
            },
            actions: vec![Action {
                action_type: "notify".to_string(),
                target: "ops".to_string(),
            }],
            schedule: None,
            throttle: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        });
        AlertEvent::new(
            TransitionKind::Fired,
            AlertInstance::firing(&rule, chrono::Utc::now()),
        )
    }

    pub fn fired_event() -> AlertEvent {
        fired_event_named("cpu_high")
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::fired_event_named as fired_event;
    use super::*;
    use crate::shutdown::Shutdown;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records deliveries; fails the first `fail_first` sends as transient
    struct RecordingSink {
        deliveries: Mutex<Vec<String>>,
        fail_first: AtomicU32,
        configured: bool,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                deliveries: Mutex::new(Vec::new()),
                fail_first: AtomicU32::new(0),
                configured: true,
            }
        }

        fn failing(times: u32) -> Self {
            let sink = Self::new();
            sink.fail_first.store(times, Ordering::SeqCst);
            sink
        }

        fn unconfigured() -> Self {
            let mut sink = Self::new();
            sink.configured = false;
            sink
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn format(&self, event: &AlertEvent, _target: Option<&ChannelTarget>) -> Result<Value, SinkError> {
            if !self.configured {
                return Err(SinkError::NotConfigured);
            }
            Ok(json!({"rule": event.instance.rule_name}))
        }

        async fn send(&self, _event: &AlertEvent, payload: &Value) -> Result<(), SinkError> {
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(SinkError::Transient("flaky".to_string()));
            }
            self.deliveries
                .lock()
                .push(payload["rule"].as_str().unwrap_or_default().to_string());
            Ok(())
        }

        async fn test(&self, _message: &str) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
            mode: BackoffMode::Exponential,
        }
    }

    #[test]
    fn test_backoff_delays() {
        let exp = fast_retry();
        assert_eq!(exp.delay(1).as_millis(), 1);
        assert_eq!(exp.delay(2).as_millis(), 2);
        assert_eq!(exp.delay(3).as_millis(), 4);
        assert_eq!(exp.delay(10).as_millis(), 5);

        let lin = RetryPolicy {
            mode: BackoffMode::Linear,
            initial_delay_ms: 100,
            max_delay_ms: 250,
            ..fast_retry()
        };
        assert_eq!(lin.delay(1).as_millis(), 100);
        assert_eq!(lin.delay(2).as_millis(), 200);
        assert_eq!(lin.delay(3).as_millis(), 250);
    }

    #[tokio::test]
    async fn test_dispatch_delivers_in_order_per_rule() {
        let sink = Arc::new(RecordingSink::new());
        let sinks = Arc::new(SinkSet::new(vec![sink.clone() as Arc<dyn Sink>]));
        let dispatcher = Dispatcher::new(sinks, ChannelRouter::new(vec![]), fast_retry(), Some(2));

        let (tx, rx) = mpsc::channel(16);
        let shutdown = Shutdown::new();
        let task = tokio::spawn(dispatcher.run(
            rx,
            shutdown.subscribe(),
            std::time::Duration::from_secs(1),
        ));

        for i in 0..4 {
            let mut event = fired_event("ordered");
            event.instance.message = format!("event {}", i);
            tx.send(event).await.unwrap();
        }
        drop(tx);
        task.await.unwrap();

        let delivered = sink.deliveries.lock().clone();
        assert_eq!(delivered.len(), 4);
        assert!(delivered.iter().all(|r| r == "ordered"));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let sink = Arc::new(RecordingSink::failing(2));
        let sinks = Arc::new(SinkSet::new(vec![sink.clone() as Arc<dyn Sink>]));
        let dispatcher = Dispatcher::new(sinks, ChannelRouter::new(vec![]), fast_retry(), None);

        let (tx, rx) = mpsc::channel(16);
        let shutdown = Shutdown::new();
        let task = tokio::spawn(dispatcher.run(
            rx,
            shutdown.subscribe(),
            std::time::Duration::from_secs(1),
        ));

        tx.send(fired_event("retry_me")).await.unwrap();
        drop(tx);
        task.await.unwrap();

        // two transient failures, success on the third attempt
        assert_eq!(sink.deliveries.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_drop_without_blocking_others() {
        let flaky = Arc::new(RecordingSink::failing(99));
        let healthy = Arc::new(RecordingSink::new());
        let sinks = Arc::new(SinkSet::new(vec![
            flaky.clone() as Arc<dyn Sink>,
            healthy.clone() as Arc<dyn Sink>,
        ]));
        let dispatcher = Dispatcher::new(sinks, ChannelRouter::new(vec![]), fast_retry(), None);

        let (tx, rx) = mpsc::channel(16);
        let shutdown = Shutdown::new();
        let task = tokio::spawn(dispatcher.run(
            rx,
            shutdown.subscribe(),
            std::time::Duration::from_secs(1),
        ));

        tx.send(fired_event("mixed")).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(flaky.deliveries.lock().is_empty());
        assert_eq!(healthy.deliveries.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unconfigured_sink_is_bypassed() {
        let off = Arc::new(RecordingSink::unconfigured());
        let on = Arc::new(RecordingSink::new());
        let sinks = Arc::new(SinkSet::new(vec![
            off.clone() as Arc<dyn Sink>,
            on.clone() as Arc<dyn Sink>,
        ]));
        let dispatcher = Dispatcher::new(sinks, ChannelRouter::new(vec![]), fast_retry(), None);

        let (tx, rx) = mpsc::channel(16);
        let shutdown = Shutdown::new();
        let task = tokio::spawn(dispatcher.run(
            rx,
            shutdown.subscribe(),
            std::time::Duration::from_secs(1),
        ));

        tx.send(fired_event("bypass")).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(off.deliveries.lock().is_empty());
        assert_eq!(on.deliveries.lock().len(), 1);
    }

    #[test]
    fn test_worker_index_is_stable() {
        let event = fired_event("stable");
        let a = worker_index("chat", &event, 8);
        for _ in 0..10 {
            assert_eq!(worker_index("chat", &event, 8), a);
        }
    }
}
