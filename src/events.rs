// vigil: Alert transition events and bounded fanout

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::alerts::state::AlertInstance;
use crate::metrics::InternalMetrics;

/// Kind of transition an event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Fired,
    Resolved,
    Silenced,
}

impl TransitionKind {
    /// Routing event type for the channel router
    pub fn route_type(&self) -> &'static str {
        match self {
            TransitionKind::Fired => "alert",
            TransitionKind::Resolved => "resolved",
            TransitionKind::Silenced => "silenced",
        }
    }
}

/// One alert state transition, as published to consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub kind: TransitionKind,
    pub instance: AlertInstance,
    pub at: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(kind: TransitionKind, instance: AlertInstance) -> Self {
        Self {
            kind,
            instance,
            at: Utc::now(),
        }
    }
}

struct Consumer {
    name: &'static str,
    tx: mpsc::Sender<AlertEvent>,
}

/// Fanout of alert events onto bounded consumer queues
///
/// Sends never block the publisher: a full queue drops the event for that
/// consumer and increments a counter.
pub struct EventFanout {
    consumers: Vec<Consumer>,
}

impl EventFanout {
    pub fn new() -> Self {
        Self {
            consumers: Vec::new(),
        }
    }

    /// Attach a consumer; returns the receiving end of its queue
    pub fn subscribe(&mut self, name: &'static str, capacity: usize) -> mpsc::Receiver<AlertEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.consumers.push(Consumer { name, tx });
        rx
    }

    /// Publish to every consumer without blocking
    pub fn publish(&self, event: &AlertEvent) {
        for consumer in &self.consumers {
            match consumer.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    InternalMetrics::global()
                        .events_dropped
                        .with_label_values(&[consumer.name])
                        .inc();
                    warn!(
                        consumer = consumer.name,
                        rule = %event.instance.rule_id,
                        "Consumer queue full, dropping alert event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(consumer = consumer.name, "Consumer queue closed");
                }
            }
        }
    }
}

impl Default for EventFanout {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::rule::{Action, Condition, Rule, RuleSpec, Severity, Threshold, ThresholdOp};
    use std::collections::BTreeMap;

    fn event(kind: TransitionKind) -> AlertEvent {
        let rule = Rule::from_spec(RuleSpec {
            name: "r".to_string(),
            description: String::new(),
            severity: Severity::High,
            priority: 1,
            enabled: true,
            condition: Condition::Simple {
                metric: "m".to_string(),
                threshold: Threshold {
                    op: ThresholdOp::Gt,
                    value: 0.0,
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
        AlertEvent::new(kind, AlertInstance::firing(&rule, Utc::now()))
    }

    #[tokio::test]
    async fn test_publish_reaches_all_consumers() {
        let mut fanout = EventFanout::new();
        let mut rx1 = fanout.subscribe("dispatcher", 4);
        let mut rx2 = fanout.subscribe("hub", 4);

        fanout.publish(&event(TransitionKind::Fired));

        assert_eq!(rx1.recv().await.unwrap().kind, TransitionKind::Fired);
        assert_eq!(rx2.recv().await.unwrap().kind, TransitionKind::Fired);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let mut fanout = EventFanout::new();
        let mut rx = fanout.subscribe("dispatcher", 1);

        fanout.publish(&event(TransitionKind::Fired));
        // queue full now; this publish returns immediately and drops
        fanout.publish(&event(TransitionKind::Resolved));

        assert_eq!(rx.recv().await.unwrap().kind, TransitionKind::Fired);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_route_types() {
        assert_eq!(TransitionKind::Fired.route_type(), "alert");
        assert_eq!(TransitionKind::Resolved.route_type(), "resolved");
        assert_eq!(TransitionKind::Silenced.route_type(), "silenced");
    }
}
