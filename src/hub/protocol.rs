// vigil: Subscription wire protocol

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::alerts::rule::Severity;
use crate::events::AlertEvent;

/// Envelope type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    // client -> server
    Subscribe,
    Unsubscribe,
    Ping,
    // server -> client
    InitialState,
    SystemStatus,
    MetricsUpdate,
    TaskUpdate,
    Alert,
    Pong,
}

/// Wire envelope; every message in either direction uses this shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(message_type: MessageType, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Per-subscriber filter; a message is delivered iff every present
/// dimension matches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionFilter {
    pub event_types: Option<HashSet<MessageType>>,
    pub rule_ids: Option<HashSet<Uuid>>,
    pub min_severity: Option<Severity>,
    pub labels: Option<BTreeMap<String, String>>,
}

impl SubscriptionFilter {
    pub fn matches(&self, message: &HubMessage) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&message.envelope.message_type) {
                return false;
            }
        }
        if let Some(rule_ids) = &self.rule_ids {
            match message.rule_id {
                Some(id) if rule_ids.contains(&id) => {}
                _ => return false,
            }
        }
        if let Some(min) = self.min_severity {
            match message.severity {
                Some(severity) if severity >= min => {}
                _ => return false,
            }
        }
        if let Some(matchers) = &self.labels {
            for (key, value) in matchers {
                if message.labels.get(key) != Some(value) {
                    return false;
                }
            }
        }
        true
    }
}

/// A broadcastable message: the envelope plus the metadata filters see
#[derive(Debug, Clone)]
pub struct HubMessage {
    pub envelope: Envelope,
    pub rule_id: Option<Uuid>,
    pub severity: Option<Severity>,
    pub labels: BTreeMap<String, String>,
}

impl HubMessage {
    /// Wrap an alert transition for broadcast
    pub fn alert(event: &AlertEvent) -> Self {
        let envelope = Envelope::new(
            MessageType::Alert,
            serde_json::json!({
                "kind": event.kind,
                "alert": event.instance,
            }),
        );
        Self {
            envelope,
            rule_id: Some(event.instance.rule_id),
            severity: Some(event.instance.severity),
            labels: event.instance.labels.clone(),
        }
    }

    pub fn system_status(data: Value) -> Self {
        Self {
            envelope: Envelope::new(MessageType::SystemStatus, data),
            rule_id: None,
            severity: None,
            labels: BTreeMap::new(),
        }
    }

    pub fn metrics_update(data: Value) -> Self {
        Self {
            envelope: Envelope::new(MessageType::MetricsUpdate, data),
            rule_id: None,
            severity: None,
            labels: BTreeMap::new(),
        }
    }

    pub fn task_update(data: Value) -> Self {
        Self {
            envelope: Envelope::new(MessageType::TaskUpdate, data),
            rule_id: None,
            severity: None,
            labels: BTreeMap::new(),
        }
    }
}

/// Parsed client request
#[derive(Debug, Clone)]
pub enum ClientRequest {
    Subscribe(SubscriptionFilter),
    Unsubscribe,
    Ping { id: Uuid },
}

/// Parse a raw client frame into a request
pub fn parse_client_frame(raw: &str) -> Result<ClientRequest, String> {
    let envelope: Envelope =
        serde_json::from_str(raw).map_err(|e| format!("malformed envelope: {}", e))?;
    match envelope.message_type {
        MessageType::Subscribe => {
            let filter: SubscriptionFilter = serde_json::from_value(envelope.data)
                .map_err(|e| format!("malformed filter: {}", e))?;
            Ok(ClientRequest::Subscribe(filter))
        }
        MessageType::Unsubscribe => Ok(ClientRequest::Unsubscribe),
        MessageType::Ping => Ok(ClientRequest::Ping { id: envelope.id }),
        other => Err(format!("unexpected client message type: {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alert_message(severity: Severity) -> HubMessage {
        let mut event = crate::notify::tests_support::fired_event();
        event.instance.severity = severity;
        event
            .instance
            .labels
            .insert("env".to_string(), "prod".to_string());
        HubMessage::alert(&event)
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::new(MessageType::InitialState, json!({"x": 1}));
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["type"], "initial-state");
        assert!(wire["id"].is_string());
        assert!(wire["timestamp"].is_string());
        assert_eq!(wire["data"]["x"], 1);
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = SubscriptionFilter::default();
        assert!(filter.matches(&alert_message(Severity::Info)));
        assert!(filter.matches(&HubMessage::system_status(json!({}))));
    }

    #[test]
    fn test_min_severity_filter() {
        let filter = SubscriptionFilter {
            min_severity: Some(Severity::High),
            ..Default::default()
        };
        assert!(filter.matches(&alert_message(Severity::Critical)));
        assert!(filter.matches(&alert_message(Severity::High)));
        assert!(!filter.matches(&alert_message(Severity::Medium)));
        // a message with no severity dimension does not match
        assert!(!filter.matches(&HubMessage::system_status(json!({}))));
    }

    #[test]
    fn test_rule_id_filter() {
        let message = alert_message(Severity::High);
        let rule_id = message.rule_id.unwrap();

        let mut ids = HashSet::new();
        ids.insert(rule_id);
        let filter = SubscriptionFilter {
            rule_ids: Some(ids),
            ..Default::default()
        };
        assert!(filter.matches(&message));

        let mut other = HashSet::new();
        other.insert(Uuid::new_v4());
        let filter = SubscriptionFilter {
            rule_ids: Some(other),
            ..Default::default()
        };
        assert!(!filter.matches(&message));
    }

    #[test]
    fn test_label_matchers_all_required() {
        let message = alert_message(Severity::High);

        let mut labels = BTreeMap::new();
        labels.insert("env".to_string(), "prod".to_string());
        let filter = SubscriptionFilter {
            labels: Some(labels.clone()),
            ..Default::default()
        };
        assert!(filter.matches(&message));

        labels.insert("region".to_string(), "eu".to_string());
        let filter = SubscriptionFilter {
            labels: Some(labels),
            ..Default::default()
        };
        assert!(!filter.matches(&message));
    }

    #[test]
    fn test_event_type_filter() {
        let mut types = HashSet::new();
        types.insert(MessageType::Alert);
        let filter = SubscriptionFilter {
            event_types: Some(types),
            ..Default::default()
        };
        assert!(filter.matches(&alert_message(Severity::Low)));
        assert!(!filter.matches(&HubMessage::metrics_update(json!({}))));
    }

    #[test]
    fn test_parse_client_frames() {
        let subscribe = json!({
            "id": Uuid::new_v4(),
            "type": "subscribe",
            "timestamp": Utc::now(),
            "data": {"min_severity": "high"},
        });
        match parse_client_frame(&subscribe.to_string()).unwrap() {
            ClientRequest::Subscribe(filter) => {
                assert_eq!(filter.min_severity, Some(Severity::High));
            }
            other => panic!("unexpected request: {:?}", other),
        }

        let ping = json!({
            "id": Uuid::new_v4(),
            "type": "ping",
            "timestamp": Utc::now(),
            "data": {},
        });
        assert!(matches!(
            parse_client_frame(&ping.to_string()).unwrap(),
            ClientRequest::Ping { .. }
        ));

        assert!(parse_client_frame("not json").is_err());

        let server_type = json!({
            "id": Uuid::new_v4(),
            "type": "alert",
            "timestamp": Utc::now(),
            "data": {},
        });
        assert!(parse_client_frame(&server_type.to_string()).is_err());
    }
}
