// vigil: Teams adaptive-card sink

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::TeamsSettings;
use crate::events::AlertEvent;
use crate::notify::router::ChannelTarget;
use crate::notify::template;
use crate::notify::{Sink, SinkError};

/// Teams sink posting adaptive cards
///
/// Delivers over the incoming webhook when configured; when Graph
/// credentials are present and a (team, channel) target is known, posts to
/// the channel-message API instead.
pub struct TeamsSink {
    settings: Option<TeamsSettings>,
    client: reqwest::Client,
    /// Cached bearer token and its expiry
    token: Mutex<Option<(String, std::time::Instant)>>,
    dashboard_url: Option<String>,
}

impl TeamsSink {
    pub fn new(
        settings: Option<TeamsSettings>,
        client: reqwest::Client,
        dashboard_url: Option<String>,
    ) -> Self {
        Self {
            settings,
            client,
            token: Mutex::new(None),
            dashboard_url,
        }
    }

    fn settings(&self) -> Result<&TeamsSettings, SinkError> {
        self.settings.as_ref().ok_or(SinkError::NotConfigured)
    }

    /// Destination for an event: router target, then per-severity override,
    /// then the Graph default team
    fn resolve_target(
        &self,
        event: &AlertEvent,
        routed: Option<&ChannelTarget>,
    ) -> Option<ChannelTarget> {
        if let Some(target) = routed {
            return Some(target.clone());
        }
        let settings = self.settings.as_ref()?;
        if let Some((team, channel)) = settings
            .severity_channels
            .get(event.instance.severity.as_str())
        {
            return Some(ChannelTarget {
                team_id: team.clone(),
                channel_id: channel.clone(),
            });
        }
        None
    }

    fn card(&self, event: &AlertEvent) -> Value {
        let instance = &event.instance;
        let facts: Vec<Value> = template::fields(event)
            .into_iter()
            .map(|f| json!({"title": f["title"], "value": f["value"]}))
            .collect();

        let mut actions = Vec::new();
        if let Some(url) = &self.dashboard_url {
            actions.push(json!({
                "type": "Action.OpenUrl",
                "title": "Open dashboard",
                "url": url,
            }));
        }

        json!({
            "$schema": "http://adaptivecards.io/schemas/adaptive-card.json",
            "type": "AdaptiveCard",
            "version": "1.4",
            "body": [
                {
                    "type": "TextBlock",
                    "size": "Large",
                    "weight": "Bolder",
                    "color": template::severity_style(instance.severity),
                    "text": template::title(event),
                    "wrap": true,
                },
                { "type": "FactSet", "facts": facts },
            ],
            "actions": actions,
        })
    }

    async fn bearer_token(&self) -> Result<String, SinkError> {
        let settings = self.settings()?;
        let graph = settings.graph.as_ref().ok_or(SinkError::NotConfigured)?;

        if let Some((token, expires)) = self.token.lock().clone() {
            if expires > std::time::Instant::now() {
                return Ok(token);
            }
        }

        let url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            graph.tenant_id
        );
        let response = self
            .client
            .post(&url)
            .form(&[
                ("client_id", graph.client_id.as_str()),
                ("client_secret", graph.client_secret.as_str()),
                ("scope", "https://graph.microsoft.com/.default"),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SinkError::Permanent(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| SinkError::Permanent(format!("token response: {}", e)))?;
        let token = body["access_token"]
            .as_str()
            .ok_or_else(|| SinkError::Permanent("token response missing access_token".to_string()))?
            .to_string();
        let ttl = body["expires_in"].as_u64().unwrap_or(3600).saturating_sub(60);
        *self.token.lock() = Some((
            token.clone(),
            std::time::Instant::now() + std::time::Duration::from_secs(ttl),
        ));
        Ok(token)
    }

    async fn post_webhook(&self, card: &Value) -> Result<(), SinkError> {
        let settings = self.settings()?;
        let url = settings
            .webhook_url
            .as_deref()
            .ok_or(SinkError::NotConfigured)?;
        let payload = json!({
            "type": "message",
            "attachments": [{
                "contentType": "application/vnd.microsoft.card.adaptive",
                "content": card,
            }],
        });
        let response = self.client.post(url).json(&payload).send().await?;
        classify_status(response.status())
    }

    async fn post_channel(&self, target: &ChannelTarget, card: &Value) -> Result<(), SinkError> {
        let token = self.bearer_token().await?;
        let url = format!(
            "https://graph.microsoft.com/v1.0/teams/{}/channels/{}/messages",
            target.team_id, target.channel_id
        );
        let payload = json!({
            "body": {
                "contentType": "html",
                "content": "<attachment id=\"card1\"></attachment>",
            },
            "attachments": [{
                "id": "card1",
                "contentType": "application/vnd.microsoft.card.adaptive",
                "content": card.to_string(),
            }],
        });
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?;
        debug!(team = %target.team_id, channel = %target.channel_id, "Posted channel message");
        classify_status(response.status())
    }
}

fn classify_status(status: reqwest::StatusCode) -> Result<(), SinkError> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() || status.as_u16() == 429 || status.as_u16() == 408 {
        Err(SinkError::Transient(format!("teams returned {}", status)))
    } else {
        Err(SinkError::Permanent(format!("teams returned {}", status)))
    }
}

#[async_trait]
impl Sink for TeamsSink {
    fn name(&self) -> &'static str {
        "teams"
    }

    fn format(&self, event: &AlertEvent, target: Option<&ChannelTarget>) -> Result<Value, SinkError> {
        let settings = self.settings()?;
        if settings.webhook_url.is_none() && settings.graph.is_none() {
            return Err(SinkError::NotConfigured);
        }
        let resolved = self.resolve_target(event, target);
        Ok(json!({
            "card": self.card(event),
            "target": resolved,
        }))
    }

    async fn send(&self, _event: &AlertEvent, payload: &Value) -> Result<(), SinkError> {
        let settings = self.settings()?;
        let card = &payload["card"];
        let target: Option<ChannelTarget> =
            serde_json::from_value(payload["target"].clone()).unwrap_or(None);

        match target {
            Some(target) if settings.graph.is_some() => self.post_channel(&target, card).await,
            _ => self.post_webhook(card).await,
        }
    }

    async fn test(&self, message: &str) -> Result<(), SinkError> {
        let card = json!({
            "$schema": "http://adaptivecards.io/schemas/adaptive-card.json",
            "type": "AdaptiveCard",
            "version": "1.4",
            "body": [{"type": "TextBlock", "text": message, "wrap": true}],
            "actions": [],
        });
        self.post_webhook(&card).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::rule::Severity;
    use std::collections::HashMap;

    fn webhook_settings() -> TeamsSettings {
        TeamsSettings {
            webhook_url: Some("https://teams.example/webhook".to_string()),
            graph: None,
            severity_channels: HashMap::new(),
        }
    }

    #[test]
    fn test_unconfigured() {
        let sink = TeamsSink::new(None, reqwest::Client::new(), None);
        let event = crate::notify::tests_support::fired_event();
        assert!(matches!(
            sink.format(&event, None),
            Err(SinkError::NotConfigured)
        ));
    }

    #[test]
    fn test_card_structure() {
        let sink = TeamsSink::new(
            Some(webhook_settings()),
            reqwest::Client::new(),
            Some("https://vigil.example".to_string()),
        );
        let event = crate::notify::tests_support::fired_event();
        let payload = sink.format(&event, None).unwrap();
        let card = &payload["card"];
        assert_eq!(card["type"], "AdaptiveCard");
        assert_eq!(card["body"][0]["type"], "TextBlock");
        assert_eq!(card["body"][1]["type"], "FactSet");
        assert_eq!(card["actions"][0]["type"], "Action.OpenUrl");
        assert!(payload["target"].is_null());
    }

    #[test]
    fn test_severity_channel_fallback() {
        let mut settings = webhook_settings();
        settings
            .severity_channels
            .insert("critical".to_string(), ("T9".to_string(), "C9".to_string()));
        let sink = TeamsSink::new(Some(settings), reqwest::Client::new(), None);

        let mut event = crate::notify::tests_support::fired_event();
        event.instance.severity = Severity::Critical;
        let payload = sink.format(&event, None).unwrap();
        assert_eq!(payload["target"]["team_id"], "T9");
        assert_eq!(payload["target"]["channel_id"], "C9");
    }

    #[test]
    fn test_routed_target_wins() {
        let mut settings = webhook_settings();
        settings
            .severity_channels
            .insert("critical".to_string(), ("T9".to_string(), "C9".to_string()));
        let sink = TeamsSink::new(Some(settings), reqwest::Client::new(), None);

        let mut event = crate::notify::tests_support::fired_event();
        event.instance.severity = Severity::Critical;
        let routed = ChannelTarget {
            team_id: "T2".to_string(),
            channel_id: "C2".to_string(),
        };
        let payload = sink.format(&event, Some(&routed)).unwrap();
        assert_eq!(payload["target"]["channel_id"], "C2");
    }
}
