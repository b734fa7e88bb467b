// vigil: Chat webhook sinks and callback handling

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::alerts::engine::AlertCommands;
use crate::config::{ChatSettings, DiscordSettings};
use crate::error::{CoreError, CoreResult};
use crate::events::{AlertEvent, TransitionKind};
use crate::notify::router::ChannelTarget;
use crate::notify::template;
use crate::notify::{Sink, SinkError};

/// Payload dialect spoken by the webhook
enum ChatFlavor {
    /// Attachment-style JSON with interactive actions
    Generic,
    /// Discord embed JSON
    Discord,
}

/// Webhook-chat sink
///
/// Posts attachment documents to a chat webhook. The generic flavor carries
/// callback actions; Discord posts embeds without them.
pub struct ChatWebhookSink {
    flavor: ChatFlavor,
    client: reqwest::Client,
    webhook_url: Option<String>,
    channel: Option<String>,
    username: Option<String>,
    icon: Option<String>,
}

impl ChatWebhookSink {
    pub fn chat(settings: Option<ChatSettings>, client: reqwest::Client) -> Self {
        let (webhook_url, channel, username, icon) = match settings {
            Some(s) => (Some(s.webhook_url), s.channel, s.username, s.icon_emoji),
            None => (None, None, None, None),
        };
        Self {
            flavor: ChatFlavor::Generic,
            client,
            webhook_url,
            channel,
            username,
            icon,
        }
    }

    pub fn discord(settings: Option<DiscordSettings>, client: reqwest::Client) -> Self {
        let (webhook_url, username, icon) = match settings {
            Some(s) => (Some(s.webhook_url), s.username, s.avatar_url),
            None => (None, None, None),
        };
        Self {
            flavor: ChatFlavor::Discord,
            client,
            webhook_url,
            channel: None,
            username,
            icon,
        }
    }

    fn url(&self) -> Result<&str, SinkError> {
        self.webhook_url.as_deref().ok_or(SinkError::NotConfigured)
    }

    fn generic_payload(&self, event: &AlertEvent) -> Value {
        let instance = &event.instance;
        let mut attachment = json!({
            "title": template::title(event),
            "color": template::severity_color(instance.severity),
            "fields": template::fields(event),
            "footer": "vigil",
            "ts": event.at.timestamp(),
        });
        if event.kind == TransitionKind::Fired {
            attachment["actions"] = json!([
                {
                    "type": "button",
                    "text": "Silence 1h",
                    "callback_id": "vigil_action",
                    "value": json!({
                        "verb": "silence",
                        "rule_id": instance.rule_id,
                        "duration_secs": 3600,
                    }).to_string(),
                },
                {
                    "type": "button",
                    "text": "Resolve",
                    "callback_id": "vigil_action",
                    "value": json!({
                        "verb": "resolve",
                        "rule_id": instance.rule_id,
                    }).to_string(),
                },
                {
                    "type": "button",
                    "text": "Refresh",
                    "callback_id": "vigil_action",
                    "value": json!({"verb": "refresh"}).to_string(),
                },
            ]);
        }

        let mut payload = json!({ "attachments": [attachment] });
        if let Some(channel) = &self.channel {
            payload["channel"] = json!(channel);
        }
        if let Some(username) = &self.username {
            payload["username"] = json!(username);
        }
        if let Some(icon) = &self.icon {
            payload["icon_emoji"] = json!(icon);
        }
        payload
    }

    fn discord_payload(&self, event: &AlertEvent) -> Value {
        let instance = &event.instance;
        let color = u32::from_str_radix(
            template::severity_color(instance.severity).trim_start_matches('#'),
            16,
        )
        .unwrap_or(0x808080);

        let fields: Vec<Value> = template::fields(event)
            .into_iter()
            .map(|f| json!({"name": f["title"], "value": f["value"], "inline": true}))
            .collect();

        let mut payload = json!({
            "embeds": [{
                "title": template::title(event),
                "color": color,
                "fields": fields,
                "footer": {"text": "vigil"},
                "timestamp": event.at.to_rfc3339(),
            }]
        });
        if let Some(username) = &self.username {
            payload["username"] = json!(username);
        }
        if let Some(icon) = &self.icon {
            payload["avatar_url"] = json!(icon);
        }
        payload
    }

    async fn post(&self, payload: &Value) -> Result<(), SinkError> {
        let url = self.url()?;
        let response = self.client.post(url).json(payload).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() || status.as_u16() == 429 || status.as_u16() == 408 {
            Err(SinkError::Transient(format!("webhook returned {}", status)))
        } else {
            Err(SinkError::Permanent(format!("webhook returned {}", status)))
        }
    }
}

#[async_trait]
impl Sink for ChatWebhookSink {
    fn name(&self) -> &'static str {
        match self.flavor {
            ChatFlavor::Generic => "chat-webhook",
            ChatFlavor::Discord => "discord-webhook",
        }
    }

    fn format(&self, event: &AlertEvent, _target: Option<&ChannelTarget>) -> Result<Value, SinkError> {
        self.url()?;
        Ok(match self.flavor {
            ChatFlavor::Generic => self.generic_payload(event),
            ChatFlavor::Discord => self.discord_payload(event),
        })
    }

    async fn send(&self, _event: &AlertEvent, payload: &Value) -> Result<(), SinkError> {
        self.post(payload).await
    }

    async fn test(&self, message: &str) -> Result<(), SinkError> {
        let payload = match self.flavor {
            ChatFlavor::Generic => json!({"text": message}),
            ChatFlavor::Discord => json!({"content": message}),
        };
        self.post(&payload).await
    }
}

/// A verb relayed back from a chat surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Silence { rule_id: Uuid, duration_secs: u64 },
    Resolve { rule_id: Uuid },
    Refresh,
    Status,
}

/// Parse an interactive action callback into a command
pub fn parse_interactive(payload: &Value) -> CoreResult<ChatCommand> {
    let action = payload["actions"]
        .get(0)
        .or_else(|| payload.get("action"))
        .ok_or_else(|| CoreError::InvalidInput("callback carries no action".to_string()))?;
    let value: Value = match &action["value"] {
        Value::String(s) => serde_json::from_str(s)
            .map_err(|e| CoreError::InvalidInput(format!("malformed action value: {}", e)))?,
        v @ Value::Object(_) => v.clone(),
        _ => {
            return Err(CoreError::InvalidInput(
                "action value missing".to_string(),
            ))
        }
    };
    command_from_value(&value)
}

fn command_from_value(value: &Value) -> CoreResult<ChatCommand> {
    let verb = value["verb"]
        .as_str()
        .ok_or_else(|| CoreError::InvalidInput("action verb missing".to_string()))?;
    match verb {
        "silence" => Ok(ChatCommand::Silence {
            rule_id: parse_rule_id(value)?,
            duration_secs: value["duration_secs"].as_u64().unwrap_or(3600),
        }),
        "resolve" => Ok(ChatCommand::Resolve {
            rule_id: parse_rule_id(value)?,
        }),
        "refresh" => Ok(ChatCommand::Refresh),
        "status" => Ok(ChatCommand::Status),
        other => Err(CoreError::InvalidInput(format!(
            "unknown action verb: {}",
            other
        ))),
    }
}

fn parse_rule_id(value: &Value) -> CoreResult<Uuid> {
    let raw = value["rule_id"]
        .as_str()
        .ok_or_else(|| CoreError::InvalidInput("rule_id missing".to_string()))?;
    Uuid::parse_str(raw).map_err(|_| CoreError::InvalidInput(format!("bad rule id: {}", raw)))
}

/// Parse a slash command payload (`{"text": "silence <id> 30m"}`)
pub fn parse_slash(payload: &Value) -> CoreResult<ChatCommand> {
    let text = payload["text"].as_str().unwrap_or("").trim();
    let mut parts = text.split_whitespace();
    match parts.next() {
        Some("silence") => {
            let id = parts
                .next()
                .ok_or_else(|| CoreError::InvalidInput("usage: silence <rule-id> [duration]".to_string()))?;
            let rule_id = Uuid::parse_str(id)
                .map_err(|_| CoreError::InvalidInput(format!("bad rule id: {}", id)))?;
            let duration_secs = match parts.next() {
                Some(d) => parse_duration_secs(d)?,
                None => 3600,
            };
            Ok(ChatCommand::Silence {
                rule_id,
                duration_secs,
            })
        }
        Some("resolve") => {
            let id = parts
                .next()
                .ok_or_else(|| CoreError::InvalidInput("usage: resolve <rule-id>".to_string()))?;
            let rule_id = Uuid::parse_str(id)
                .map_err(|_| CoreError::InvalidInput(format!("bad rule id: {}", id)))?;
            Ok(ChatCommand::Resolve { rule_id })
        }
        Some("refresh") => Ok(ChatCommand::Refresh),
        Some("status") | None => Ok(ChatCommand::Status),
        Some(other) => Err(CoreError::InvalidInput(format!(
            "unknown command: {}",
            other
        ))),
    }
}

/// "90", "30s", "15m", "2h", "1d"
fn parse_duration_secs(s: &str) -> CoreResult<u64> {
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, ""),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| CoreError::InvalidInput(format!("bad duration: {}", s)))?;
    let factor = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return Err(CoreError::InvalidInput(format!("bad duration unit: {}", s))),
    };
    Ok(n * factor)
}

/// Execute a chat command against the alert engine and build the reply
pub async fn execute_command(
    command: ChatCommand,
    alerts: &dyn AlertCommands,
) -> CoreResult<Value> {
    match command {
        ChatCommand::Silence {
            rule_id,
            duration_secs,
        } => {
            alerts.silence(rule_id, duration_secs).await?;
            Ok(json!({"text": format!("Silenced {} for {}s", rule_id, duration_secs)}))
        }
        ChatCommand::Resolve { rule_id } => {
            alerts.resolve(rule_id).await?;
            Ok(json!({"text": format!("Resolved {}", rule_id)}))
        }
        ChatCommand::Refresh => {
            alerts.refresh().await?;
            Ok(json!({"text": "Evaluation refreshed"}))
        }
        ChatCommand::Status => {
            let instances = alerts.status();
            let lines: Vec<String> = instances
                .iter()
                .map(|i| {
                    format!(
                        "{} {} [{}] {:?}",
                        template::transition_emoji(TransitionKind::Fired),
                        i.rule_name,
                        i.severity,
                        i.state
                    )
                })
                .collect();
            let text = if lines.is_empty() {
                "No active alerts".to_string()
            } else {
                lines.join("\n")
            };
            Ok(json!({"text": text}))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interactive_silence() {
        let rule_id = Uuid::new_v4();
        let payload = json!({
            "callback_id": "vigil_action",
            "actions": [{
                "value": json!({
                    "verb": "silence",
                    "rule_id": rule_id,
                    "duration_secs": 900,
                }).to_string(),
            }],
        });
        assert_eq!(
            parse_interactive(&payload).unwrap(),
            ChatCommand::Silence {
                rule_id,
                duration_secs: 900
            }
        );
    }

    #[test]
    fn test_parse_interactive_rejects_garbage() {
        assert!(parse_interactive(&json!({})).is_err());
        let no_verb = json!({"actions": [{"value": "{}"}]});
        assert!(parse_interactive(&no_verb).is_err());
        let bad_verb = json!({"actions": [{"value": "{\"verb\":\"explode\"}"}]});
        assert!(parse_interactive(&bad_verb).is_err());
    }

    #[test]
    fn test_parse_slash_commands() {
        let rule_id = Uuid::new_v4();

        let silence = json!({"text": format!("silence {} 15m", rule_id)});
        assert_eq!(
            parse_slash(&silence).unwrap(),
            ChatCommand::Silence {
                rule_id,
                duration_secs: 900
            }
        );

        let resolve = json!({"text": format!("resolve {}", rule_id)});
        assert_eq!(parse_slash(&resolve).unwrap(), ChatCommand::Resolve { rule_id });

        assert_eq!(parse_slash(&json!({"text": "refresh"})).unwrap(), ChatCommand::Refresh);
        assert_eq!(parse_slash(&json!({"text": "status"})).unwrap(), ChatCommand::Status);
        assert_eq!(parse_slash(&json!({"text": ""})).unwrap(), ChatCommand::Status);
        assert!(parse_slash(&json!({"text": "dance"})).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_secs("90").unwrap(), 90);
        assert_eq!(parse_duration_secs("30s").unwrap(), 30);
        assert_eq!(parse_duration_secs("15m").unwrap(), 900);
        assert_eq!(parse_duration_secs("2h").unwrap(), 7200);
        assert_eq!(parse_duration_secs("1d").unwrap(), 86400);
        assert!(parse_duration_secs("eternity").is_err());
    }

    #[test]
    fn test_unconfigured_sink_formats_as_not_configured() {
        let sink = ChatWebhookSink::chat(None, reqwest::Client::new());
        let event = crate::notify::tests_support::fired_event();
        assert!(matches!(
            sink.format(&event, None),
            Err(SinkError::NotConfigured)
        ));
    }

    #[test]
    fn test_generic_payload_shape() {
        let sink = ChatWebhookSink::chat(
            Some(ChatSettings {
                webhook_url: "https://hooks.example/x".to_string(),
                channel: Some("#alerts".to_string()),
                username: Some("vigil".to_string()),
                icon_emoji: Some(":rotating_light:".to_string()),
            }),
            reqwest::Client::new(),
        );
        let event = crate::notify::tests_support::fired_event();
        let payload = sink.format(&event, None).unwrap();

        assert_eq!(payload["channel"], "#alerts");
        let attachment = &payload["attachments"][0];
        assert!(attachment["title"].as_str().unwrap().contains("FIRING"));
        assert_eq!(attachment["footer"], "vigil");
        // fired events carry the three callback actions
        assert_eq!(attachment["actions"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_discord_payload_shape() {
        let sink = ChatWebhookSink::discord(
            Some(DiscordSettings {
                webhook_url: "https://discord.example/x".to_string(),
                username: Some("vigil".to_string()),
                avatar_url: None,
            }),
            reqwest::Client::new(),
        );
        let event = crate::notify::tests_support::fired_event();
        let payload = sink.format(&event, None).unwrap();
        let embed = &payload["embeds"][0];
        assert!(embed["color"].as_u64().is_some());
        assert_eq!(embed["footer"]["text"], "vigil");
    }
}
