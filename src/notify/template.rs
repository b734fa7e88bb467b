// vigil: Shared notification formatting

use serde_json::{json, Value};

use crate::alerts::rule::Severity;
use crate::events::{AlertEvent, TransitionKind};

/// Hex color for a severity, uniform across adapters
pub fn severity_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "#d32f2f",
        Severity::High => "#f57c00",
        Severity::Medium => "#fbc02d",
        Severity::Low => "#388e3c",
        Severity::Info => "#1976d2",
    }
}

/// Severity name usable in CSS class names and card styles
pub fn severity_style(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "attention",
        Severity::High => "warning",
        Severity::Medium => "warning",
        Severity::Low => "good",
        Severity::Info => "accent",
    }
}

/// Emoji for a transition kind, uniform across adapters
pub fn transition_emoji(kind: TransitionKind) -> &'static str {
    match kind {
        TransitionKind::Fired => "\u{1F6A8}",    // rotating light
        TransitionKind::Resolved => "\u{2705}",  // check mark
        TransitionKind::Silenced => "\u{1F507}", // muted speaker
    }
}

/// Human title line for an event
pub fn title(event: &AlertEvent) -> String {
    let verb = match event.kind {
        TransitionKind::Fired => "FIRING",
        TransitionKind::Resolved => "RESOLVED",
        TransitionKind::Silenced => "SILENCED",
    };
    format!(
        "{} {}: {}",
        transition_emoji(event.kind),
        verb,
        event.instance.rule_name
    )
}

/// Field list shared by the chat-style payloads
pub fn fields(event: &AlertEvent) -> Vec<Value> {
    let instance = &event.instance;
    let mut fields = vec![
        json!({"title": "Severity", "value": instance.severity.to_string(), "short": true}),
        json!({"title": "State", "value": format!("{:?}", instance.state).to_lowercase(), "short": true}),
    ];
    if let Some(first) = instance.first_fired_at {
        fields.push(json!({
            "title": "First fired",
            "value": first.to_rfc3339(),
            "short": true,
        }));
    }
    if let Some(until) = instance.silenced_until {
        fields.push(json!({
            "title": "Silenced until",
            "value": until.to_rfc3339(),
            "short": true,
        }));
    }
    for (key, value) in &instance.labels {
        fields.push(json!({"title": key, "value": value, "short": true}));
    }
    fields
}

/// Subject line for email delivery
pub fn email_subject(event: &AlertEvent) -> String {
    format!(
        "[{}] {}",
        event.instance.severity.to_string().to_uppercase(),
        title(event)
    )
}

/// Severity-parameterized HTML body for email delivery
pub fn email_html(event: &AlertEvent) -> String {
    let instance = &event.instance;
    let color = severity_color(instance.severity);
    let mut rows = String::new();
    rows.push_str(&format!(
        "<tr><td><b>Severity</b></td><td>{}</td></tr>",
        instance.severity
    ));
    rows.push_str(&format!(
        "<tr><td><b>Message</b></td><td>{}</td></tr>",
        html_escape(&instance.message)
    ));
    if let Some(first) = instance.first_fired_at {
        rows.push_str(&format!(
            "<tr><td><b>First fired</b></td><td>{}</td></tr>",
            first.to_rfc3339()
        ));
    }
    for (key, value) in &instance.labels {
        rows.push_str(&format!(
            "<tr><td><b>{}</b></td><td>{}</td></tr>",
            html_escape(key),
            html_escape(value)
        ));
    }

    format!(
        concat!(
            "<html><body style=\"font-family:sans-serif\">",
            "<div style=\"border-left:6px solid {color};padding:12px\">",
            "<h2 style=\"color:{color}\">{title}</h2>",
            "<table cellpadding=\"4\">{rows}</table>",
            "<p style=\"color:#888;font-size:12px\">vigil · {ts}</p>",
            "</div></body></html>"
        ),
        color = color,
        title = html_escape(&title(event)),
        rows = rows,
        ts = event.at.to_rfc3339(),
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::rule::{Action, Condition, Rule, RuleSpec, Threshold, ThresholdOp};
    use crate::alerts::state::AlertInstance;
    use std::collections::BTreeMap;

    fn sample_event(kind: TransitionKind, severity: Severity) -> AlertEvent {
        let mut labels = BTreeMap::new();
        labels.insert("host".to_string(), "web-1".to_string());
        let rule = Rule::from_spec(RuleSpec {
            name: "cpu_high".to_string(),
            description: String::new(),
            severity,
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
            labels,
            annotations: BTreeMap::new(),
        });
        AlertEvent::new(kind, AlertInstance::firing(&rule, chrono::Utc::now()))
    }

    #[test]
    fn test_severity_colors_are_distinct() {
        let all = [
            Severity::Critical,
            Severity::High,
            Severity::Medium,
            Severity::Low,
            Severity::Info,
        ];
        let mut colors: Vec<&str> = all.iter().map(|s| severity_color(*s)).collect();
        colors.sort();
        colors.dedup();
        assert_eq!(colors.len(), all.len());
    }

    #[test]
    fn test_title_carries_rule_name() {
        let event = sample_event(TransitionKind::Fired, Severity::Critical);
        let t = title(&event);
        assert!(t.contains("FIRING"));
        assert!(t.contains("cpu_high"));
    }

    #[test]
    fn test_fields_include_labels() {
        let event = sample_event(TransitionKind::Fired, Severity::High);
        let fs = fields(&event);
        assert!(fs.iter().any(|f| f["title"] == "host"));
        assert!(fs.iter().any(|f| f["title"] == "Severity"));
    }

    #[test]
    fn test_email_html_escapes_and_colors() {
        let mut event = sample_event(TransitionKind::Fired, Severity::Critical);
        event.instance.message = "load <1m> & rising".to_string();
        let html = email_html(&event);
        assert!(html.contains("&lt;1m&gt; &amp; rising"));
        assert!(html.contains(severity_color(Severity::Critical)));
    }
}
