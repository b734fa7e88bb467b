// vigil: Channel routing

use serde::{Deserialize, Serialize};

use crate::alerts::rule::Severity;

/// Destination selected by a channel rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTarget {
    pub team_id: String,
    pub channel_id: String,
}

/// One routing entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRule {
    pub event_type: String,
    pub severity: Option<Severity>,
    pub team_id: String,
    pub channel_id: String,
}

/// Ordered (event type, severity) to (team, channel) router
///
/// A severity-bound rule beats a generic one; among equally specific rules
/// the earliest wins. At most one target comes back per evaluation.
pub struct ChannelRouter {
    rules: Vec<ChannelRule>,
}

impl ChannelRouter {
    pub fn new(rules: Vec<ChannelRule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn select(&self, event_type: &str, severity: Severity) -> Option<ChannelTarget> {
        let mut generic: Option<&ChannelRule> = None;
        for rule in &self.rules {
            if rule.event_type != event_type {
                continue;
            }
            match rule.severity {
                Some(bound) if bound == severity => {
                    return Some(ChannelTarget {
                        team_id: rule.team_id.clone(),
                        channel_id: rule.channel_id.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    if generic.is_none() {
                        generic = Some(rule);
                    }
                }
            }
        }
        generic.map(|rule| ChannelTarget {
            team_id: rule.team_id.clone(),
            channel_id: rule.channel_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(event: &str, severity: Option<Severity>, team: &str, channel: &str) -> ChannelRule {
        ChannelRule {
            event_type: event.to_string(),
            severity,
            team_id: team.to_string(),
            channel_id: channel.to_string(),
        }
    }

    #[test]
    fn test_severity_bound_beats_generic() {
        let router = ChannelRouter::new(vec![
            rule("alert", None, "T1", "C1"),
            rule("alert", Some(Severity::Critical), "T2", "C2"),
        ]);

        let critical = router.select("alert", Severity::Critical).unwrap();
        assert_eq!(critical.channel_id, "C2");

        let medium = router.select("alert", Severity::Medium).unwrap();
        assert_eq!(medium.channel_id, "C1");
    }

    #[test]
    fn test_event_type_must_match() {
        let router = ChannelRouter::new(vec![rule("alert", None, "T1", "C1")]);
        assert!(router.select("resolved", Severity::Critical).is_none());
    }

    #[test]
    fn test_first_generic_wins_among_equals() {
        let router = ChannelRouter::new(vec![
            rule("alert", None, "T1", "C1"),
            rule("alert", None, "T9", "C9"),
        ]);
        assert_eq!(router.select("alert", Severity::Low).unwrap().channel_id, "C1");
    }

    #[test]
    fn test_no_rules_no_target() {
        let router = ChannelRouter::new(vec![]);
        assert!(router.select("alert", Severity::Critical).is_none());
        assert!(router.is_empty());
    }
}
