// vigil: Alert instance lifecycle

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alerts::rule::{Rule, Severity};

/// Lifecycle state of an alert instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    /// Condition matched but the firing is gated by the throttler
    Pending,
    Firing,
    Silenced,
    Resolved,
}

/// Live state of one rule; at most one instance exists per rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertInstance {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub severity: Severity,
    pub message: String,
    pub state: AlertState,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub first_fired_at: Option<DateTime<Utc>>,
    pub last_evaluated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub silenced_until: Option<DateTime<Utc>>,
}

impl AlertInstance {
    fn base(rule: &Rule, state: AlertState, now: DateTime<Utc>) -> Self {
        Self {
            rule_id: rule.id,
            rule_name: rule.spec.name.clone(),
            severity: rule.spec.severity,
            message: format!("Rule '{}' condition met", rule.spec.name),
            state,
            labels: rule.spec.labels.clone(),
            annotations: rule.spec.annotations.clone(),
            first_fired_at: None,
            last_evaluated_at: now,
            resolved_at: None,
            silenced_until: None,
        }
    }

    /// Fresh firing instance
    pub fn firing(rule: &Rule, now: DateTime<Utc>) -> Self {
        let mut instance = Self::base(rule, AlertState::Firing, now);
        instance.first_fired_at = Some(now);
        instance
    }

    /// Fresh throttle-gated instance
    pub fn pending(rule: &Rule, now: DateTime<Utc>) -> Self {
        Self::base(rule, AlertState::Pending, now)
    }

    /// Promote to Firing, clearing any resolution or silence
    pub fn fire(&mut self, now: DateTime<Utc>) {
        self.state = AlertState::Firing;
        if self.first_fired_at.is_none() {
            self.first_fired_at = Some(now);
        }
        self.resolved_at = None;
        self.silenced_until = None;
        self.last_evaluated_at = now;
    }

    /// Return to Firing without touching first-fired (silence lapsed)
    pub fn refire(&mut self, now: DateTime<Utc>) {
        self.state = AlertState::Firing;
        self.resolved_at = None;
        self.silenced_until = None;
        self.last_evaluated_at = now;
    }

    pub fn resolve(&mut self, now: DateTime<Utc>) {
        self.state = AlertState::Resolved;
        self.resolved_at = Some(now);
        self.silenced_until = None;
        self.last_evaluated_at = now;
    }

    pub fn silence(&mut self, until: DateTime<Utc>, now: DateTime<Utc>) {
        self.state = AlertState::Silenced;
        self.silenced_until = Some(until);
        self.resolved_at = None;
        self.last_evaluated_at = now;
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_evaluated_at = now;
    }

    /// State/field invariants hold
    pub fn invariants_hold(&self) -> bool {
        (self.resolved_at.is_some() == (self.state == AlertState::Resolved))
            && (self.silenced_until.is_some() == (self.state == AlertState::Silenced))
    }
}
