// vigil: Alert rule model and validation

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alerts::schedule::Schedule;
use crate::alerts::throttle::ThrottlePolicy;
use crate::error::{CoreError, CoreResult};
use crate::metrics::TimeFrame;

/// Alert severity, ascending
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Severity> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Some(Severity::Info),
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Threshold comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Ne,
    Between,
    Outside,
}

/// Threshold against which an aggregated value is compared
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub op: ThresholdOp,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value2: Option<f64>,
}

impl Threshold {
    /// Compare a value; NaN never matches
    pub fn matches(&self, v: f64) -> bool {
        if v.is_nan() {
            return false;
        }
        match self.op {
            ThresholdOp::Gt => v > self.value,
            ThresholdOp::Gte => v >= self.value,
            ThresholdOp::Lt => v < self.value,
            ThresholdOp::Lte => v <= self.value,
            ThresholdOp::Eq => v == self.value,
            ThresholdOp::Ne => v != self.value,
            ThresholdOp::Between => {
                let hi = self.value2.unwrap_or(self.value);
                self.value <= v && v <= hi
            }
            ThresholdOp::Outside => {
                let hi = self.value2.unwrap_or(self.value);
                v < self.value || v > hi
            }
        }
    }

    fn validate(&self) -> CoreResult<()> {
        match self.op {
            ThresholdOp::Between | ThresholdOp::Outside => {
                let hi = self.value2.ok_or_else(|| {
                    CoreError::InvalidInput(format!(
                        "{:?} threshold requires a second value",
                        self.op
                    ))
                })?;
                if self.value > hi {
                    return Err(CoreError::InvalidInput(
                        "threshold range start must not exceed end".to_string(),
                    ));
                }
            }
            _ => {
                if self.value2.is_some() {
                    return Err(CoreError::InvalidInput(format!(
                        "{:?} threshold takes a single value",
                        self.op
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Composite condition operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

/// Condition tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Simple {
        metric: String,
        threshold: Threshold,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time_frame: Option<TimeFrame>,
    },
    Composite {
        operator: LogicalOp,
        children: Vec<Condition>,
    },
    TimeBased {
        metric: String,
        time_frame: TimeFrame,
        threshold: Threshold,
    },
}

impl Condition {
    pub fn validate(&self) -> CoreResult<()> {
        match self {
            Condition::Simple {
                metric, threshold, ..
            }
            | Condition::TimeBased {
                metric, threshold, ..
            } => {
                if metric.is_empty() {
                    return Err(CoreError::InvalidInput(
                        "condition metric is empty".to_string(),
                    ));
                }
                threshold.validate()
            }
            Condition::Composite { operator, children } => {
                if children.is_empty() {
                    return Err(CoreError::InvalidInput(
                        "composite condition has no children".to_string(),
                    ));
                }
                if *operator == LogicalOp::Not && children.len() != 1 {
                    return Err(CoreError::InvalidInput(
                        "not condition takes exactly one child".to_string(),
                    ));
                }
                for child in children {
                    child.validate()?;
                }
                Ok(())
            }
        }
    }
}

/// Notification action attached to a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: String,
    pub target: String,
}

/// Mutable rule fields as supplied by callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub condition: Condition,
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<ThrottlePolicy>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

fn default_severity() -> Severity {
    Severity::Medium
}

fn default_priority() -> u32 {
    100
}

fn default_enabled() -> bool {
    true
}

impl RuleSpec {
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.is_empty() {
            return Err(CoreError::InvalidInput("rule name is empty".to_string()));
        }
        self.condition.validate()?;
        if self.actions.is_empty() {
            return Err(CoreError::InvalidInput(
                "rule must carry at least one action".to_string(),
            ));
        }
        for action in &self.actions {
            if action.action_type.is_empty() || action.target.is_empty() {
                return Err(CoreError::InvalidInput(
                    "action requires both type and target".to_string(),
                ));
            }
        }
        if let Some(schedule) = &self.schedule {
            schedule.validate()?;
        }
        if let Some(throttle) = &self.throttle {
            throttle.validate()?;
        }
        Ok(())
    }
}

/// A stored alert rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    #[serde(flatten)]
    pub spec: RuleSpec,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    pub fn from_spec(spec: RuleSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            spec,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn simple_condition(metric: &str, op: ThresholdOp, value: f64) -> Condition {
        Condition::Simple {
            metric: metric.to_string(),
            threshold: Threshold {
                op,
                value,
                value2: None,
            },
            time_frame: None,
        }
    }

    fn valid_spec() -> RuleSpec {
        RuleSpec {
            name: "cpu_high".to_string(),
            description: String::new(),
            severity: Severity::High,
            priority: 10,
            enabled: true,
            condition: simple_condition("cpu", ThresholdOp::Gt, 80.0),
            actions: vec![Action {
                action_type: "notify".to_string(),
                target: "ops".to_string(),
            }],
            schedule: None,
            throttle: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    #[test_case(ThresholdOp::Gt, 80.0, 81.0, true; "gt above")]
    #[test_case(ThresholdOp::Gt, 80.0, 80.0, false; "gt equal")]
    #[test_case(ThresholdOp::Gte, 80.0, 80.0, true; "gte equal")]
    #[test_case(ThresholdOp::Lt, 80.0, 79.9, true; "lt below")]
    #[test_case(ThresholdOp::Lte, 80.0, 80.1, false; "lte above")]
    #[test_case(ThresholdOp::Eq, 5.0, 5.0, true; "eq exact")]
    #[test_case(ThresholdOp::Ne, 5.0, 5.5, true; "ne different")]
    fn test_scalar_operators(op: ThresholdOp, value: f64, sample: f64, expected: bool) {
        let threshold = Threshold {
            op,
            value,
            value2: None,
        };
        assert_eq!(threshold.matches(sample), expected);
    }

    #[test]
    fn test_threshold_matching() {
        let gt = Threshold {
            op: ThresholdOp::Gt,
            value: 80.0,
            value2: None,
        };
        assert!(gt.matches(81.0));
        assert!(!gt.matches(80.0));
        assert!(!gt.matches(f64::NAN));

        let ne = Threshold {
            op: ThresholdOp::Ne,
            value: 1.0,
            value2: None,
        };
        // NaN never matches, even for ne
        assert!(!ne.matches(f64::NAN));

        let between = Threshold {
            op: ThresholdOp::Between,
            value: 10.0,
            value2: Some(20.0),
        };
        assert!(between.matches(10.0));
        assert!(between.matches(20.0));
        assert!(!between.matches(20.5));

        let outside = Threshold {
            op: ThresholdOp::Outside,
            value: 10.0,
            value2: Some(20.0),
        };
        assert!(outside.matches(9.9));
        assert!(outside.matches(21.0));
        assert!(!outside.matches(15.0));
    }

    #[test]
    fn test_range_threshold_requires_ordered_values() {
        let bad = Threshold {
            op: ThresholdOp::Between,
            value: 20.0,
            value2: Some(10.0),
        };
        assert!(bad.validate().is_err());
        let missing = Threshold {
            op: ThresholdOp::Outside,
            value: 20.0,
            value2: None,
        };
        assert!(missing.validate().is_err());
    }

    #[test]
    fn test_spec_validation() {
        assert!(valid_spec().validate().is_ok());

        let mut no_actions = valid_spec();
        no_actions.actions.clear();
        assert!(no_actions.validate().is_err());

        let mut bad_action = valid_spec();
        bad_action.actions[0].target = String::new();
        assert!(bad_action.validate().is_err());

        let mut bad_not = valid_spec();
        bad_not.condition = Condition::Composite {
            operator: LogicalOp::Not,
            children: vec![
                simple_condition("a", ThresholdOp::Gt, 1.0),
                simple_condition("b", ThresholdOp::Gt, 1.0),
            ],
        };
        assert!(bad_not.validate().is_err());

        let mut empty_composite = valid_spec();
        empty_composite.condition = Condition::Composite {
            operator: LogicalOp::And,
            children: vec![],
        };
        assert!(empty_composite.validate().is_err());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Info < Severity::Low);
        assert_eq!(Severity::parse("CRITICAL"), Some(Severity::Critical));
        assert_eq!(Severity::parse("nope"), None);
    }

    #[test]
    fn test_condition_serde_tagging() {
        let condition = simple_condition("cpu", ThresholdOp::Gt, 80.0);
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "simple");
        assert_eq!(json["metric"], "cpu");
        let back: Condition = serde_json::from_value(json).unwrap();
        assert_eq!(back, condition);
    }
}
