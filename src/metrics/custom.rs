// vigil: User-defined metrics

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::metrics::registry::{MetricKind, MetricOverview, MetricRegistry, MetricShape};

/// A user-defined metric definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomMetricDef {
    pub shape: MetricShape,
    pub created_at: DateTime<Utc>,
}

/// Action applied by a record call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordAction {
    Inc,
    Add,
    Set,
    Observe,
}

/// Store of user-defined metrics layered over the core registry
pub struct CustomMetrics {
    registry: Arc<MetricRegistry>,
    defs: DashMap<String, CustomMetricDef>,
}

impl CustomMetrics {
    pub fn new(registry: Arc<MetricRegistry>) -> Self {
        Self {
            registry,
            defs: DashMap::new(),
        }
    }

    /// Define and register a new custom metric
    pub fn create(&self, shape: MetricShape) -> CoreResult<CustomMetricDef> {
        if self.defs.contains_key(&shape.name) {
            return Err(CoreError::Conflict(format!(
                "custom metric {} already defined",
                shape.name
            )));
        }
        self.registry.register(shape.clone())?;
        let def = CustomMetricDef {
            shape,
            created_at: Utc::now(),
        };
        self.defs.insert(def.shape.name.clone(), def.clone());
        Ok(def)
    }

    /// Delete a custom metric and its samples
    pub fn delete(&self, name: &str) -> CoreResult<()> {
        if self.defs.remove(name).is_none() {
            return Err(CoreError::NotFound(format!("custom metric {}", name)));
        }
        self.registry.unregister(name)
    }

    pub fn list(&self) -> Vec<CustomMetricDef> {
        let mut defs: Vec<CustomMetricDef> = self.defs.iter().map(|e| e.value().clone()).collect();
        defs.sort_by(|a, b| a.shape.name.cmp(&b.shape.name));
        defs
    }

    /// Overview rows restricted to user-defined metrics
    pub fn summary(&self) -> Vec<MetricOverview> {
        self.registry
            .overview()
            .into_iter()
            .filter(|o| self.defs.contains_key(&o.name))
            .collect()
    }

    /// Record a value against a defined metric
    ///
    /// `duration_secs` substitutes for `value` on observe actions so timer
    /// callers do not have to convert.
    pub fn record(
        &self,
        name: &str,
        action: RecordAction,
        labels: &HashMap<String, String>,
        value: Option<f64>,
        duration_secs: Option<f64>,
    ) -> CoreResult<()> {
        let def = self
            .defs
            .get(name)
            .ok_or_else(|| CoreError::NotFound(format!("custom metric {}", name)))?
            .clone();

        let kind = def.shape.kind;
        let v = match action {
            RecordAction::Inc => 1.0,
            RecordAction::Add | RecordAction::Set => value.ok_or_else(|| {
                CoreError::InvalidInput("record action requires a value".to_string())
            })?,
            RecordAction::Observe => value.or(duration_secs).ok_or_else(|| {
                CoreError::InvalidInput("observe requires a value or duration".to_string())
            })?,
        };

        let compatible = matches!(
            (kind, action),
            (MetricKind::Counter, RecordAction::Inc)
                | (MetricKind::Counter, RecordAction::Add)
                | (MetricKind::Gauge, RecordAction::Set)
                | (MetricKind::Gauge, RecordAction::Inc)
                | (MetricKind::Histogram, RecordAction::Observe)
                | (MetricKind::Summary, RecordAction::Observe)
        );
        if !compatible {
            return Err(CoreError::InvalidInput(format!(
                "action {:?} is not valid for {:?} metric {}",
                action, kind, name
            )));
        }

        // gauge inc reads the last sample so dashboards can nudge counters up
        let v = if kind == MetricKind::Gauge && action == RecordAction::Inc {
            self.registry.last_value(name).unwrap_or(0.0) + 1.0
        } else {
            v
        };

        let mut ordered = Vec::with_capacity(def.shape.label_keys.len());
        for key in &def.shape.label_keys {
            let value = labels.get(key).ok_or_else(|| {
                CoreError::InvalidInput(format!("missing label {} for metric {}", key, name))
            })?;
            ordered.push(value.as_str());
        }

        let handle = self.registry.register(def.shape.clone())?;
        self.registry.observe(&handle, &ordered, v)
    }
}
