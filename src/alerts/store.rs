// vigil: Rule store

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::alerts::rule::{Rule, RuleSpec};
use crate::error::{CoreError, CoreResult};

/// In-memory rule store
///
/// Validation runs before any state change; listing is totally ordered by
/// (priority, id).
pub struct RuleStore {
    rules: Mutex<HashMap<Uuid, Rule>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, spec: RuleSpec) -> CoreResult<Rule> {
        spec.validate()?;
        let rule = Rule::from_spec(spec);
        self.rules.lock().insert(rule.id, rule.clone());
        Ok(rule)
    }

    pub fn update(&self, id: Uuid, spec: RuleSpec) -> CoreResult<Rule> {
        spec.validate()?;
        let mut rules = self.rules.lock();
        let rule = rules
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("rule {}", id)))?;
        rule.spec = spec;
        rule.updated_at = Utc::now();
        Ok(rule.clone())
    }

    pub fn delete(&self, id: Uuid) -> CoreResult<Rule> {
        self.rules
            .lock()
            .remove(&id)
            .ok_or_else(|| CoreError::NotFound(format!("rule {}", id)))
    }

    pub fn get(&self, id: Uuid) -> CoreResult<Rule> {
        self.rules
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("rule {}", id)))
    }

    /// All rules ordered by priority, ties broken by id
    pub fn list(&self) -> Vec<Rule> {
        let mut rules: Vec<Rule> = self.rules.lock().values().cloned().collect();
        rules.sort_by(|a, b| {
            a.spec
                .priority
                .cmp(&b.spec.priority)
                .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
        });
        rules
    }

    pub fn len(&self) -> usize {
        self.rules.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.lock().is_empty()
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}
