// vigil: Firing throttler

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Per-rule throttle policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottlePolicy {
    /// Maximum firings inside the window
    pub max_alerts: u32,
    /// Window length in seconds
    pub window_secs: u64,
    /// Minimum gap between consecutive firings, regardless of the cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_secs: Option<u64>,
}

impl ThrottlePolicy {
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_alerts == 0 {
            return Err(CoreError::InvalidInput(
                "throttle max_alerts must be at least 1".to_string(),
            ));
        }
        if self.window_secs == 0 {
            return Err(CoreError::InvalidInput(
                "throttle window must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sliding-window firing throttler
///
/// State is in-memory only; a restart resets every window.
pub struct Throttler {
    firings: HashMap<Uuid, VecDeque<DateTime<Utc>>>,
}

impl Throttler {
    pub fn new() -> Self {
        Self {
            firings: HashMap::new(),
        }
    }

    /// Decide whether a rule may fire at `now`, recording the firing if so
    ///
    /// Prunes timestamps older than the window, then compares the remaining
    /// count to the cap. Suppressed firings are not recorded.
    pub fn allow(&mut self, rule_id: Uuid, policy: Option<&ThrottlePolicy>, now: DateTime<Utc>) -> bool {
        let policy = match policy {
            Some(p) => p,
            None => return true,
        };

        let window = Duration::seconds(policy.window_secs as i64);
        let entry = self.firings.entry(rule_id).or_default();
        while let Some(front) = entry.front() {
            if now - *front > window {
                entry.pop_front();
            } else {
                break;
            }
        }

        if let Some(cooldown) = policy.cooldown_secs {
            if let Some(last) = entry.back() {
                if now - *last < Duration::seconds(cooldown as i64) {
                    return false;
                }
            }
        }

        if entry.len() >= policy.max_alerts as usize {
            return false;
        }
        entry.push_back(now);
        true
    }

    /// Forget a rule's firing history (rule deleted)
    pub fn forget(&mut self, rule_id: Uuid) {
        self.firings.remove(&rule_id);
    }
}

impl Default for Throttler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max: u32, window_secs: u64, cooldown_secs: Option<u64>) -> ThrottlePolicy {
        ThrottlePolicy {
            max_alerts: max,
            window_secs,
            cooldown_secs,
        }
    }

    #[test]
    fn test_policy_validation() {
        assert!(policy(1, 60, None).validate().is_ok());
        assert!(policy(0, 60, None).validate().is_err());
        assert!(policy(1, 0, None).validate().is_err());
    }

    #[test]
    fn test_cap_inside_window() {
        let mut throttler = Throttler::new();
        let rule = Uuid::new_v4();
        let p = policy(2, 600, None);
        let t0 = Utc::now();

        assert!(throttler.allow(rule, Some(&p), t0));
        assert!(throttler.allow(rule, Some(&p), t0 + Duration::minutes(1)));
        // third firing within 10 minutes is suppressed
        assert!(!throttler.allow(rule, Some(&p), t0 + Duration::minutes(2)));
    }

    #[test]
    fn test_window_slides() {
        let mut throttler = Throttler::new();
        let rule = Uuid::new_v4();
        let p = policy(2, 600, None);
        let t0 = Utc::now();

        assert!(throttler.allow(rule, Some(&p), t0));
        assert!(throttler.allow(rule, Some(&p), t0 + Duration::minutes(1)));
        // the first firing has left the window
        assert!(throttler.allow(rule, Some(&p), t0 + Duration::minutes(11)));
    }

    #[test]
    fn test_suppressed_firing_not_recorded() {
        let mut throttler = Throttler::new();
        let rule = Uuid::new_v4();
        let p = policy(1, 600, None);
        let t0 = Utc::now();

        assert!(throttler.allow(rule, Some(&p), t0));
        for i in 1..5 {
            assert!(!throttler.allow(rule, Some(&p), t0 + Duration::minutes(i)));
        }
        // only the recorded firing counts against the window
        assert!(throttler.allow(rule, Some(&p), t0 + Duration::minutes(11)));
    }

    #[test]
    fn test_cooldown_blocks_below_cap() {
        let mut throttler = Throttler::new();
        let rule = Uuid::new_v4();
        let p = policy(10, 600, Some(120));
        let t0 = Utc::now();

        assert!(throttler.allow(rule, Some(&p), t0));
        assert!(!throttler.allow(rule, Some(&p), t0 + Duration::seconds(60)));
        assert!(throttler.allow(rule, Some(&p), t0 + Duration::seconds(121)));
    }

    #[test]
    fn test_no_policy_always_allows() {
        let mut throttler = Throttler::new();
        let rule = Uuid::new_v4();
        for _ in 0..100 {
            assert!(throttler.allow(rule, None, Utc::now()));
        }
    }
}
