// vigil: Rule schedules, maintenance windows, and silences

use std::collections::HashMap;

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Weekly recurring window (weekday set plus an HH:MM range)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyWindow {
    /// Weekday names, e.g. ["mon", "tue"]
    pub weekdays: Vec<String>,
    /// Inclusive start, "HH:MM"
    pub start: String,
    /// Inclusive end, "HH:MM"
    pub end: String,
}

impl WeeklyWindow {
    fn parse_time(s: &str) -> CoreResult<NaiveTime> {
        NaiveTime::parse_from_str(s, "%H:%M")
            .map_err(|_| CoreError::InvalidInput(format!("invalid time of day: {}", s)))
    }

    fn parse_weekday(s: &str) -> CoreResult<Weekday> {
        match s.to_ascii_lowercase().as_str() {
            "mon" | "monday" => Ok(Weekday::Mon),
            "tue" | "tuesday" => Ok(Weekday::Tue),
            "wed" | "wednesday" => Ok(Weekday::Wed),
            "thu" | "thursday" => Ok(Weekday::Thu),
            "fri" | "friday" => Ok(Weekday::Fri),
            "sat" | "saturday" => Ok(Weekday::Sat),
            "sun" | "sunday" => Ok(Weekday::Sun),
            other => Err(CoreError::InvalidInput(format!(
                "invalid weekday: {}",
                other
            ))),
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.weekdays.is_empty() {
            return Err(CoreError::InvalidInput(
                "window weekday set is empty".to_string(),
            ));
        }
        for day in &self.weekdays {
            Self::parse_weekday(day)?;
        }
        let start = Self::parse_time(&self.start)?;
        let end = Self::parse_time(&self.end)?;
        if start > end {
            return Err(CoreError::InvalidInput(
                "window start must not be after end".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the window contains the given local weekday and time
    fn contains(&self, weekday: Weekday, time: NaiveTime) -> bool {
        let in_days = self
            .weekdays
            .iter()
            .filter_map(|d| Self::parse_weekday(d).ok())
            .any(|d| d == weekday);
        if !in_days {
            return false;
        }
        match (Self::parse_time(&self.start), Self::parse_time(&self.end)) {
            (Ok(start), Ok(end)) => start <= time && time <= end,
            _ => false,
        }
    }
}

/// Per-rule evaluation schedule
///
/// Comparisons happen in the configured IANA zone; an unset zone falls back
/// to the process local zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Schedule {
    pub timezone: Option<String>,
    /// When non-empty, the rule is active only inside one of these
    pub active_periods: Vec<WeeklyWindow>,
    /// The rule is never active inside one of these
    pub exclude_periods: Vec<WeeklyWindow>,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            timezone: None,
            active_periods: Vec::new(),
            exclude_periods: Vec::new(),
        }
    }
}

impl Schedule {
    pub fn validate(&self) -> CoreResult<()> {
        if let Some(tz) = &self.timezone {
            tz.parse::<Tz>()
                .map_err(|_| CoreError::InvalidInput(format!("unknown time zone: {}", tz)))?;
        }
        for window in self.active_periods.iter().chain(&self.exclude_periods) {
            window.validate()?;
        }
        Ok(())
    }

    /// Whether the schedule admits evaluation at `at`
    pub fn admits(&self, at: DateTime<Utc>) -> bool {
        let (weekday, time) = match &self.timezone {
            Some(tz) => match tz.parse::<Tz>() {
                Ok(zone) => {
                    let local = at.with_timezone(&zone);
                    (local.weekday(), local.time())
                }
                Err(_) => return false,
            },
            None => {
                let local = at.with_timezone(&chrono::Local);
                (local.weekday(), local.time())
            }
        };

        if !self.active_periods.is_empty()
            && !self.active_periods.iter().any(|w| w.contains(weekday, time))
        {
            return false;
        }
        !self.exclude_periods.iter().any(|w| w.contains(weekday, time))
    }
}

/// Absolute suppression window during which rules are gated but firing
/// alerts are not resolved
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl MaintenanceWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// Why a rule is not currently active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InactiveCause {
    Maintenance,
    Schedule,
}

/// Schedule gate combining maintenance windows with per-rule schedules
pub struct ScheduleGate {
    maintenance: Mutex<Vec<MaintenanceWindow>>,
}

impl ScheduleGate {
    pub fn new(maintenance: Vec<MaintenanceWindow>) -> Self {
        Self {
            maintenance: Mutex::new(maintenance),
        }
    }

    pub fn add_maintenance(&self, window: MaintenanceWindow) {
        self.maintenance.lock().push(window);
    }

    /// Check rule activity at `at`; inactive results carry the cause
    pub fn check(&self, schedule: Option<&Schedule>, at: DateTime<Utc>) -> Result<(), InactiveCause> {
        {
            let mut windows = self.maintenance.lock();
            // drop windows that already ended
            windows.retain(|w| w.end > at);
            if windows.iter().any(|w| w.contains(at)) {
                return Err(InactiveCause::Maintenance);
            }
        }
        if let Some(schedule) = schedule {
            if !schedule.admits(at) {
                return Err(InactiveCause::Schedule);
            }
        }
        Ok(())
    }
}

/// Per-rule silences with lazy expiry
pub struct Silences {
    until: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl Silences {
    pub fn new() -> Self {
        Self {
            until: Mutex::new(HashMap::new()),
        }
    }

    pub fn silence(&self, rule_id: Uuid, until: DateTime<Utc>) {
        self.until.lock().insert(rule_id, until);
    }

    pub fn clear(&self, rule_id: Uuid) {
        self.until.lock().remove(&rule_id);
    }

    /// Unexpired silence deadline for a rule; expired entries are removed
    pub fn current(&self, rule_id: Uuid, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut map = self.until.lock();
        match map.get(&rule_id) {
            Some(until) if *until > now => Some(*until),
            Some(_) => {
                map.remove(&rule_id);
                None
            }
            None => None,
        }
    }
}

impl Default for Silences {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn window(days: &[&str], start: &str, end: &str) -> WeeklyWindow {
        WeeklyWindow {
            weekdays: days.iter().map(|d| d.to_string()).collect(),
            start: start.to_string(),
            end: end.to_string(),
        }
    }

    // 2024-06-03 was a Monday
    fn monday_noon_utc() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_window_validation() {
        assert!(window(&["mon"], "09:00", "17:00").validate().is_ok());
        assert!(window(&[], "09:00", "17:00").validate().is_err());
        assert!(window(&["funday"], "09:00", "17:00").validate().is_err());
        assert!(window(&["mon"], "17:00", "09:00").validate().is_err());
        assert!(window(&["mon"], "25:00", "26:00").validate().is_err());
    }

    #[test]
    fn test_schedule_active_period_in_utc() {
        let schedule = Schedule {
            timezone: Some("UTC".to_string()),
            active_periods: vec![window(&["mon", "tue"], "09:00", "17:00")],
            exclude_periods: vec![],
        };
        assert!(schedule.admits(monday_noon_utc()));
        // Saturday
        let saturday = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert!(!schedule.admits(saturday));
        // Monday outside hours
        let late = Utc.with_ymd_and_hms(2024, 6, 3, 22, 0, 0).unwrap();
        assert!(!schedule.admits(late));
    }

    #[test]
    fn test_schedule_exclusion_wins() {
        let schedule = Schedule {
            timezone: Some("UTC".to_string()),
            active_periods: vec![window(&["mon"], "00:00", "23:59")],
            exclude_periods: vec![window(&["mon"], "11:00", "13:00")],
        };
        assert!(!schedule.admits(monday_noon_utc()));
        let morning = Utc.with_ymd_and_hms(2024, 6, 3, 8, 0, 0).unwrap();
        assert!(schedule.admits(morning));
    }

    #[test]
    fn test_schedule_respects_zone() {
        // 12:00 UTC on Monday is 21:00 in Tokyo; a 09:00-17:00 Tokyo window
        // does not admit it
        let schedule = Schedule {
            timezone: Some("Asia/Tokyo".to_string()),
            active_periods: vec![window(&["mon"], "09:00", "17:00")],
            exclude_periods: vec![],
        };
        assert!(!schedule.admits(monday_noon_utc()));
        // 02:00 UTC Monday is 11:00 Tokyo Monday
        let early = Utc.with_ymd_and_hms(2024, 6, 3, 2, 0, 0).unwrap();
        assert!(schedule.admits(early));
    }

    #[test]
    fn test_gate_maintenance_precedes_schedule() {
        let at = monday_noon_utc();
        let gate = ScheduleGate::new(vec![MaintenanceWindow {
            start: at - Duration::hours(1),
            end: at + Duration::hours(1),
            reason: Some("db upgrade".to_string()),
        }]);
        assert_eq!(gate.check(None, at), Err(InactiveCause::Maintenance));
        assert!(gate.check(None, at + Duration::hours(2)).is_ok());
    }

    #[test]
    fn test_gate_expired_windows_are_dropped() {
        let at = monday_noon_utc();
        let gate = ScheduleGate::new(vec![MaintenanceWindow {
            start: at - Duration::hours(3),
            end: at - Duration::hours(2),
            reason: None,
        }]);
        assert!(gate.check(None, at).is_ok());
    }

    #[test]
    fn test_silences_lazy_expiry() {
        let silences = Silences::new();
        let rule = Uuid::new_v4();
        let now = Utc::now();
        silences.silence(rule, now + Duration::hours(1));
        assert!(silences.current(rule, now).is_some());
        assert!(silences.current(rule, now + Duration::hours(2)).is_none());
        // expired entry was removed on the check above
        assert!(silences.current(rule, now).is_none());
    }
}
