//! Recurring schedule definitions — rules that emit tasks on calendar triggers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How/when a schedule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// Fire once at `start_time`.
    Once,
    /// Fire every `interval_secs` seconds.
    Interval,
    /// Fire daily at `time_of_day` (local time).
    Daily,
    /// Fire weekly on `days` (0 = Monday … 6 = Sunday) at `time_of_day`.
    Weekly,
    /// Fire monthly on day-of-month `days[0]` at `time_of_day`.
    Monthly,
    /// Fire per a standard 5-field cron expression.
    Cron,
}

/// A recurring rule that materializes tasks from an action template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: ScheduleKind,
    pub enabled: bool,

    /// Action template for emitted tasks.
    pub action: String,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,

    // Kind-specific fields
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Absolute cutoff: the schedule is exhausted once `next_run` would pass it.
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, alias = "interval_seconds")]
    pub interval_secs: Option<f64>,
    /// Weekday list (WEEKLY, 0 = Monday) or day-of-month (MONTHLY, first entry).
    #[serde(default)]
    pub days: Vec<u32>,
    /// "HH:MM" wall-clock time for DAILY/WEEKLY/MONTHLY.
    #[serde(default)]
    pub time_of_day: Option<String>,
    #[serde(default)]
    pub cron_expression: Option<String>,

    // Execution tracking
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u32,
    #[serde(default)]
    pub max_runs: Option<u32>,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Schedule {
    /// Create a new schedule of the given kind. Kind-specific fields are set
    /// with the builder methods below.
    pub fn new(name: &str, action: &str, parameters: HashMap<String, Value>, kind: ScheduleKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: String::new(),
            kind,
            enabled: true,
            action: action.to_string(),
            parameters,
            start_time: None,
            end_time: None,
            interval_secs: None,
            days: Vec::new(),
            time_of_day: None,
            cron_expression: None,
            last_run: None,
            next_run: None,
            run_count: 0,
            max_runs: None,
            created_at: Utc::now(),
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// One-shot schedule firing at `at`.
    pub fn once(name: &str, action: &str, parameters: HashMap<String, Value>, at: DateTime<Utc>) -> Self {
        Self::new(name, action, parameters, ScheduleKind::Once).with_start_time(at)
    }

    /// Interval schedule firing every `secs` seconds.
    pub fn interval(name: &str, action: &str, parameters: HashMap<String, Value>, secs: f64) -> Self {
        Self::new(name, action, parameters, ScheduleKind::Interval).with_interval(secs)
    }

    /// Daily schedule firing at "HH:MM" local time.
    pub fn daily(name: &str, action: &str, parameters: HashMap<String, Value>, time_of_day: &str) -> Self {
        Self::new(name, action, parameters, ScheduleKind::Daily).with_time_of_day(time_of_day)
    }

    /// Weekly schedule firing on the given weekdays (0 = Monday) at "HH:MM".
    pub fn weekly(
        name: &str,
        action: &str,
        parameters: HashMap<String, Value>,
        days: Vec<u32>,
        time_of_day: &str,
    ) -> Self {
        Self::new(name, action, parameters, ScheduleKind::Weekly)
            .with_days(days)
            .with_time_of_day(time_of_day)
    }

    /// Monthly schedule firing on the given day-of-month at "HH:MM".
    pub fn monthly(
        name: &str,
        action: &str,
        parameters: HashMap<String, Value>,
        day_of_month: u32,
        time_of_day: &str,
    ) -> Self {
        Self::new(name, action, parameters, ScheduleKind::Monthly)
            .with_days(vec![day_of_month])
            .with_time_of_day(time_of_day)
    }

    /// Cron schedule from a standard 5-field expression.
    pub fn cron(name: &str, action: &str, parameters: HashMap<String, Value>, expression: &str) -> Self {
        Self::new(name, action, parameters, ScheduleKind::Cron).with_cron(expression)
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_start_time(mut self, at: DateTime<Utc>) -> Self {
        self.start_time = Some(at);
        self
    }

    pub fn with_end_time(mut self, at: DateTime<Utc>) -> Self {
        self.end_time = Some(at);
        self
    }

    pub fn with_interval(mut self, secs: f64) -> Self {
        self.interval_secs = Some(secs);
        self
    }

    pub fn with_days(mut self, days: Vec<u32>) -> Self {
        self.days = days;
        self
    }

    pub fn with_time_of_day(mut self, time_of_day: &str) -> Self {
        self.time_of_day = Some(time_of_day.to_string());
        self
    }

    pub fn with_cron(mut self, expression: &str) -> Self {
        self.cron_expression = Some(expression.to_string());
        self
    }

    pub fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    pub fn with_tags(mut self, tags: Vec<&str>) -> Self {
        self.tags = tags.into_iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// A schedule that hit its run budget is treated as disabled.
    pub fn is_exhausted(&self) -> bool {
        self.max_runs.is_some_and(|max| self.run_count >= max)
    }

    /// Parse `time_of_day` as (hour, minute).
    pub fn parse_time_of_day(&self) -> Option<(u32, u32)> {
        let tod = self.time_of_day.as_deref()?;
        let (h, m) = tod.split_once(':')?;
        let hour: u32 = h.trim().parse().ok()?;
        let minute: u32 = m.trim().parse().ok()?;
        if hour > 23 || minute > 59 {
            return None;
        }
        Some((hour, minute))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_value(ScheduleKind::Interval).unwrap(), json!("interval"));
        assert_eq!(serde_json::to_value(ScheduleKind::Cron).unwrap(), json!("cron"));
        let parsed: ScheduleKind = serde_json::from_value(json!("weekly")).unwrap();
        assert_eq!(parsed, ScheduleKind::Weekly);
    }

    #[test]
    fn test_interval_builder() {
        let sched = Schedule::interval("tick", "echo", HashMap::new(), 10.0).with_max_runs(3);
        assert_eq!(sched.kind, ScheduleKind::Interval);
        assert_eq!(sched.interval_secs, Some(10.0));
        assert_eq!(sched.max_runs, Some(3));
        assert!(sched.enabled);
        assert_eq!(sched.run_count, 0);
    }

    #[test]
    fn test_exhaustion() {
        let mut sched = Schedule::interval("tick", "echo", HashMap::new(), 10.0).with_max_runs(2);
        assert!(!sched.is_exhausted());
        sched.run_count = 2;
        assert!(sched.is_exhausted());

        let unbounded = Schedule::interval("tick", "echo", HashMap::new(), 10.0);
        assert!(!unbounded.is_exhausted());
    }

    #[test]
    fn test_parse_time_of_day() {
        let sched = Schedule::daily("review", "echo", HashMap::new(), "09:30");
        assert_eq!(sched.parse_time_of_day(), Some((9, 30)));

        let bad = Schedule::daily("review", "echo", HashMap::new(), "25:00");
        assert_eq!(bad.parse_time_of_day(), None);

        let garbage = Schedule::daily("review", "echo", HashMap::new(), "soon");
        assert_eq!(garbage.parse_time_of_day(), None);
    }

    #[test]
    fn test_schedule_round_trip() {
        let sched = Schedule::weekly("standup", "echo", HashMap::new(), vec![0, 2, 4], "09:00")
            .with_tags(vec!["work"])
            .with_max_runs(10);
        let encoded = serde_json::to_string(&sched).unwrap();
        let decoded: Schedule = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, sched.id);
        assert_eq!(decoded.kind, ScheduleKind::Weekly);
        assert_eq!(decoded.days, vec![0, 2, 4]);
        assert_eq!(decoded.tags, vec!["work"]);
    }
}
