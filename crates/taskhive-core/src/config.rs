//! Configuration for the autonomy core, loaded from TOML.
//!
//! Every section has serde defaults so a missing file or a partial file
//! yields a usable configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TaskhiveError};
use crate::types::{Schedule, ScheduleKind};

/// Levels of system autonomy, from rejecting everything to full self-drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutonomyLevel {
    /// No autonomous actions; every task is rejected.
    Disabled,
    /// Every task requires approval from the approval callback.
    Assisted,
    /// Approve by default; new/modified/high-risk tasks require approval.
    #[default]
    Supervised,
    /// Approve all tasks unconditionally.
    Full,
}

impl std::str::FromStr for AutonomyLevel {
    type Err = TaskhiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" => Ok(Self::Disabled),
            "assisted" => Ok(Self::Assisted),
            "supervised" => Ok(Self::Supervised),
            "full" => Ok(Self::Full),
            other => Err(TaskhiveError::config(format!("unknown autonomy level: {other}"))),
        }
    }
}

impl std::fmt::Display for AutonomyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disabled => "disabled",
            Self::Assisted => "assisted",
            Self::Supervised => "supervised",
            Self::Full => "full",
        };
        f.write_str(s)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskhiveConfig {
    /// Root directory for persisted state (tasks/, schedules/, feedback/).
    pub storage_dir: Option<String>,
    pub autonomy: AutonomyConfig,
    pub scheduler: SchedulerConfig,
    pub feedback: FeedbackConfig,
}

impl TaskhiveConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| TaskhiveError::config(format!("{}: {e}", path.display())))?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Resolve the storage root, expanding `~` and falling back to the
    /// platform data directory.
    pub fn storage_root(&self) -> PathBuf {
        match &self.storage_dir {
            Some(dir) => PathBuf::from(shellexpand::tilde(dir).to_string()),
            None => default_storage_dir(),
        }
    }
}

fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("taskhive"))
        .unwrap_or_else(|| PathBuf::from("data/taskhive"))
}

/// Autonomy and policy-gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomyConfig {
    pub default_level: AutonomyLevel,
    pub max_concurrent_tasks: usize,
    pub require_approval: RequireApprovalConfig,
    pub safety: SafetyConfig,
    pub persistence: PersistenceConfig,
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            default_level: AutonomyLevel::Supervised,
            max_concurrent_tasks: 5,
            require_approval: RequireApprovalConfig::default(),
            safety: SafetyConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

/// Which task classes need approval under SUPERVISED autonomy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequireApprovalConfig {
    pub new_tasks: bool,
    pub modified_tasks: bool,
    pub high_risk: bool,
}

impl Default for RequireApprovalConfig {
    fn default() -> Self {
        Self { new_tasks: true, modified_tasks: true, high_risk: true }
    }
}

/// Safety-check configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub enable_safety_checks: bool,
    /// Actions rejected outright by the built-in safety check.
    pub restricted_actions: Vec<String>,
    /// Actions treated as high-risk for approval purposes.
    pub high_risk_actions: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enable_safety_checks: true,
            restricted_actions: Vec::new(),
            high_risk_actions: vec![
                "debug_errors".to_string(),
                "clear_memory".to_string(),
                "system_update".to_string(),
                "execute_command".to_string(),
            ],
        }
    }
}

/// Task persistence toggle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enable: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { enable: true }
    }
}

/// Calendar scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between schedule checks (tick granularity).
    #[serde(alias = "check_interval")]
    pub check_interval_secs: f64,
    pub storage_dir: Option<String>,
    /// Schedules preloaded at startup.
    pub recurring_tasks: Vec<RecurringTaskConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { check_interval_secs: 1.0, storage_dir: None, recurring_tasks: Vec::new() }
    }
}

/// A recurring schedule declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecurringTaskConfig {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub action: String,
    pub parameters: HashMap<String, Value>,
    pub schedule_type: ScheduleKind,
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(alias = "interval_seconds")]
    pub interval_secs: Option<f64>,
    pub days: Vec<u32>,
    pub time_of_day: Option<String>,
    pub cron_expression: Option<String>,
    pub max_runs: Option<u32>,
    pub tags: Vec<String>,
}

impl Default for RecurringTaskConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            enabled: true,
            action: String::new(),
            parameters: HashMap::new(),
            schedule_type: ScheduleKind::Once,
            start_time: None,
            end_time: None,
            interval_secs: None,
            days: Vec::new(),
            time_of_day: None,
            cron_expression: None,
            max_runs: None,
            tags: Vec::new(),
        }
    }
}

impl RecurringTaskConfig {
    /// Materialize this config entry as a schedule.
    pub fn to_schedule(&self) -> Schedule {
        let mut schedule =
            Schedule::new(&self.name, &self.action, self.parameters.clone(), self.schedule_type)
                .with_description(&self.description);
        schedule.enabled = self.enabled;
        schedule.start_time = self.start_time;
        schedule.end_time = self.end_time;
        schedule.interval_secs = self.interval_secs;
        schedule.days = self.days.clone();
        schedule.time_of_day = self.time_of_day.clone();
        schedule.cron_expression = self.cron_expression.clone();
        schedule.max_runs = self.max_runs;
        schedule.tags = self.tags.clone();
        schedule
    }
}

/// Feedback sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub auto_save: bool,
    #[serde(alias = "save_interval")]
    pub save_interval_secs: f64,
    pub storage_dir: Option<String>,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self { auto_save: true, save_interval_secs: 60.0, storage_dir: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TaskhiveConfig::default();
        assert_eq!(config.autonomy.default_level, AutonomyLevel::Supervised);
        assert_eq!(config.autonomy.max_concurrent_tasks, 5);
        assert!(config.autonomy.safety.enable_safety_checks);
        assert!(config.autonomy.persistence.enable);
        assert_eq!(config.scheduler.check_interval_secs, 1.0);
        assert!(config.feedback.auto_save);
        assert_eq!(config.feedback.save_interval_secs, 60.0);
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("full".parse::<AutonomyLevel>().unwrap(), AutonomyLevel::Full);
        assert_eq!("DISABLED".parse::<AutonomyLevel>().unwrap(), AutonomyLevel::Disabled);
        assert!("yolo".parse::<AutonomyLevel>().is_err());
        assert_eq!(AutonomyLevel::Assisted.to_string(), "assisted");
    }

    #[test]
    fn test_partial_toml() {
        let text = r#"
            storage_dir = "/tmp/hive"

            [autonomy]
            default_level = "full"
            max_concurrent_tasks = 2

            [autonomy.safety]
            restricted_actions = ["execute_command"]

            [scheduler]
            check_interval_secs = 0.5

            [[scheduler.recurring_tasks]]
            name = "heartbeat"
            action = "log_message"
            schedule_type = "interval"
            interval_secs = 30.0
        "#;
        let config: TaskhiveConfig = toml::from_str(text).unwrap();
        assert_eq!(config.autonomy.default_level, AutonomyLevel::Full);
        assert_eq!(config.autonomy.max_concurrent_tasks, 2);
        assert_eq!(config.autonomy.safety.restricted_actions, vec!["execute_command"]);
        // Untouched sections keep defaults
        assert!(config.autonomy.require_approval.new_tasks);
        assert!(config.feedback.auto_save);
        assert_eq!(config.scheduler.recurring_tasks.len(), 1);

        let schedule = config.scheduler.recurring_tasks[0].to_schedule();
        assert_eq!(schedule.kind, ScheduleKind::Interval);
        assert_eq!(schedule.interval_secs, Some(30.0));
        assert_eq!(schedule.name, "heartbeat");
    }

    #[test]
    fn test_storage_root_expansion() {
        let config = TaskhiveConfig {
            storage_dir: Some("/var/lib/taskhive".into()),
            ..Default::default()
        };
        assert_eq!(config.storage_root(), PathBuf::from("/var/lib/taskhive"));

        let defaulted = TaskhiveConfig::default();
        assert!(!defaulted.storage_root().as_os_str().is_empty());
    }

    #[test]
    fn test_high_risk_defaults() {
        let safety = SafetyConfig::default();
        assert!(safety.high_risk_actions.contains(&"execute_command".to_string()));
        assert!(safety.high_risk_actions.contains(&"clear_memory".to_string()));
        assert!(safety.restricted_actions.is_empty());
    }
}
