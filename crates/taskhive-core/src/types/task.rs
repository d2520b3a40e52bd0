//! Task definitions — the unit of work the execution engine runs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> f64 {
    5.0
}

/// Execution status of a task.
///
/// Transitions follow a fixed graph: PENDING → {RUNNING, CANCELLED},
/// RUNNING → {COMPLETED, FAILED, CANCELLED, PENDING (retry)}. The three
/// terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal (absorbing).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// A unit of work bound to a registered action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable opaque identifier.
    pub id: String,
    /// Human-readable name (defaults to the action name).
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Action identifier; must resolve in the action registry.
    pub action: String,
    /// Keyword parameters passed to the action.
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    /// Higher numbers run earlier.
    #[serde(default)]
    pub priority: i32,
    /// Task ids this task depends on; all must be COMPLETED before this runs.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds between retries.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: f64,
    /// Maximum execution time in seconds, if any.
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    /// Result value, set on success.
    #[serde(default)]
    pub result: Option<Value>,
    /// Error message, set on failure.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    /// Parent task id if this is a subtask.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Ids of child tasks.
    #[serde(default)]
    pub subtasks: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Task {
    /// Build a task from a submission spec with a fresh id.
    pub fn from_spec(spec: TaskSpec) -> Self {
        let name = if spec.name.is_empty() { spec.action.clone() } else { spec.name };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            description: spec.description,
            action: spec.action,
            parameters: spec.parameters,
            priority: spec.priority,
            dependencies: spec.dependencies,
            max_retries: spec.max_retries,
            retry_delay_secs: spec.retry_delay_secs,
            timeout_secs: spec.timeout_secs,
            created_at: Utc::now(),
            scheduled_at: spec.scheduled_at,
            started_at: None,
            completed_at: None,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            retry_count: 0,
            parent_id: spec.parent_id,
            subtasks: Vec::new(),
            metadata: spec.metadata,
        }
    }

    /// Whether the task has reached an absorbing state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Submission spec for a new task. Built with the constructor and builder
/// methods, consumed by `create_task`.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub action: String,
    pub parameters: HashMap<String, Value>,
    pub name: String,
    pub description: String,
    pub priority: i32,
    pub dependencies: Vec<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub parent_id: Option<String>,
    pub metadata: HashMap<String, Value>,
    pub max_retries: u32,
    pub retry_delay_secs: f64,
    pub timeout_secs: Option<f64>,
}

impl TaskSpec {
    pub fn new(action: &str) -> Self {
        Self {
            action: action.to_string(),
            parameters: HashMap::new(),
            name: String::new(),
            description: String::new(),
            priority: 0,
            dependencies: Vec::new(),
            scheduled_at: None,
            parent_id: None,
            metadata: HashMap::new(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            timeout_secs: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_parameters(mut self, parameters: HashMap<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_parameter(mut self, key: &str, value: Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_dependency(mut self, task_id: &str) -> Self {
        self.dependencies.push(task_id.to_string());
        self
    }

    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, secs: f64) -> Self {
        self.retry_delay_secs = secs;
        self
    }

    pub fn with_timeout(mut self, secs: f64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Result of a single task execution, handed to completion callbacks and
/// returned by `wait_for_task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Wall-clock execution time in seconds.
    #[serde(default)]
    pub execution_time_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_value(TaskStatus::Pending).unwrap(), json!("pending"));
        assert_eq!(serde_json::to_value(TaskStatus::Cancelled).unwrap(), json!("cancelled"));
        let parsed: TaskStatus = serde_json::from_value(json!("failed")).unwrap();
        assert_eq!(parsed, TaskStatus::Failed);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
    }

    #[test]
    fn test_from_spec_defaults() {
        let task = Task::from_spec(TaskSpec::new("echo"));
        assert_eq!(task.name, "echo");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.retry_delay_secs, 5.0);
        assert_eq!(task.retry_count, 0);
        assert!(task.started_at.is_none());
        assert!(!task.id.is_empty());
    }

    #[test]
    fn test_spec_builder() {
        let spec = TaskSpec::new("echo")
            .with_name("Echo step")
            .with_parameter("v", json!(1))
            .with_priority(7)
            .with_dependency("dep-1")
            .with_max_retries(1)
            .with_retry_delay(0.0)
            .with_timeout(2.5);
        let task = Task::from_spec(spec);
        assert_eq!(task.name, "Echo step");
        assert_eq!(task.parameters["v"], json!(1));
        assert_eq!(task.priority, 7);
        assert_eq!(task.dependencies, vec!["dep-1"]);
        assert_eq!(task.max_retries, 1);
        assert_eq!(task.timeout_secs, Some(2.5));
    }

    #[test]
    fn test_backward_compatible_deserialize() {
        // Minimal record without optional fields deserializes with defaults
        let json = r#"{
            "id": "task-123",
            "name": "old-task",
            "action": "echo",
            "created_at": "2026-01-01T00:00:00Z",
            "status": "pending"
        }"#;
        let task: Task = serde_json::from_str(json).expect("should deserialize minimal record");
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.retry_delay_secs, 5.0);
        assert!(task.dependencies.is_empty());
        assert!(task.subtasks.is_empty());
    }

    #[test]
    fn test_task_round_trip() {
        let mut task = Task::from_spec(
            TaskSpec::new("echo").with_parameter("v", json!({"nested": [1, 2, 3]})),
        );
        task.status = TaskStatus::Completed;
        task.result = Some(json!("ok"));
        task.completed_at = Some(Utc::now());

        let encoded = serde_json::to_string(&task).unwrap();
        let decoded: Task = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, task.id);
        assert_eq!(decoded.status, TaskStatus::Completed);
        assert_eq!(decoded.result, Some(json!("ok")));
        assert_eq!(decoded.parameters["v"], json!({"nested": [1, 2, 3]}));
    }
}
