//! The autonomy loop — orchestrator that wires the execution engine,
//! calendar scheduler, and feedback sink over one storage root.
//!
//! Every collaborator is constructed here and passed explicitly; there is
//! no process-wide state. The scheduler reaches the engine through its
//! task-emitter callback, and task completions are mirrored into the
//! feedback sink and metrics aggregator.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use taskhive_core::config::TaskhiveConfig;
use taskhive_core::error::Result;
use taskhive_core::types::{
    FeedbackEntry, FeedbackKind, FeedbackSource, FeedbackSummary, Schedule, Task, TaskResult,
    TaskSpec, TaskStatus,
};
use taskhive_engine::store::StoreStats;
use taskhive_engine::{
    ActionRegistry, ApprovalFn, AutonomyManager, CompletionFn, PolicyGate, SafetyCheckFn, TaskStore,
};
use taskhive_feedback::{FeedbackFilter, FeedbackManager, MetricsLogger};
use taskhive_scheduler::{ScheduleFilter, ScheduleManager};

use crate::actions::register_builtin_actions;

/// Orchestrator for autonomous recurring task execution.
pub struct AutonomyLoop {
    config: TaskhiveConfig,
    registry: Arc<ActionRegistry>,
    policy: Arc<PolicyGate>,
    manager: Arc<AutonomyManager>,
    scheduler: Arc<ScheduleManager>,
    feedback: Arc<FeedbackManager>,
    metrics: Arc<MetricsLogger>,
    running: AtomicBool,
}

impl AutonomyLoop {
    /// Construct all components from configuration. Storage lands under
    /// the configured root: `tasks/`, `schedules/`, and `feedback/`.
    pub fn new(config: TaskhiveConfig) -> Result<Self> {
        let storage_root = config.storage_root();

        let tasks_dir =
            config.autonomy.persistence.enable.then(|| storage_root.join("tasks"));
        let schedules_dir = match &config.scheduler.storage_dir {
            Some(dir) => PathBuf::from(shellexpand::tilde(dir).to_string()),
            None => storage_root.join("schedules"),
        };
        let feedback_dir = match &config.feedback.storage_dir {
            Some(dir) => PathBuf::from(shellexpand::tilde(dir).to_string()),
            None => storage_root.join("feedback"),
        };

        let registry = Arc::new(ActionRegistry::new());
        register_builtin_actions(&registry);

        let store = Arc::new(TaskStore::new(tasks_dir)?);
        let policy = Arc::new(PolicyGate::new(&config.autonomy));
        let manager = Arc::new(AutonomyManager::new(
            Arc::clone(&registry),
            store,
            Arc::clone(&policy),
            config.autonomy.max_concurrent_tasks,
        ));

        let feedback = Arc::new(FeedbackManager::new(
            Some(feedback_dir.clone()),
            config.feedback.auto_save,
            Duration::from_secs_f64(config.feedback.save_interval_secs.max(0.1)),
        )?);
        let metrics = Arc::new(MetricsLogger::new(Some(feedback_dir), None)?);

        let scheduler = Arc::new(ScheduleManager::new(
            Some(schedules_dir),
            Duration::from_secs_f64(config.scheduler.check_interval_secs.max(0.05)),
        )?);

        // Scheduler fires become engine tasks carrying their provenance
        let emit_manager = Arc::clone(&manager);
        scheduler.set_emitter(Arc::new(move |schedule: &Schedule| {
            let mut metadata = HashMap::new();
            metadata.insert("scheduled".to_string(), json!(true));
            metadata.insert("schedule_id".to_string(), json!(schedule.id));
            metadata.insert(
                "schedule_kind".to_string(),
                serde_json::to_value(schedule.kind).unwrap_or(Value::Null),
            );
            metadata.insert("run_count".to_string(), json!(schedule.run_count));
            emit_manager.create_task(
                TaskSpec::new(&schedule.action)
                    .with_parameters(schedule.parameters.clone())
                    .with_name(&format!("Scheduled: {}", schedule.name))
                    .with_description(&format!("Scheduled task from {}", schedule.id))
                    .with_metadata(metadata),
            )
        }));

        // Task completions feed the observation side
        let completion_feedback = Arc::clone(&feedback);
        let completion_metrics = Arc::clone(&metrics);
        manager.add_completion_callback(Arc::new(move |task: &Task, result: &TaskResult| {
            completion_metrics.log_task_completion(result.success, Some(&task.id));
            completion_metrics.log_performance(result.execution_time_secs, None, None);

            let (kind, content) = if result.success {
                (
                    FeedbackKind::Like,
                    json!(format!("Task '{}' executed successfully", task.name)),
                )
            } else {
                (
                    FeedbackKind::Dislike,
                    json!(format!(
                        "Task '{}' failed: {}",
                        task.name,
                        result.error.clone().unwrap_or_default()
                    )),
                )
            };
            let mut context = HashMap::new();
            context.insert("action".to_string(), json!(task.action));
            context.insert("execution_time".to_string(), json!(result.execution_time_secs));
            completion_feedback.add(
                FeedbackEntry::new(kind, content)
                    .with_source(FeedbackSource::System)
                    .with_target(&task.id, "task")
                    .with_context(context),
            );
        }));

        tracing::info!(
            "Autonomy loop components initialized (level: {}, storage: {})",
            config.autonomy.default_level,
            storage_root.display()
        );

        Ok(Self {
            config,
            registry,
            policy,
            manager,
            scheduler,
            feedback,
            metrics,
            running: AtomicBool::new(false),
        })
    }

    // ── Actions ───────────────────────────────────────────────

    /// Register (or override) an action.
    pub fn register_action<F, Fut>(
        &self,
        name: &str,
        description: &str,
        params: Vec<(&str, taskhive_engine::ParamSpec)>,
        handler: F,
    ) where
        F: Fn(HashMap<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        self.registry.register(name, description, params, handler);
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    // ── Tasks ─────────────────────────────────────────────────

    pub fn create_task(&self, spec: TaskSpec) -> Result<String> {
        self.manager.create_task(spec)
    }

    pub fn create_chain(
        &self,
        tasks: Vec<TaskSpec>,
        name: &str,
        description: &str,
        metadata: HashMap<String, Value>,
    ) -> Result<String> {
        self.manager.create_chain(tasks, name, description, metadata)
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.manager.get_task(id)
    }

    pub fn list_tasks(&self, status: Option<&[TaskStatus]>, parent_id: Option<&str>) -> Vec<Task> {
        self.manager.list_tasks(status, parent_id)
    }

    pub fn cancel_task(&self, id: &str) -> bool {
        self.manager.cancel_task(id)
    }

    pub async fn wait_for_task(&self, id: &str, timeout: Option<Duration>) -> Option<TaskResult> {
        self.manager.wait_for_task(id, timeout).await
    }

    pub fn task_stats(&self) -> StoreStats {
        self.manager.stats()
    }

    // ── Policy callbacks ──────────────────────────────────────

    pub fn set_approval_callback(&self, callback: ApprovalFn) {
        self.policy.set_approval_callback(callback);
    }

    pub fn add_safety_check(&self, check: SafetyCheckFn) {
        self.policy.add_safety_check(check);
    }

    pub fn add_completion_callback(&self, callback: CompletionFn) {
        self.manager.add_completion_callback(callback);
    }

    // ── Schedules ─────────────────────────────────────────────

    /// Create a recurring schedule. The template action must be
    /// registered.
    pub fn create_schedule(&self, schedule: Schedule) -> Result<String> {
        if !self.registry.has(&schedule.action) {
            return Err(taskhive_core::TaskhiveError::UnknownAction(schedule.action.clone()));
        }
        self.scheduler.create_schedule(schedule)
    }

    pub fn get_schedule(&self, id: &str) -> Option<Schedule> {
        self.scheduler.get_schedule(id)
    }

    pub fn enable_schedule(&self, id: &str) -> bool {
        self.scheduler.enable_schedule(id)
    }

    pub fn disable_schedule(&self, id: &str) -> bool {
        self.scheduler.disable_schedule(id)
    }

    pub fn delete_schedule(&self, id: &str) -> bool {
        self.scheduler.delete_schedule(id)
    }

    pub fn run_now(&self, id: &str) -> bool {
        self.scheduler.run_now(id)
    }

    pub fn update_schedule(&self, id: &str, f: impl FnOnce(&mut Schedule)) -> bool {
        self.scheduler.update_schedule(id, f)
    }

    pub fn list_schedules(&self, filter: &ScheduleFilter) -> Vec<Schedule> {
        self.scheduler.list_schedules(filter)
    }

    // ── Feedback ──────────────────────────────────────────────

    pub fn add_feedback(&self, entry: FeedbackEntry) -> String {
        self.feedback.add(entry)
    }

    pub fn get_summary(&self, target_id: &str) -> Option<FeedbackSummary> {
        self.feedback.summary(target_id)
    }

    pub fn list_feedback(&self, filter: &FeedbackFilter) -> Vec<FeedbackEntry> {
        self.feedback.list(filter)
    }

    pub fn feedback_for_target(&self, target_id: &str) -> Vec<FeedbackEntry> {
        self.feedback.for_target(target_id)
    }

    pub fn clear_feedback(&self) {
        self.feedback.clear()
    }

    pub fn metrics(&self) -> &Arc<MetricsLogger> {
        &self.metrics
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Start the engine, scheduler, and feedback auto-save, then preload
    /// configured recurring schedules.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Autonomy loop already running");
            return;
        }
        self.manager.start();
        self.scheduler.start();
        self.feedback.start();
        if let Err(e) = self.feedback.load() {
            tracing::error!("Failed to load feedback: {e}");
        }
        self.preload_recurring_tasks();
        tracing::info!("Autonomy loop started");
    }

    /// Stop schedule fires, drain the dispatcher, and persist final state.
    pub async fn stop(&self, wait: bool, timeout: Duration) {
        if !self.running.swap(false, Ordering::SeqCst) {
            tracing::warn!("Autonomy loop not running");
            return;
        }
        tracing::info!("Stopping autonomy loop");
        self.scheduler.stop().await;
        self.manager.stop(wait, timeout).await;
        self.feedback.stop().await;
        self.metrics.persist();
        tracing::info!("Autonomy loop stopped");
    }

    /// Create schedules declared in configuration. Entries whose name
    /// already exists in the store are skipped so restarts do not multiply
    /// schedules; API-level creation stays non-deduplicating.
    fn preload_recurring_tasks(&self) {
        let recurring = &self.config.scheduler.recurring_tasks;
        if recurring.is_empty() {
            return;
        }
        tracing::info!("Loading {} recurring tasks", recurring.len());

        let existing: Vec<String> = self
            .scheduler
            .list_schedules(&ScheduleFilter::default())
            .into_iter()
            .map(|s| s.name)
            .collect();

        for entry in recurring {
            if !entry.enabled {
                continue;
            }
            if entry.action.is_empty() || !self.registry.has(&entry.action) {
                tracing::warn!("Skipping task '{}': invalid action '{}'", entry.name, entry.action);
                continue;
            }
            if existing.contains(&entry.name) {
                tracing::debug!("Schedule '{}' already present, skipping preload", entry.name);
                continue;
            }
            match self.scheduler.create_schedule(entry.to_schedule()) {
                Ok(id) => tracing::info!("Created schedule for task '{}' ({id})", entry.name),
                Err(e) => tracing::error!("Error creating schedule for task '{}': {e}", entry.name),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskhive_core::config::AutonomyLevel;

    fn test_config(dir: &std::path::Path) -> TaskhiveConfig {
        let mut config = TaskhiveConfig {
            storage_dir: Some(dir.display().to_string()),
            ..Default::default()
        };
        config.autonomy.default_level = AutonomyLevel::Full;
        config.scheduler.check_interval_secs = 0.05;
        config.feedback.auto_save = false;
        config
    }

    #[tokio::test]
    async fn test_loop_construction_creates_storage_layout() {
        let dir = tempfile::tempdir().unwrap();
        let core = AutonomyLoop::new(test_config(dir.path())).unwrap();
        assert!(dir.path().join("tasks").is_dir());
        assert!(dir.path().join("schedules").is_dir());
        assert!(dir.path().join("feedback").is_dir());
        assert!(core.registry().has("log_message"));
    }

    #[tokio::test]
    async fn test_schedule_requires_known_action() {
        let dir = tempfile::tempdir().unwrap();
        let core = AutonomyLoop::new(test_config(dir.path())).unwrap();
        let schedule =
            Schedule::interval("bad", "not_an_action", HashMap::new(), 60.0);
        assert!(core.create_schedule(schedule).is_err());
    }

    #[tokio::test]
    async fn test_preload_skips_existing_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.scheduler.recurring_tasks = vec![taskhive_core::config::RecurringTaskConfig {
            name: "heartbeat".to_string(),
            action: "log_message".to_string(),
            parameters: HashMap::from([("message".to_string(), json!("tick"))]),
            schedule_type: taskhive_core::types::ScheduleKind::Interval,
            interval_secs: Some(3600.0),
            ..Default::default()
        }];

        let core = AutonomyLoop::new(config.clone()).unwrap();
        core.start();
        assert_eq!(core.list_schedules(&ScheduleFilter::default()).len(), 1);
        core.stop(true, Duration::from_secs(2)).await;

        // Restart on the same storage: the preload entry is deduplicated
        let core = AutonomyLoop::new(config).unwrap();
        core.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(core.list_schedules(&ScheduleFilter::default()).len(), 1);
        core.stop(true, Duration::from_secs(2)).await;
    }
}
