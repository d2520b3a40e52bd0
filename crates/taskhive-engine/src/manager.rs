//! Autonomy manager — dispatcher, bounded worker pool, and the
//! dependency/retry engine.
//!
//! A single dispatcher drains the ready queue, runs each task through the
//! policy gate, and hands approved work to semaphore-bounded workers.
//! Completions flow back through the retry/rollup logic: failures re-arm
//! with a delay until `max_retries`, dependents are enqueued when their
//! dependencies complete, and a parent task reaches its terminal state
//! through the subtask rollup rule.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Value, json};
use taskhive_core::error::{Result, TaskhiveError};
use taskhive_core::types::{Task, TaskResult, TaskSpec, TaskStatus};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::policy::PolicyGate;
use crate::queue::ReadyQueue;
use crate::registry::{ActionOutcome, ActionRegistry};
use crate::store::{StoreStats, TaskStore};

/// Completion callback: `(task, result) → ()`. Panics are logged and
/// ignored.
pub type CompletionFn = Arc<dyn Fn(&Task, &TaskResult) + Send + Sync>;

/// How long the dispatcher parks on an empty queue before re-checking.
const DISPATCH_WAIT: Duration = Duration::from_millis(500);

struct Inner {
    registry: Arc<ActionRegistry>,
    store: Arc<TaskStore>,
    queue: ReadyQueue,
    policy: Arc<PolicyGate>,
    permits: Arc<Semaphore>,
    running: Mutex<HashMap<String, JoinHandle<()>>>,
    completion_callbacks: Mutex<Vec<CompletionFn>>,
    completion_notify: Notify,
    active: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Manager for autonomous task execution.
pub struct AutonomyManager {
    inner: Arc<Inner>,
}

impl AutonomyManager {
    pub fn new(
        registry: Arc<ActionRegistry>,
        store: Arc<TaskStore>,
        policy: Arc<PolicyGate>,
        max_concurrent_tasks: usize,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(max_concurrent_tasks.max(1)));
        Self {
            inner: Arc::new(Inner {
                registry,
                store,
                queue: ReadyQueue::new(),
                policy,
                permits,
                running: Mutex::new(HashMap::new()),
                completion_callbacks: Mutex::new(Vec::new()),
                completion_notify: Notify::new(),
                active: AtomicBool::new(false),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Register a completion callback, fired on every terminal transition
    /// of an executed task.
    pub fn add_completion_callback(&self, callback: CompletionFn) {
        self.inner.completion_callbacks.lock().expect("manager lock poisoned").push(callback);
    }

    /// Load persisted tasks, rebuild the ready queue, and start the
    /// dispatcher.
    pub fn start(&self) {
        if self.inner.active.swap(true, Ordering::SeqCst) {
            tracing::warn!("Autonomy manager already running");
            return;
        }
        if let Err(e) = self.inner.store.load() {
            tracing::error!("Failed to load persisted tasks: {e}");
        }
        for task in self.inner.store.ready_tasks() {
            self.inner.queue.push(&task);
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { dispatch_loop(inner).await });
        *self.inner.dispatcher.lock().expect("manager lock poisoned") = Some(handle);

        tracing::info!("Autonomy manager started (level: {})", self.inner.policy.level());
    }

    /// Stop dispatching. With `wait`, in-flight tasks get up to `timeout`
    /// to finish; without it they are cancelled cooperatively. Final state
    /// is persisted either way.
    pub async fn stop(&self, wait: bool, timeout: Duration) {
        if !self.inner.active.swap(false, Ordering::SeqCst) {
            tracing::warn!("Autonomy manager not running");
            return;
        }
        tracing::info!("Stopping autonomy manager");

        if wait {
            let deadline = Instant::now() + timeout;
            loop {
                let active = {
                    let mut running = self.inner.running.lock().expect("manager lock poisoned");
                    running.retain(|_, handle| !handle.is_finished());
                    running.len()
                };
                if active == 0 {
                    break;
                }
                if Instant::now() >= deadline {
                    tracing::warn!("Timed out waiting for {active} running tasks");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        } else {
            let handles: Vec<(String, JoinHandle<()>)> = {
                let mut running = self.inner.running.lock().expect("manager lock poisoned");
                running.drain().collect()
            };
            for (id, handle) in handles {
                handle.abort();
                // Re-armed on the next start, same as a crash recovery
                self.inner.store.mutate(&id, |t| {
                    if t.status == TaskStatus::Running {
                        t.status = TaskStatus::Pending;
                    }
                });
                tracing::debug!("Aborted in-flight task {id}");
            }
        }

        let dispatcher = self.inner.dispatcher.lock().expect("manager lock poisoned").take();
        if let Some(mut handle) = dispatcher
            && tokio::time::timeout(Duration::from_secs(5), &mut handle).await.is_err()
        {
            handle.abort();
        }

        self.inner.store.persist();
        tracing::info!("Autonomy manager stopped");
    }

    /// Create a new task. Fails with `InvalidArgument` for unknown actions,
    /// schema violations, unknown parents, or dependency cycles.
    pub fn create_task(&self, spec: TaskSpec) -> Result<String> {
        self.inner.registry.validate(&spec.action, &spec.parameters)?;
        if let Some(parent_id) = &spec.parent_id
            && !self.inner.store.contains(parent_id)
        {
            return Err(TaskhiveError::invalid_argument(format!("unknown parent task: {parent_id}")));
        }

        let task = Task::from_spec(spec);
        if self.inner.store.would_create_cycle(&task) {
            return Err(TaskhiveError::DependencyCycle(format!(
                "task '{}' would close a dependency cycle",
                task.name
            )));
        }

        let id = task.id.clone();
        let ready = self.inner.store.is_ready(&task);
        self.inner.store.insert(task.clone());
        if ready {
            self.inner.queue.push(&task);
        }
        self.inner.store.persist();
        tracing::info!("Created task {id} ({})", task.name);
        Ok(id)
    }

    /// Create a chain: a `chain_coordinator` parent plus one subtask per
    /// spec, each depending on the previous one. The parent completes via
    /// the rollup rule.
    pub fn create_chain(
        &self,
        tasks: Vec<TaskSpec>,
        name: &str,
        description: &str,
        metadata: HashMap<String, Value>,
    ) -> Result<String> {
        if tasks.is_empty() {
            return Err(TaskhiveError::invalid_argument("no tasks provided"));
        }
        // Validate every link up front so a bad spec cannot leave a partial chain
        for spec in &tasks {
            self.inner.registry.validate(&spec.action, &spec.parameters)?;
        }

        let chain_name = if name.is_empty() { "Task Chain" } else { name };
        let chain_description = if description.is_empty() {
            format!("Chain of {} tasks", tasks.len())
        } else {
            description.to_string()
        };
        let parent_id = self.create_task(
            TaskSpec::new("chain_coordinator")
                .with_name(chain_name)
                .with_description(&chain_description)
                .with_metadata(metadata),
        )?;

        let mut previous: Option<String> = None;
        for (i, mut spec) in tasks.into_iter().enumerate() {
            if let Some(prev) = &previous {
                spec.dependencies.push(prev.clone());
            }
            spec.parent_id = Some(parent_id.clone());
            if spec.name.is_empty() {
                spec.name = format!("Step {}", i + 1);
            }
            previous = Some(self.create_task(spec)?);
        }

        Ok(parent_id)
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.inner.store.get(id)
    }

    pub fn list_tasks(&self, status: Option<&[TaskStatus]>, parent_id: Option<&str>) -> Vec<Task> {
        self.inner.store.list(status, parent_id)
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.store.stats()
    }

    /// Cancel a task. PENDING tasks flip to CANCELLED immediately; RUNNING
    /// tasks get a cooperative cancel of the in-flight handle. Recurses
    /// into subtasks. Returns false for unknown or already-terminal tasks.
    pub fn cancel_task(&self, id: &str) -> bool {
        let Some(task) = self.inner.store.get(id) else {
            tracing::warn!("Task {id} not found");
            return false;
        };
        if task.is_terminal() {
            tracing::debug!("Task {id} already {:?}", task.status);
            return false;
        }

        let handle = self.inner.running.lock().expect("manager lock poisoned").remove(id);
        if let Some(handle) = handle
            && !handle.is_finished()
        {
            handle.abort();
        }

        let transitioned = self
            .inner
            .store
            .mutate(id, |t| {
                t.metadata.insert("cancel_requested".to_string(), json!(true));
                if t.status.is_terminal() {
                    // The action beat the cancel; it completes normally
                    return false;
                }
                t.status = TaskStatus::Cancelled;
                if t.completed_at.is_none() {
                    t.completed_at = Some(Utc::now());
                }
                true
            })
            .unwrap_or(false);

        for subtask_id in &task.subtasks {
            self.cancel_task(subtask_id);
        }

        if transitioned {
            tracing::info!("Cancelled task {id}");
            self.inner.store.persist();
            if let Some(parent_id) = &task.parent_id {
                self.inner.check_parent_rollup(parent_id);
            }
            self.inner.completion_notify.notify_waiters();
        }
        transitioned
    }

    /// Block until the task reaches a terminal state or the timeout
    /// elapses.
    pub async fn wait_for_task(&self, id: &str, timeout: Option<Duration>) -> Option<TaskResult> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.inner.completion_notify.notified();
            let mut notified = pin!(notified);
            notified.as_mut().enable();

            match self.inner.store.get(id) {
                None => {
                    tracing::warn!("Task {id} not found");
                    return None;
                }
                Some(task) if task.is_terminal() => return Some(Inner::result_of(&task)),
                Some(_) => {}
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    if tokio::time::timeout(deadline - now, notified).await.is_err() {
                        // Final check after the timeout fires
                        return self
                            .inner
                            .store
                            .get(id)
                            .filter(|t| t.is_terminal())
                            .map(|t| Inner::result_of(&t));
                    }
                }
                None => notified.await,
            }
        }
    }
}

impl Inner {
    fn result_of(task: &Task) -> TaskResult {
        let execution_time_secs = match (task.started_at, task.completed_at) {
            (Some(started), Some(completed)) => {
                (completed - started).num_milliseconds().max(0) as f64 / 1000.0
            }
            _ => 0.0,
        };
        TaskResult {
            task_id: task.id.clone(),
            success: task.status == TaskStatus::Completed,
            result: task.result.clone(),
            error: task.error.clone(),
            execution_time_secs,
        }
    }

    /// Record the outcome of one executed attempt and run the
    /// dependency/retry engine.
    fn finish_task(&self, task_id: &str, outcome: ActionOutcome, elapsed_secs: f64) {
        self.running.lock().expect("manager lock poisoned").remove(task_id);
        let Some(before) = self.store.get(task_id) else {
            tracing::warn!("Task {task_id} vanished from store");
            return;
        };
        if before.is_terminal() {
            // Cancelled mid-flight but the action had already committed
            if outcome.is_ok() {
                self.store.mutate(task_id, |t| {
                    t.metadata.insert("completed_after_cancel".to_string(), json!(true));
                });
                self.store.persist();
            }
            return;
        }

        match outcome {
            Ok(value) => {
                if !before.subtasks.is_empty() {
                    // Parent stays RUNNING until the rollup commits it; its
                    // own result is staged and later replaced by the summary
                    self.store.mutate(task_id, |t| {
                        if !t.status.is_terminal() {
                            t.result = Some(value);
                        }
                    });
                    self.store.persist();
                    tracing::debug!("Task {task_id} awaiting subtask rollup");
                    // Finalize right away if every subtask already settled
                    self.try_finalize_parent(task_id);
                    return;
                }

                self.store.mutate(task_id, |t| {
                    t.status = TaskStatus::Completed;
                    t.result = Some(value);
                    t.error = None;
                    t.completed_at = Some(Utc::now());
                });
                tracing::info!("Task {task_id} completed");
                self.after_terminal(task_id, elapsed_secs);
            }
            Err(error) => {
                if before.retry_count < before.max_retries {
                    let attempt = before.retry_count + 1;
                    let delay_secs = before.retry_delay_secs.max(0.0);
                    self.store.mutate(task_id, |t| {
                        t.retry_count = attempt;
                        t.status = TaskStatus::Pending;
                        t.error = Some(format!("{error} (retry {attempt}/{})", t.max_retries));
                        t.scheduled_at = Some(
                            Utc::now() + chrono::Duration::milliseconds((delay_secs * 1000.0) as i64),
                        );
                    });
                    tracing::warn!(
                        "Task {task_id} failed (attempt {attempt}/{}), retry in {delay_secs}s: {error}",
                        before.max_retries
                    );
                    if let Some(task) = self.store.get(task_id) {
                        self.queue.push(&task);
                    }
                    self.store.persist();
                } else {
                    self.store.mutate(task_id, |t| {
                        t.status = TaskStatus::Failed;
                        t.error = Some(format!("{error} (max retries exceeded)"));
                        t.completed_at = Some(Utc::now());
                    });
                    tracing::error!(
                        "Task {task_id} permanently failed after {} attempts: {error}",
                        before.retry_count + 1
                    );
                    self.after_terminal(task_id, elapsed_secs);
                }
            }
        }
    }

    /// Terminal transition without execution (safety veto, disapproval,
    /// missing action). No completion callback; rollup and waiters still
    /// fire.
    fn reject(&self, task_id: &str, status: TaskStatus, error: String) {
        self.store.mutate(task_id, |t| {
            if t.status.is_terminal() {
                return;
            }
            t.status = status;
            t.error = Some(error);
            t.completed_at = Some(Utc::now());
        });
        self.store.persist();
        if let Some(task) = self.store.get(task_id)
            && let Some(parent_id) = &task.parent_id
        {
            self.check_parent_rollup(parent_id);
        }
        self.completion_notify.notify_waiters();
    }

    /// Housekeeping after a terminal transition: persist, fire the
    /// completion callback, wake dependents, roll up the parent, notify
    /// waiters.
    fn after_terminal(&self, task_id: &str, elapsed_secs: f64) {
        self.store.persist();
        let Some(task) = self.store.get(task_id) else { return };

        let callbacks = self.completion_callbacks.lock().expect("manager lock poisoned").clone();
        if !callbacks.is_empty() {
            let mut result = Self::result_of(&task);
            if elapsed_secs > 0.0 {
                result.execution_time_secs = elapsed_secs;
            }
            for callback in callbacks {
                if catch_unwind(AssertUnwindSafe(|| callback(&task, &result))).is_err() {
                    tracing::error!("Completion callback panicked for task {task_id}");
                }
            }
        }

        if task.status == TaskStatus::Completed {
            for dependent_id in self.store.dependents_of(task_id) {
                if let Some(dependent) = self.store.get(&dependent_id)
                    && self.store.is_ready(&dependent)
                {
                    self.queue.push(&dependent);
                }
            }
        }

        if let Some(parent_id) = &task.parent_id {
            self.check_parent_rollup(parent_id);
        }
        self.completion_notify.notify_waiters();
    }

    /// Parent rollup entry point for subtask transitions: once every
    /// subtask is terminal (and the parent's own action has finished), the
    /// parent transitions: COMPLETED iff every subtask completed, else
    /// FAILED with the failed ids.
    fn check_parent_rollup(&self, parent_id: &str) {
        // Parent action still executing; its finish path finalizes. A
        // finished handle is stale (its finish path already ran) and must
        // not block the rollup.
        let parent_in_flight = {
            let mut running = self.running.lock().expect("manager lock poisoned");
            match running.get(parent_id) {
                Some(handle) if handle.is_finished() => {
                    running.remove(parent_id);
                    false
                }
                Some(_) => true,
                None => false,
            }
        };
        if parent_in_flight {
            return;
        }
        self.try_finalize_parent(parent_id);
    }

    fn try_finalize_parent(&self, parent_id: &str) {
        let Some(parent) = self.store.get(parent_id) else { return };
        if parent.status != TaskStatus::Running || parent.subtasks.is_empty() {
            return;
        }
        let subtasks: Vec<Task> =
            parent.subtasks.iter().filter_map(|sid| self.store.get(sid)).collect();
        if subtasks.iter().any(|s| !s.is_terminal()) {
            return;
        }

        let failed: Vec<String> = subtasks
            .iter()
            .filter(|s| s.status != TaskStatus::Completed)
            .map(|s| s.id.clone())
            .collect();
        let completed = subtasks.len() - failed.len();
        let now = Utc::now();

        // Only the caller that flips RUNNING → terminal commits the
        // summary; concurrent rollup attempts become no-ops
        let committed = self
            .store
            .mutate(parent_id, |t| {
                if t.status != TaskStatus::Running {
                    return false;
                }
                if failed.is_empty() {
                    t.status = TaskStatus::Completed;
                    t.result =
                        Some(json!({ "subtasks_completed": completed, "subtasks_failed": 0 }));
                    t.error = None;
                } else {
                    t.status = TaskStatus::Failed;
                    t.error = Some(format!("Failed subtasks: {}", failed.join(", ")));
                    t.result = Some(json!({
                        "subtasks_completed": completed,
                        "subtasks_failed": failed.len(),
                        "failed_subtasks": failed,
                    }));
                }
                t.completed_at = Some(now);
                true
            })
            .unwrap_or(false);
        if !committed {
            return;
        }

        if failed.is_empty() {
            tracing::info!("Parent task {parent_id} completed ({completed} subtasks)");
        } else {
            tracing::warn!(
                "Parent task {parent_id} failed ({} of {} subtasks)",
                subtasks.len() - completed,
                subtasks.len()
            );
        }

        let elapsed = self
            .store
            .get(parent_id)
            .and_then(|t| t.started_at.map(|s| (now - s).num_milliseconds().max(0) as f64 / 1000.0))
            .unwrap_or(0.0);
        self.after_terminal(parent_id, elapsed);
    }
}

async fn dispatch_loop(inner: Arc<Inner>) {
    tracing::info!("Task dispatcher started");

    while inner.active.load(Ordering::SeqCst) {
        let Some((_key, task_id)) = inner.queue.pop() else {
            inner.queue.wait(DISPATCH_WAIT).await;
            continue;
        };

        let Some(task) = inner.store.get(&task_id) else {
            tracing::warn!("Task {task_id} not found in store");
            continue;
        };
        if task.status != TaskStatus::Pending {
            tracing::debug!("Skipping task {task_id} with status {:?}", task.status);
            continue;
        }
        // Dependencies unmet: dropped here, re-enqueued when they complete
        if !inner.store.is_ready(&task) {
            continue;
        }

        // Not due yet: put it back and park briefly (the push re-notifies,
        // so a plain sleep avoids spinning on our own wake-up)
        if let Some(at) = task.scheduled_at
            && at > Utc::now()
        {
            inner.queue.push(&task);
            let until_due = (at - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(until_due.min(DISPATCH_WAIT)).await;
            continue;
        }

        let (safe, reason) = inner.policy.check_safety(&task);
        if !safe {
            tracing::warn!("Safety check failed for task {task_id}: {reason}");
            inner.reject(&task_id, TaskStatus::Failed, format!("Safety check failed: {reason}"));
            continue;
        }

        if !inner.policy.approve(&task) {
            tracing::info!("Task {task_id} not approved");
            inner.reject(&task_id, TaskStatus::Cancelled, "Not approved".to_string());
            continue;
        }

        // The action may have been removed between submission and dispatch
        let Some(action) = inner.registry.get(&task.action) else {
            tracing::error!("Unknown action '{}' for task {task_id}", task.action);
            inner.reject(&task_id, TaskStatus::Failed, format!("Unknown action: {}", task.action));
            continue;
        };

        // Saturated pool blocks dispatch until a worker frees up
        let mut permit = None;
        while inner.active.load(Ordering::SeqCst) {
            match tokio::time::timeout(DISPATCH_WAIT, Arc::clone(&inner.permits).acquire_owned())
                .await
            {
                Ok(Ok(acquired)) => {
                    permit = Some(acquired);
                    break;
                }
                Ok(Err(_)) => return,
                Err(_) => continue,
            }
        }
        let Some(permit) = permit else {
            // Shutting down; re-arm the task for the next start
            inner.queue.push(&task);
            continue;
        };

        // Single-execution guard: only the dispatch that flips
        // PENDING → RUNNING proceeds (duplicate queue entries are benign)
        let flipped = inner
            .store
            .mutate(&task_id, |t| {
                if t.status == TaskStatus::Pending {
                    t.status = TaskStatus::Running;
                    t.started_at.get_or_insert(Utc::now());
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if !flipped {
            continue;
        }
        inner.store.persist();

        tracing::info!("Executing task {task_id} ({})", task.name);
        let worker_inner = Arc::clone(&inner);
        let parameters = task.parameters.clone();
        let timeout_secs = task.timeout_secs;
        let handler = action.handler.clone();
        let worker_task_id = task_id.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            let started = Instant::now();
            let fut = (handler)(parameters);
            let outcome = match timeout_secs {
                Some(secs) => {
                    match tokio::time::timeout(Duration::from_secs_f64(secs.max(0.0)), fut).await {
                        Ok(result) => result,
                        Err(_) => Err("timeout".to_string()),
                    }
                }
                None => fut.await,
            };
            let elapsed = started.elapsed().as_secs_f64();
            worker_inner.finish_task(&worker_task_id, outcome, elapsed);
        });
        if !handle.is_finished() {
            inner.running.lock().expect("manager lock poisoned").insert(task_id, handle);
        }
    }

    tracing::info!("Task dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ParamSpec;
    use std::sync::atomic::AtomicUsize;
    use taskhive_core::config::{AutonomyConfig, AutonomyLevel};

    fn test_manager(level: AutonomyLevel) -> AutonomyManager {
        let registry = Arc::new(ActionRegistry::new());
        registry.register(
            "echo",
            "Echo the input value",
            vec![("v", ParamSpec::required("Value to echo"))],
            |params| async move { Ok(params.get("v").cloned().unwrap_or(Value::Null)) },
        );
        registry.register("chain_coordinator", "Coordinator for task chains", vec![], |_| async {
            Ok(json!({"status": "chain_completed"}))
        });
        let store = Arc::new(TaskStore::new(None).unwrap());
        let policy = Arc::new(PolicyGate::with_level(&AutonomyConfig::default(), level));
        AutonomyManager::new(registry, store, policy, 2)
    }

    #[test]
    fn test_create_rejects_unknown_action() {
        let manager = test_manager(AutonomyLevel::Full);
        let err = manager.create_task(TaskSpec::new("nope")).unwrap_err();
        assert!(matches!(err, TaskhiveError::UnknownAction(_)));
    }

    #[test]
    fn test_create_rejects_bad_parameters() {
        let manager = test_manager(AutonomyLevel::Full);
        let err = manager
            .create_task(TaskSpec::new("echo").with_parameter("bogus", json!(1)))
            .unwrap_err();
        assert!(matches!(err, TaskhiveError::InvalidArgument(_)));
    }

    #[test]
    fn test_create_rejects_unknown_parent() {
        let manager = test_manager(AutonomyLevel::Full);
        let err = manager
            .create_task(TaskSpec::new("echo").with_parameter("v", json!(1)).with_parent("ghost"))
            .unwrap_err();
        assert!(matches!(err, TaskhiveError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_task_executes_and_completes() {
        let manager = test_manager(AutonomyLevel::Full);
        manager.start();

        let id = manager
            .create_task(TaskSpec::new("echo").with_parameter("v", json!("hello")))
            .unwrap();
        let result = manager.wait_for_task(&id, Some(Duration::from_secs(5))).await.unwrap();
        assert!(result.success);
        assert_eq!(result.result, Some(json!("hello")));

        let task = manager.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.unwrap() >= task.started_at.unwrap());
        assert!(task.started_at.unwrap() >= task.created_at);

        manager.stop(true, Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let manager = test_manager(AutonomyLevel::Full);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        // Fails twice, succeeds on the third call
        manager.inner.registry.register("flaky", "Fails twice then succeeds", vec![], move |_| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("E".to_string())
                } else {
                    Ok(json!("ok"))
                }
            }
        });
        manager.start();

        let id = manager
            .create_task(TaskSpec::new("flaky").with_max_retries(3).with_retry_delay(0.0))
            .unwrap();
        let result = manager.wait_for_task(&id, Some(Duration::from_secs(10))).await.unwrap();
        assert!(result.success);
        assert_eq!(result.result, Some(json!("ok")));

        let task = manager.get_task(&id).unwrap();
        assert_eq!(task.retry_count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        manager.stop(true, Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail() {
        let manager = test_manager(AutonomyLevel::Full);
        manager.inner.registry.register("doomed", "Always fails", vec![], |_| async {
            Err("E".to_string())
        });
        manager.start();

        let id = manager
            .create_task(TaskSpec::new("doomed").with_max_retries(1).with_retry_delay(0.0))
            .unwrap();
        let result = manager.wait_for_task(&id, Some(Duration::from_secs(10))).await.unwrap();
        assert!(!result.success);

        let task = manager.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 1);
        assert!(task.error.unwrap().contains("max retries exceeded"));

        manager.stop(true, Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let manager = test_manager(AutonomyLevel::Full);
        manager.inner.registry.register("slow", "Sleeps for a long time", vec![], |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        });
        manager.start();

        let id = manager
            .create_task(
                TaskSpec::new("slow").with_timeout(0.2).with_max_retries(0).with_retry_delay(0.0),
            )
            .unwrap();
        let result = manager.wait_for_task(&id, Some(Duration::from_secs(10))).await.unwrap();
        assert!(!result.success);
        let task = manager.get_task(&id).unwrap();
        assert!(task.error.unwrap().contains("timeout"));

        manager.stop(false, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_cancel_pending_and_terminal() {
        let manager = test_manager(AutonomyLevel::Full);
        // Not started: task stays PENDING
        let id = manager
            .create_task(TaskSpec::new("echo").with_parameter("v", json!(1)))
            .unwrap();
        assert!(manager.cancel_task(&id));
        assert_eq!(manager.get_task(&id).unwrap().status, TaskStatus::Cancelled);
        // Cancel on a terminal task is a no-op returning false
        assert!(!manager.cancel_task(&id));
    }

    #[tokio::test]
    async fn test_disabled_level_rejects() {
        let manager = test_manager(AutonomyLevel::Disabled);
        manager.start();

        let id = manager
            .create_task(TaskSpec::new("echo").with_parameter("v", json!(1)))
            .unwrap();
        let result = manager.wait_for_task(&id, Some(Duration::from_secs(5))).await.unwrap();
        assert!(!result.success);
        let task = manager.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.error.as_deref(), Some("Not approved"));

        manager.stop(true, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_chain_rollup() {
        let manager = test_manager(AutonomyLevel::Full);
        manager.start();

        let specs = vec![
            TaskSpec::new("echo").with_parameter("v", json!(1)),
            TaskSpec::new("echo").with_parameter("v", json!(2)),
        ];
        let parent_id = manager.create_chain(specs, "pair", "", HashMap::new()).unwrap();
        let result = manager.wait_for_task(&parent_id, Some(Duration::from_secs(10))).await.unwrap();
        assert!(result.success);
        assert_eq!(
            result.result,
            Some(json!({"subtasks_completed": 2, "subtasks_failed": 0}))
        );

        let children = manager.list_tasks(None, Some(&parent_id));
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.status == TaskStatus::Completed));

        manager.stop(true, Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_wait_for_task_timeout() {
        let manager = test_manager(AutonomyLevel::Full);
        // Dispatcher never started, so the task never runs
        let id = manager
            .create_task(TaskSpec::new("echo").with_parameter("v", json!(1)))
            .unwrap();
        let result = manager.wait_for_task(&id, Some(Duration::from_millis(200))).await;
        assert!(result.is_none());
    }
}
