//! Task store — in-memory index of tasks with a durable JSON snapshot.
//!
//! Holds three indices: by id, by parent id, and by dependency id. All
//! mutation happens under one mutex; snapshots go to `tasks.json` in the
//! configured directory via write-temp-then-rename. On load, tasks that
//! were RUNNING are coerced back to PENDING (the process running them is
//! gone).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use taskhive_core::error::Result;
use taskhive_core::types::{Task, TaskStatus};

#[derive(Default)]
struct StoreInner {
    tasks: HashMap<String, Task>,
    /// parent id → child ids
    children: HashMap<String, Vec<String>>,
    /// dependency id → ids of tasks depending on it
    dependents: HashMap<String, Vec<String>>,
}

impl StoreInner {
    fn index(&mut self, task: &Task) {
        if let Some(parent_id) = &task.parent_id {
            self.children.entry(parent_id.clone()).or_default().push(task.id.clone());
        }
        for dep in &task.dependencies {
            self.dependents.entry(dep.clone()).or_default().push(task.id.clone());
        }
    }

    fn unindex(&mut self, task: &Task) {
        if let Some(parent_id) = &task.parent_id
            && let Some(children) = self.children.get_mut(parent_id)
        {
            children.retain(|id| id != &task.id);
        }
        for dep in &task.dependencies {
            if let Some(dependents) = self.dependents.get_mut(dep) {
                dependents.retain(|id| id != &task.id);
            }
        }
    }
}

/// Counts by status, for quick health introspection.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Serialize, Deserialize)]
struct TasksDocument {
    tasks: HashMap<String, Task>,
    timestamp: i64,
}

/// In-memory task table with an optional persistence directory.
pub struct TaskStore {
    inner: Mutex<StoreInner>,
    persist_dir: Option<PathBuf>,
}

impl TaskStore {
    /// Create a store. When a directory is given it is created eagerly and
    /// snapshots are written there.
    pub fn new(persist_dir: Option<PathBuf>) -> Result<Self> {
        if let Some(dir) = &persist_dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self { inner: Mutex::new(StoreInner::default()), persist_dir })
    }

    /// Insert a new task, wiring it into the parent's subtask list and the
    /// dependency index.
    pub fn insert(&self, task: Task) {
        let mut inner = self.inner.lock().expect("task store lock poisoned");
        if let Some(parent_id) = task.parent_id.clone()
            && let Some(parent) = inner.tasks.get_mut(&parent_id)
        {
            parent.subtasks.push(task.id.clone());
        }
        inner.index(&task);
        inner.tasks.insert(task.id.clone(), task);
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.inner.lock().expect("task store lock poisoned").tasks.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().expect("task store lock poisoned").tasks.contains_key(id)
    }

    /// List tasks filtered by status set and/or parent id.
    pub fn list(&self, status: Option<&[TaskStatus]>, parent_id: Option<&str>) -> Vec<Task> {
        let inner = self.inner.lock().expect("task store lock poisoned");
        inner
            .tasks
            .values()
            .filter(|task| {
                if let Some(statuses) = status
                    && !statuses.contains(&task.status)
                {
                    return false;
                }
                if let Some(parent) = parent_id
                    && task.parent_id.as_deref() != Some(parent)
                {
                    return false;
                }
                true
            })
            .cloned()
            .collect()
    }

    /// Atomically update one task under the store lock. Returns `None` when
    /// the task does not exist.
    pub fn mutate<R>(&self, id: &str, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        let mut inner = self.inner.lock().expect("task store lock poisoned");
        inner.tasks.get_mut(id).map(f)
    }

    pub fn delete(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().expect("task store lock poisoned");
        match inner.tasks.remove(id) {
            Some(task) => {
                inner.unindex(&task);
                true
            }
            None => false,
        }
    }

    /// Ids of tasks that list `id` as a dependency.
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        self.inner
            .lock()
            .expect("task store lock poisoned")
            .dependents
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// A task is ready for the queue when it is PENDING and every
    /// dependency is COMPLETED. Scheduled start times are handled by the
    /// ready queue's ordering, not here. Missing dependencies are treated
    /// as satisfied.
    pub fn is_ready(&self, task: &Task) -> bool {
        if task.status != TaskStatus::Pending {
            return false;
        }
        let inner = self.inner.lock().expect("task store lock poisoned");
        task.dependencies.iter().all(|dep| {
            inner.tasks.get(dep).map(|d| d.status == TaskStatus::Completed).unwrap_or(true)
        })
    }

    /// All tasks currently eligible for the queue.
    pub fn ready_tasks(&self) -> Vec<Task> {
        let candidates = self.list(Some(&[TaskStatus::Pending]), None);
        candidates.into_iter().filter(|t| self.is_ready(t)).collect()
    }

    /// Whether adding `task` would close a cycle in the dependency graph.
    pub fn would_create_cycle(&self, task: &Task) -> bool {
        let inner = self.inner.lock().expect("task store lock poisoned");
        let mut stack: Vec<String> = task.dependencies.clone();
        let mut visited = std::collections::HashSet::new();
        while let Some(current) = stack.pop() {
            if current == task.id {
                return true;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(dep) = inner.tasks.get(&current) {
                stack.extend(dep.dependencies.iter().cloned());
            }
        }
        false
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock().expect("task store lock poisoned");
        let mut stats = StoreStats { total: inner.tasks.len(), ..Default::default() };
        for task in inner.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Paused => stats.paused += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Serialize the full task table to `tasks.json` (write-temp-then-rename).
    pub fn save(&self) -> Result<()> {
        let Some(dir) = &self.persist_dir else { return Ok(()) };
        let document = {
            let inner = self.inner.lock().expect("task store lock poisoned");
            TasksDocument { tasks: inner.tasks.clone(), timestamp: Utc::now().timestamp() }
        };
        let path = dir.join("tasks.json");
        let tmp = dir.join("tasks.json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&document)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Save, logging instead of propagating. Persistence failures never
    /// abort execution.
    pub fn persist(&self) {
        if let Err(e) = self.save() {
            tracing::warn!("Failed to save tasks: {e}");
        }
    }

    /// Load any existing snapshot, merging under in-memory state (tasks
    /// already present keep their live record). Tasks that were RUNNING
    /// are coerced to PENDING; records that fail to decode are logged and
    /// skipped. Returns the number of tasks loaded.
    pub fn load(&self) -> Result<usize> {
        let Some(dir) = &self.persist_dir else { return Ok(0) };
        let path = dir.join("tasks.json");
        if !path.exists() {
            return Ok(0);
        }

        let text = std::fs::read_to_string(&path)?;
        let document: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Failed to parse {}: {e}", path.display());
                return Ok(0);
            }
        };

        let mut loaded = 0;
        let mut inner = self.inner.lock().expect("task store lock poisoned");

        if let Some(entries) = document.get("tasks").and_then(|t| t.as_object()) {
            for (id, record) in entries {
                if inner.tasks.contains_key(id) {
                    continue;
                }
                match serde_json::from_value::<Task>(record.clone()) {
                    Ok(mut task) => {
                        if task.status == TaskStatus::Running {
                            task.status = TaskStatus::Pending;
                        }
                        inner.index(&task);
                        inner.tasks.insert(id.clone(), task);
                        loaded += 1;
                    }
                    Err(e) => tracing::error!("Skipping task {id}: {e}"),
                }
            }
        }
        drop(inner);

        tracing::info!("Loaded {loaded} tasks from {}", path.display());
        Ok(loaded)
    }
}
