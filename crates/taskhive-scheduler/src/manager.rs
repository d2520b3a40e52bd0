//! Schedule manager — the tick loop that checks and fires due schedules.
//!
//! Schedules live in a map with a min-heap of `(next_run, id)` alongside.
//! A ticker wakes every `check_interval` and drains entries whose time has
//! come; each fire goes through the task emitter callback, which the
//! orchestrator points at the execution engine. The emitter indirection
//! keeps this crate free of a dependency cycle with the engine.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use taskhive_core::error::{Result, TaskhiveError};
use taskhive_core::types::{Schedule, ScheduleKind};
use tokio::task::JoinHandle;

use crate::cron;
use crate::next_run::compute_next_run;

/// Callback that materializes a task from a fired schedule and returns the
/// new task id.
pub type TaskEmitter = Arc<dyn Fn(&Schedule) -> Result<String> + Send + Sync>;

/// Filters for `list_schedules`.
#[derive(Debug, Default, Clone)]
pub struct ScheduleFilter {
    pub enabled: Option<bool>,
    pub kind: Option<ScheduleKind>,
    /// Every listed tag must be present on the schedule.
    pub tags: Vec<String>,
}

#[derive(Default)]
struct SchedInner {
    schedules: HashMap<String, Schedule>,
    /// Min-heap of (next_run epoch millis, schedule id). Entries may go
    /// stale; the tick loop discards any that no longer match the
    /// schedule's `next_run`.
    heap: BinaryHeap<Reverse<(i64, String)>>,
}

impl SchedInner {
    fn push_entry(&mut self, schedule: &Schedule) {
        if schedule.enabled
            && let Some(next) = schedule.next_run
        {
            self.heap.push(Reverse((next.timestamp_millis(), schedule.id.clone())));
        }
    }

    fn rebuild_heap(&mut self) {
        self.heap.clear();
        let entries: Vec<(i64, String)> = self
            .schedules
            .values()
            .filter(|s| s.enabled)
            .filter_map(|s| s.next_run.map(|next| (next.timestamp_millis(), s.id.clone())))
            .collect();
        for entry in entries {
            self.heap.push(Reverse(entry));
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SchedulesDocument {
    schedules: HashMap<String, Schedule>,
    timestamp: i64,
}

/// Manager for recurring schedules.
pub struct ScheduleManager {
    inner: Mutex<SchedInner>,
    storage_dir: Option<PathBuf>,
    check_interval: Duration,
    emitter: Mutex<Option<TaskEmitter>>,
    active: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduleManager {
    pub fn new(storage_dir: Option<PathBuf>, check_interval: Duration) -> Result<Self> {
        if let Some(dir) = &storage_dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self {
            inner: Mutex::new(SchedInner::default()),
            storage_dir,
            check_interval: check_interval.max(Duration::from_millis(50)),
            emitter: Mutex::new(None),
            active: AtomicBool::new(false),
            ticker: Mutex::new(None),
        })
    }

    pub fn set_emitter(&self, emitter: TaskEmitter) {
        *self.emitter.lock().expect("schedule manager lock poisoned") = Some(emitter);
    }

    /// Create a new schedule. Malformed kind-specific fields fail with
    /// `InvalidArgument`; creation is intentionally not deduplicated.
    pub fn create_schedule(&self, mut schedule: Schedule) -> Result<String> {
        validate(&schedule)?;
        schedule.next_run = compute_next_run(&schedule, Utc::now());
        let id = schedule.id.clone();

        {
            let mut inner = self.inner.lock().expect("schedule manager lock poisoned");
            inner.push_entry(&schedule);
            inner.schedules.insert(id.clone(), schedule.clone());
        }
        self.persist();

        tracing::info!("📅 Created {:?} schedule {id} ({})", schedule.kind, schedule.name);
        Ok(id)
    }

    pub fn get_schedule(&self, id: &str) -> Option<Schedule> {
        self.inner.lock().expect("schedule manager lock poisoned").schedules.get(id).cloned()
    }

    /// Number of schedules currently held.
    pub fn schedule_count(&self) -> usize {
        self.inner.lock().expect("schedule manager lock poisoned").schedules.len()
    }

    /// Apply an update to a schedule, then recompute its next fire time.
    pub fn update_schedule(&self, id: &str, f: impl FnOnce(&mut Schedule)) -> bool {
        let updated = {
            let mut inner = self.inner.lock().expect("schedule manager lock poisoned");
            match inner.schedules.get_mut(id) {
                Some(schedule) => {
                    f(schedule);
                    schedule.next_run = compute_next_run(schedule, Utc::now());
                    true
                }
                None => false,
            }
        };
        if !updated {
            tracing::warn!("Schedule {id} not found");
            return false;
        }
        self.inner.lock().expect("schedule manager lock poisoned").rebuild_heap();
        self.persist();
        tracing::info!("Updated schedule {id}");
        true
    }

    pub fn delete_schedule(&self, id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock().expect("schedule manager lock poisoned");
            let removed = inner.schedules.remove(id).is_some();
            if removed {
                inner.rebuild_heap();
            }
            removed
        };
        if removed {
            self.persist();
            tracing::info!("Deleted schedule {id}");
        } else {
            tracing::warn!("Schedule {id} not found");
        }
        removed
    }

    pub fn enable_schedule(&self, id: &str) -> bool {
        if self.get_schedule(id).is_none() {
            tracing::warn!("Schedule {id} not found");
            return false;
        }
        self.update_schedule(id, |s| s.enabled = true)
    }

    pub fn disable_schedule(&self, id: &str) -> bool {
        if self.get_schedule(id).is_none() {
            tracing::warn!("Schedule {id} not found");
            return false;
        }
        self.update_schedule(id, |s| s.enabled = false)
    }

    /// List schedules, optionally filtered by enabled state, kind, and tags.
    pub fn list_schedules(&self, filter: &ScheduleFilter) -> Vec<Schedule> {
        let inner = self.inner.lock().expect("schedule manager lock poisoned");
        inner
            .schedules
            .values()
            .filter(|s| {
                if let Some(enabled) = filter.enabled
                    && s.enabled != enabled
                {
                    return false;
                }
                if let Some(kind) = filter.kind
                    && s.kind != kind
                {
                    return false;
                }
                filter.tags.iter().all(|tag| s.tags.contains(tag))
            })
            .cloned()
            .collect()
    }

    /// Fire a schedule immediately, regardless of its timer. The pending
    /// timer entry is untouched; run budget accounting still applies.
    pub fn run_now(&self, id: &str) -> bool {
        if self.get_schedule(id).is_none() {
            tracing::warn!("Schedule {id} not found");
            return false;
        }
        self.fire(id);
        self.persist();
        true
    }

    /// Load persisted schedules and start the ticker.
    pub fn start(self: &Arc<Self>) {
        if self.active.swap(true, Ordering::SeqCst) {
            tracing::warn!("Scheduler already running");
            return;
        }
        if let Err(e) = self.load() {
            tracing::error!("Failed to load schedules: {e}");
        }

        let manager = Arc::clone(self);
        let check_interval = self.check_interval;
        let handle = tokio::spawn(async move {
            tracing::info!("⏰ Scheduler started (check every {:.1}s)", check_interval.as_secs_f64());
            let mut ticker = tokio::time::interval(check_interval);
            while manager.active.load(Ordering::SeqCst) {
                ticker.tick().await;
                manager.tick();
            }
            tracing::info!("Scheduler worker stopped");
        });
        *self.ticker.lock().expect("schedule manager lock poisoned") = Some(handle);
    }

    /// Stop the ticker and persist state.
    pub async fn stop(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            tracing::warn!("Scheduler not running");
            return;
        }
        tracing::info!("Stopping schedule manager");
        let handle = self.ticker.lock().expect("schedule manager lock poisoned").take();
        if let Some(mut handle) = handle
            && tokio::time::timeout(Duration::from_secs(5), &mut handle).await.is_err()
        {
            handle.abort();
        }
        self.persist();
        tracing::info!("Schedule manager stopped");
    }

    /// Drain all due heap entries: verify each schedule is still live,
    /// fire it, and re-insert the recomputed next occurrence. Returns the
    /// number of fires.
    pub fn tick(&self) -> usize {
        let now_millis = Utc::now().timestamp_millis();
        let mut fired = 0;

        loop {
            let due = {
                let mut inner = self.inner.lock().expect("schedule manager lock poisoned");
                match inner.heap.peek() {
                    Some(Reverse((ts, _))) if *ts <= now_millis => {
                        inner.heap.pop().map(|Reverse(entry)| entry)
                    }
                    _ => None,
                }
            };
            let Some((entry_millis, id)) = due else { break };

            let eligible = {
                let inner = self.inner.lock().expect("schedule manager lock poisoned");
                inner.schedules.get(&id).is_some_and(|s| {
                    s.enabled
                        && !s.is_exhausted()
                        // Stale entries (superseded by updates) are discarded
                        && s.next_run.is_some_and(|next| next.timestamp_millis() == entry_millis)
                })
            };
            if !eligible {
                continue;
            }

            self.fire(&id);
            self.rearm(&id);
            fired += 1;
        }

        if fired > 0 {
            self.persist();
        }
        fired
    }

    /// Update run tracking and emit the task for one fire.
    fn fire(&self, id: &str) {
        let snapshot = {
            let mut inner = self.inner.lock().expect("schedule manager lock poisoned");
            let Some(schedule) = inner.schedules.get_mut(id) else { return };
            schedule.last_run = Some(Utc::now());
            schedule.run_count += 1;
            schedule.clone()
        };
        tracing::info!("🔔 Schedule fired: '{}' ({})", snapshot.name, snapshot.id);

        let emitter = self.emitter.lock().expect("schedule manager lock poisoned").clone();
        match emitter {
            Some(emit) => match emit(&snapshot) {
                Ok(task_id) => {
                    tracing::info!("Created task {task_id} for schedule {}", snapshot.id);
                }
                Err(e) => tracing::error!("Error executing schedule {}: {e}", snapshot.id),
            },
            None => tracing::warn!("No task emitter configured for schedule {}", snapshot.id),
        }
    }

    /// Recompute `next_run` after a fire and re-insert unless exhausted.
    fn rearm(&self, id: &str) {
        let mut inner = self.inner.lock().expect("schedule manager lock poisoned");
        let updated = match inner.schedules.get_mut(id) {
            Some(schedule) => {
                schedule.next_run = compute_next_run(schedule, Utc::now());
                Some(schedule.clone())
            }
            None => None,
        };
        if let Some(schedule) = updated {
            inner.push_entry(&schedule);
        }
    }

    /// Serialize all schedules to `schedules.json` (write-temp-then-rename).
    pub fn save(&self) -> Result<()> {
        let Some(dir) = &self.storage_dir else { return Ok(()) };
        let document = {
            let inner = self.inner.lock().expect("schedule manager lock poisoned");
            SchedulesDocument {
                schedules: inner.schedules.clone(),
                timestamp: Utc::now().timestamp(),
            }
        };
        let path = dir.join("schedules.json");
        let tmp = dir.join("schedules.json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&document)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            tracing::warn!("Failed to save schedules: {e}");
        }
    }

    /// Load schedules from storage, recomputing every `next_run`. Records
    /// that fail to decode are logged and skipped.
    pub fn load(&self) -> Result<usize> {
        let Some(dir) = &self.storage_dir else { return Ok(0) };
        let path = dir.join("schedules.json");
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
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("schedule manager lock poisoned");
        if let Some(entries) = document.get("schedules").and_then(|s| s.as_object()) {
            for (id, record) in entries {
                if inner.schedules.contains_key(id) {
                    continue;
                }
                match serde_json::from_value::<Schedule>(record.clone()) {
                    Ok(mut schedule) => {
                        schedule.next_run = compute_next_run(&schedule, now);
                        inner.schedules.insert(id.clone(), schedule);
                        loaded += 1;
                    }
                    Err(e) => tracing::error!("Skipping schedule {id}: {e}"),
                }
            }
        }
        inner.rebuild_heap();
        drop(inner);

        tracing::info!("Loaded {loaded} schedules from {}", path.display());
        Ok(loaded)
    }
}

/// Structural validation at creation time.
fn validate(schedule: &Schedule) -> Result<()> {
    match schedule.kind {
        ScheduleKind::Once => {
            if schedule.start_time.is_none() {
                return Err(TaskhiveError::invalid_argument("once schedule requires start_time"));
            }
        }
        ScheduleKind::Interval => match schedule.interval_secs {
            Some(secs) if secs > 0.0 => {}
            _ => {
                return Err(TaskhiveError::invalid_argument(
                    "interval schedule requires a positive interval_secs",
                ));
            }
        },
        ScheduleKind::Daily => {
            if schedule.parse_time_of_day().is_none() {
                return Err(TaskhiveError::invalid_argument(
                    "daily schedule requires time_of_day as \"HH:MM\"",
                ));
            }
        }
        ScheduleKind::Weekly => {
            if schedule.days.is_empty() || schedule.days.iter().any(|d| *d > 6) {
                return Err(TaskhiveError::invalid_argument(
                    "weekly schedule requires weekdays in 0..=6",
                ));
            }
            if schedule.parse_time_of_day().is_none() {
                return Err(TaskhiveError::invalid_argument(
                    "weekly schedule requires time_of_day as \"HH:MM\"",
                ));
            }
        }
        ScheduleKind::Monthly => {
            match schedule.days.first() {
                Some(day) if (1..=31).contains(day) => {}
                _ => {
                    return Err(TaskhiveError::invalid_argument(
                        "monthly schedule requires a day-of-month in 1..=31",
                    ));
                }
            }
            if schedule.parse_time_of_day().is_none() {
                return Err(TaskhiveError::invalid_argument(
                    "monthly schedule requires time_of_day as \"HH:MM\"",
                ));
            }
        }
        ScheduleKind::Cron => match schedule.cron_expression.as_deref() {
            Some(expression) => {
                cron::parse(expression)?;
            }
            None => {
                return Err(TaskhiveError::invalid_argument(
                    "cron schedule requires cron_expression",
                ));
            }
        },
    }
    Ok(())
}
