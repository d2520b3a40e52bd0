//! Feedback manager — append-only records with rolling per-target
//! summaries.
//!
//! Entries are never mutated after append; summaries fold each new entry
//! in as it arrives. Registered processors run synchronously on append and
//! a panicking processor is logged without interrupting the append. An
//! auto-save loop snapshots the table on a configurable interval and on
//! shutdown.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskhive_core::error::Result;
use taskhive_core::types::{FeedbackEntry, FeedbackKind, FeedbackSource, FeedbackSummary};
use tokio::task::JoinHandle;

/// Processor callback invoked synchronously on each append. Panics are
/// logged and ignored.
pub type ProcessorFn = Arc<dyn Fn(&FeedbackEntry) + Send + Sync>;

/// Filters for `list_feedback`. Empty vectors mean "no filter".
#[derive(Debug, Default, Clone)]
pub struct FeedbackFilter {
    pub kinds: Vec<FeedbackKind>,
    pub sources: Vec<FeedbackSource>,
    pub target_types: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Default)]
struct FeedbackInner {
    entries: HashMap<String, FeedbackEntry>,
    /// target id → entry ids
    by_target: HashMap<String, Vec<String>>,
    summaries: HashMap<String, FeedbackSummary>,
}

#[derive(Serialize, Deserialize)]
struct FeedbackDocument {
    feedback: HashMap<String, FeedbackEntry>,
    summaries: HashMap<String, FeedbackSummary>,
    timestamp: i64,
}

/// Manager for feedback collection and summarization.
pub struct FeedbackManager {
    inner: Mutex<FeedbackInner>,
    storage_dir: Option<PathBuf>,
    auto_save: bool,
    save_interval: Duration,
    processors: Mutex<Vec<ProcessorFn>>,
    active: AtomicBool,
    saver: Mutex<Option<JoinHandle<()>>>,
}

impl FeedbackManager {
    pub fn new(storage_dir: Option<PathBuf>, auto_save: bool, save_interval: Duration) -> Result<Self> {
        if let Some(dir) = &storage_dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self {
            inner: Mutex::new(FeedbackInner::default()),
            storage_dir,
            auto_save,
            save_interval: save_interval.max(Duration::from_millis(100)),
            processors: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
            saver: Mutex::new(None),
        })
    }

    pub fn add_processor(&self, processor: ProcessorFn) {
        self.processors.lock().expect("feedback lock poisoned").push(processor);
    }

    /// Append one feedback entry, updating the target summary and running
    /// registered processors. Returns the entry id.
    pub fn add(&self, entry: FeedbackEntry) -> String {
        let id = entry.id.clone();
        {
            let mut inner = self.inner.lock().expect("feedback lock poisoned");
            if let Some(target_id) = entry.target_id.clone() {
                inner.by_target.entry(target_id.clone()).or_default().push(id.clone());
                let target_type =
                    entry.target_type.clone().unwrap_or_else(|| "unknown".to_string());
                inner
                    .summaries
                    .entry(target_id.clone())
                    .or_insert_with(|| FeedbackSummary::new(&target_id, &target_type))
                    .absorb(&entry);
            }
            inner.entries.insert(id.clone(), entry.clone());
        }

        let processors = self.processors.lock().expect("feedback lock poisoned").clone();
        for processor in processors {
            if catch_unwind(AssertUnwindSafe(|| processor(&entry))).is_err() {
                tracing::error!("Feedback processor panicked on entry {id}");
            }
        }

        // Without the auto-save loop, persist eagerly
        if !self.auto_save {
            self.persist();
        }

        tracing::debug!("Added {:?} feedback ({id})", entry.kind);
        id
    }

    pub fn get(&self, id: &str) -> Option<FeedbackEntry> {
        self.inner.lock().expect("feedback lock poisoned").entries.get(id).cloned()
    }

    /// All feedback recorded for one target, in append order.
    pub fn for_target(&self, target_id: &str) -> Vec<FeedbackEntry> {
        let inner = self.inner.lock().expect("feedback lock poisoned");
        inner
            .by_target
            .get(target_id)
            .map(|ids| ids.iter().filter_map(|id| inner.entries.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn summary(&self, target_id: &str) -> Option<FeedbackSummary> {
        self.inner.lock().expect("feedback lock poisoned").summaries.get(target_id).cloned()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().expect("feedback lock poisoned").entries.len()
    }

    /// List feedback matching the filter, newest first.
    pub fn list(&self, filter: &FeedbackFilter) -> Vec<FeedbackEntry> {
        let inner = self.inner.lock().expect("feedback lock poisoned");
        let mut matching: Vec<FeedbackEntry> = inner
            .entries
            .values()
            .filter(|entry| {
                if !filter.kinds.is_empty() && !filter.kinds.contains(&entry.kind) {
                    return false;
                }
                if !filter.sources.is_empty() && !filter.sources.contains(&entry.source) {
                    return false;
                }
                if !filter.target_types.is_empty() {
                    match &entry.target_type {
                        Some(t) if filter.target_types.contains(t) => {}
                        _ => return false,
                    }
                }
                if let Some(since) = filter.since
                    && entry.created_at < since
                {
                    return false;
                }
                if let Some(until) = filter.until
                    && entry.created_at > until
                {
                    return false;
                }
                true
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        matching
    }

    /// Drop every entry and summary. Feedback is append-only until this
    /// explicit clear.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("feedback lock poisoned");
        inner.entries.clear();
        inner.by_target.clear();
        inner.summaries.clear();
        drop(inner);
        if !self.auto_save {
            self.persist();
        }
        tracing::info!("Cleared all feedback");
    }

    /// Start the auto-save loop (no-op when auto-save is off).
    pub fn start(self: &Arc<Self>) {
        if !self.auto_save {
            return;
        }
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        let interval = self.save_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick is immediate; skip it
            while manager.active.load(Ordering::SeqCst) {
                ticker.tick().await;
                manager.persist();
            }
        });
        *self.saver.lock().expect("feedback lock poisoned") = Some(handle);
        tracing::debug!("Feedback auto-save started ({:.0}s interval)", interval.as_secs_f64());
    }

    /// Stop the auto-save loop and take a final snapshot.
    pub async fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            let handle = self.saver.lock().expect("feedback lock poisoned").take();
            if let Some(mut handle) = handle
                && tokio::time::timeout(Duration::from_secs(5), &mut handle).await.is_err()
            {
                handle.abort();
            }
        }
        self.persist();
    }

    /// Serialize entries and summaries to `feedback.json`
    /// (write-temp-then-rename).
    pub fn save(&self) -> Result<()> {
        let Some(dir) = &self.storage_dir else { return Ok(()) };
        let document = {
            let inner = self.inner.lock().expect("feedback lock poisoned");
            FeedbackDocument {
                feedback: inner.entries.clone(),
                summaries: inner.summaries.clone(),
                timestamp: Utc::now().timestamp(),
            }
        };
        let path = dir.join("feedback.json");
        let tmp = dir.join("feedback.json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&document)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            tracing::warn!("Failed to save feedback: {e}");
        }
    }

    /// Load entries and summaries from storage. Records that fail to
    /// decode are logged and skipped.
    pub fn load(&self) -> Result<usize> {
        let Some(dir) = &self.storage_dir else { return Ok(0) };
        let path = dir.join("feedback.json");
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
        let mut inner = self.inner.lock().expect("feedback lock poisoned");
        if let Some(entries) = document.get("feedback").and_then(|f| f.as_object()) {
            for (id, record) in entries {
                if inner.entries.contains_key(id) {
                    continue;
                }
                match serde_json::from_value::<FeedbackEntry>(record.clone()) {
                    Ok(entry) => {
                        if let Some(target_id) = &entry.target_id {
                            inner.by_target.entry(target_id.clone()).or_default().push(id.clone());
                        }
                        inner.entries.insert(id.clone(), entry);
                        loaded += 1;
                    }
                    Err(e) => tracing::error!("Skipping feedback {id}: {e}"),
                }
            }
        }
        if let Some(summaries) = document.get("summaries").and_then(|s| s.as_object()) {
            for (target_id, record) in summaries {
                match serde_json::from_value::<FeedbackSummary>(record.clone()) {
                    Ok(summary) => {
                        inner.summaries.insert(target_id.clone(), summary);
                    }
                    Err(e) => tracing::error!("Skipping summary {target_id}: {e}"),
                }
            }
        }
        drop(inner);

        tracing::info!("Loaded {loaded} feedback entries from {}", path.display());
        Ok(loaded)
    }
}
