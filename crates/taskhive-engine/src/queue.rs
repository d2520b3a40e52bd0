//! Ready queue — priority/time-ordered queue of runnable task ids.
//!
//! One ordering rule serves both scheduled and immediate work: a task
//! scheduled in the future sorts by its scheduled timestamp (epoch millis),
//! everything else sorts by negated priority, so higher priority pops
//! first and immediate work always precedes future work. Ties break FIFO
//! by insertion sequence.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use taskhive_core::types::Task;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    key: i64,
    seq: u64,
    task_id: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key).then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of `(priority_key, task_id)` with a wake-up signal for the
/// dispatcher. Entries are never removed eagerly; consumers discard stale
/// entries on pop.
#[derive(Default)]
pub struct ReadyQueue {
    heap: Mutex<BinaryHeap<Reverse<QueueEntry>>>,
    seq: AtomicU64,
    notify: Notify,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the single-rule priority key for a task.
    pub fn priority_key(task: &Task) -> i64 {
        match task.scheduled_at {
            Some(at) if at > Utc::now() => at.timestamp_millis(),
            _ => -(task.priority as i64),
        }
    }

    /// Enqueue a task and wake the dispatcher.
    pub fn push(&self, task: &Task) {
        let entry = QueueEntry {
            key: Self::priority_key(task),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            task_id: task.id.clone(),
        };
        self.heap.lock().expect("ready queue lock poisoned").push(Reverse(entry));
        self.notify.notify_one();
    }

    /// Pop the entry with the smallest key, if any.
    pub fn pop(&self) -> Option<(i64, String)> {
        self.heap
            .lock()
            .expect("ready queue lock poisoned")
            .pop()
            .map(|Reverse(e)| (e.key, e.task_id))
    }

    /// Key of the current head without removing it.
    pub fn peek_key(&self) -> Option<i64> {
        self.heap.lock().expect("ready queue lock poisoned").peek().map(|Reverse(e)| e.key)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("ready queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for a push notification, up to `timeout`. Used by the
    /// dispatcher so scheduled re-enqueues become runnable promptly.
    pub async fn wait(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}
