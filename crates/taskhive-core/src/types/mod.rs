//! Core data model: tasks, schedules, and feedback records.

mod feedback;
mod schedule;
mod task;

pub use feedback::{FeedbackEntry, FeedbackKind, FeedbackSource, FeedbackSummary};
pub use schedule::{Schedule, ScheduleKind};
pub use task::{Task, TaskResult, TaskSpec, TaskStatus};
