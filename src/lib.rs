//! # TaskHive
//!
//! A persistent, concurrent task execution and scheduling engine for
//! agent-style systems. The [`AutonomyLoop`] orchestrator wires the
//! execution engine, calendar scheduler, and feedback sink together over
//! a shared storage root and exposes the public surface: task submission
//! and chains, recurring schedules, feedback, and lifecycle control.

pub mod actions;
pub mod autonomy;

pub use autonomy::AutonomyLoop;
pub use taskhive_core::config::{AutonomyLevel, TaskhiveConfig};
pub use taskhive_core::error::{Result, TaskhiveError};
pub use taskhive_core::types::{
    FeedbackEntry, FeedbackKind, FeedbackSource, FeedbackSummary, Schedule, ScheduleKind, Task,
    TaskResult, TaskSpec, TaskStatus,
};
pub use taskhive_engine::{ActionRegistry, ApprovalFn, CompletionFn, ParamSpec, SafetyCheckFn};
pub use taskhive_feedback::{FeedbackFilter, MetricsLogger};
pub use taskhive_scheduler::ScheduleFilter;
