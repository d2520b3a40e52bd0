//! # TaskHive Scheduler
//!
//! The calendar half of the autonomy core: recurring schedules (once,
//! interval, daily, weekly, monthly, cron) are kept in a min-heap by next
//! fire time; a ticker drains due entries and materializes tasks through
//! an emitter callback.

pub mod cron;
pub mod manager;
pub mod next_run;

pub use manager::{ScheduleFilter, ScheduleManager, TaskEmitter};
pub use next_run::compute_next_run;
