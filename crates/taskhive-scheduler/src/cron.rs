//! Thin adapter over the `cron` crate for standard 5-field expressions.
//!
//! The parser wants a seconds field, so 5-field expressions get a `0`
//! prepended. Evaluation is in UTC.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use ::cron::Schedule as CronSchedule;
use taskhive_core::error::{Result, TaskhiveError};

/// Parse and validate a cron expression (5 fields, or 6/7 with seconds).
pub fn parse(expression: &str) -> Result<CronSchedule> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 { format!("0 {expression}") } else { expression.to_string() };
    CronSchedule::from_str(&normalized).map_err(|e| {
        TaskhiveError::invalid_argument(format!("invalid cron expression '{expression}': {e}"))
    })
}

/// Next firing time strictly after `now`, or `None` when the expression is
/// malformed or has no future occurrence.
pub fn next_after(expression: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match parse(expression) {
        Ok(schedule) => schedule.after(&now).next(),
        Err(e) => {
            tracing::warn!("{e}");
            None
        }
    }
}
