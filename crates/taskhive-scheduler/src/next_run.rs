//! Next-fire computation for every schedule kind.
//!
//! All results are absolute UTC instants. INTERVAL arithmetic is pure
//! timestamp math; DAILY/WEEKLY/MONTHLY build the "first wall-clock match
//! after now" in local time, so they are not DST-stable across the
//! spring/fall transitions — that is the contract.

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, TimeZone, Utc};
use taskhive_core::types::{Schedule, ScheduleKind};

use crate::cron;

/// Compute the next run strictly relevant to `now`, or `None` when the
/// schedule is disabled, exhausted, past its cutoff, or malformed.
pub fn compute_next_run(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !schedule.enabled || schedule.is_exhausted() {
        return None;
    }
    // A one-shot that already fired never comes back
    if schedule.kind == ScheduleKind::Once && schedule.run_count > 0 {
        return None;
    }
    // First fire waits for start_time
    if let Some(start) = schedule.start_time
        && now < start
    {
        return bounded(schedule, Some(start));
    }
    // Past the cutoff: no more runs
    if let Some(end) = schedule.end_time
        && now >= end
    {
        return None;
    }

    let next = match schedule.kind {
        ScheduleKind::Once => schedule.start_time,
        ScheduleKind::Interval => next_interval(schedule, now),
        ScheduleKind::Daily => next_daily(schedule, now),
        ScheduleKind::Weekly => next_weekly(schedule, now),
        ScheduleKind::Monthly => next_monthly(schedule, now),
        ScheduleKind::Cron => match schedule.cron_expression.as_deref() {
            Some(expression) => cron::next_after(expression, now),
            None => {
                tracing::warn!("Cron expression not specified for schedule {}", schedule.id);
                None
            }
        },
    };
    bounded(schedule, next)
}

fn bounded(schedule: &Schedule, next: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    let next = next?;
    if let Some(end) = schedule.end_time
        && next > end
    {
        return None;
    }
    Some(next)
}

fn next_interval(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let Some(interval) = schedule.interval_secs else {
        tracing::warn!("Interval not specified for schedule {}", schedule.id);
        return None;
    };
    match schedule.last_run {
        None => Some(now),
        Some(last) => Some(last + Duration::milliseconds((interval * 1000.0) as i64)),
    }
}

/// Resolve a local wall-clock instant to UTC. Ambiguous times (fall-back)
/// take the earlier mapping; nonexistent times (spring-forward gap) yield
/// `None`.
fn local_at(date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(hour, minute, 0)?;
    Local.from_local_datetime(&naive).earliest().map(|dt| dt.with_timezone(&Utc))
}

fn next_daily(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let Some((hour, minute)) = schedule.parse_time_of_day() else {
        tracing::warn!("Invalid time of day for schedule {}", schedule.id);
        return None;
    };
    let today = now.with_timezone(&Local).date_naive();
    // Today if the time is still ahead, else tomorrow (one extra day
    // absorbs a DST gap)
    for offset in 0..=2 {
        if let Some(candidate) = local_at(today + Duration::days(offset), hour, minute)
            && candidate > now
        {
            return Some(candidate);
        }
    }
    None
}

fn next_weekly(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if schedule.days.is_empty() {
        tracing::warn!("Days not specified for schedule {}", schedule.id);
        return None;
    }
    if schedule.days.iter().any(|d| *d > 6) {
        tracing::warn!("Invalid weekday list for schedule {}", schedule.id);
        return None;
    }
    let Some((hour, minute)) = schedule.parse_time_of_day() else {
        tracing::warn!("Invalid time of day for schedule {}", schedule.id);
        return None;
    };

    let now_local = now.with_timezone(&Local);
    let today = now_local.date_naive();
    let current = now_local.weekday().num_days_from_monday() as i64;

    let mut days: Vec<i64> = schedule.days.iter().map(|d| *d as i64).collect();
    days.sort_unstable();
    days.dedup();

    // Today counts only while the fire time is still strictly ahead;
    // otherwise the next listed weekday, wrapping to next week's earliest
    let mut days_until: Option<i64> = None;
    for &day in &days {
        if day == current {
            if let Some(candidate) = local_at(today, hour, minute)
                && candidate > now
            {
                days_until = Some(0);
                break;
            }
        } else if day > current {
            days_until = Some(day - current);
            break;
        }
    }
    let days_until = days_until.unwrap_or(7 - current + days[0]);

    let date = today + Duration::days(days_until);
    match local_at(date, hour, minute) {
        Some(candidate) if candidate > now => Some(candidate),
        _ => local_at(date + Duration::days(7), hour, minute),
    }
}

fn next_monthly(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let Some(&day_of_month) = schedule.days.first() else {
        tracing::warn!("Day of month not specified for schedule {}", schedule.id);
        return None;
    };
    if day_of_month == 0 || day_of_month > 31 {
        tracing::warn!("Invalid day of month for schedule {}", schedule.id);
        return None;
    }
    let Some((hour, minute)) = schedule.parse_time_of_day() else {
        tracing::warn!("Invalid time of day for schedule {}", schedule.id);
        return None;
    };

    let now_local = now.with_timezone(&Local);
    let (year, month) = (now_local.year(), now_local.month());

    // Exact day in the current month, if it exists and is still ahead
    if let Some(date) = NaiveDate::from_ymd_opt(year, month, day_of_month)
        && let Some(candidate) = local_at(date, hour, minute)
        && candidate > now
    {
        return Some(candidate);
    }

    // Roll to the next month, clamping to that month's length
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let day = day_of_month.min(last_day_of_month(next_year, next_month));
    NaiveDate::from_ymd_opt(next_year, next_month, day)
        .and_then(|date| local_at(date, hour, minute))
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .map(|first| (first - Duration::days(1)).day())
        .unwrap_or(28)
}
