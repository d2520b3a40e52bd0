//! Metrics aggregator — counters and rolling samples for quality and
//! performance signals.
//!
//! Raw counters accumulate per category; derived percentages are computed
//! on read. Performance samples are bounded arrays so a long-lived process
//! keeps a recent window rather than unbounded history. Each observation
//! also lands in the feedback sink as a METRIC-source entry when a sink is
//! attached. The snapshot file is write-only: it is never read back.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use taskhive_core::error::Result;
use taskhive_core::types::{FeedbackEntry, FeedbackKind, FeedbackSource};

use crate::manager::FeedbackManager;

/// Cap on each rolling sample array.
const SAMPLE_CAP: usize = 1000;

#[derive(Debug, Default, Clone, Serialize)]
struct ResponseQualityStats {
    count: u64,
    sum: f64,
    high_quality_count: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
struct HallucinationStats {
    count: u64,
    detected_count: u64,
    severity_sum: f64,
}

#[derive(Debug, Default, Clone, Serialize)]
struct ReasoningQualityStats {
    count: u64,
    sum: f64,
    high_quality_count: u64,
    invalid_steps_count: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
struct ToolUsageStats {
    count: u64,
    appropriate_count: u64,
    successful_count: u64,
    failed_count: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
struct TaskCompletionStats {
    count: u64,
    successful_count: u64,
    failed_count: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
struct PerformanceStats {
    response_times: Vec<f64>,
    token_counts: Vec<u64>,
    memory_usage: Vec<f64>,
}

#[derive(Debug, Default, Clone, Serialize)]
struct Metrics {
    response_quality: ResponseQualityStats,
    hallucination: HallucinationStats,
    reasoning_quality: ReasoningQualityStats,
    tool_usage: ToolUsageStats,
    task_completion: TaskCompletionStats,
    performance: PerformanceStats,
}

fn push_bounded<T>(samples: &mut Vec<T>, value: T) {
    if samples.len() >= SAMPLE_CAP {
        samples.remove(0);
    }
    samples.push(value);
}

fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}

/// Automated quality and performance metrics tracker.
pub struct MetricsLogger {
    metrics: Mutex<Metrics>,
    storage_dir: Option<PathBuf>,
    feedback: Option<Arc<FeedbackManager>>,
}

impl MetricsLogger {
    pub fn new(storage_dir: Option<PathBuf>, feedback: Option<Arc<FeedbackManager>>) -> Result<Self> {
        if let Some(dir) = &storage_dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self { metrics: Mutex::new(Metrics::default()), storage_dir, feedback })
    }

    fn record(&self, entry: FeedbackEntry) {
        if let Some(feedback) = &self.feedback {
            feedback.add(entry.with_source(FeedbackSource::Metric));
        }
    }

    pub fn log_response_quality(&self, score: f64, is_high_quality: bool, target_id: Option<&str>) {
        {
            let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
            let stats = &mut metrics.response_quality;
            stats.count += 1;
            stats.sum += score;
            if is_high_quality {
                stats.high_quality_count += 1;
            }
        }
        let mut entry = FeedbackEntry::new(FeedbackKind::Rating, json!(score));
        if let Some(target) = target_id {
            entry = entry.with_target(target, "response");
        }
        self.record(entry);
    }

    pub fn log_hallucination(&self, detected: bool, severity: f64, target_id: Option<&str>) {
        {
            let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
            let stats = &mut metrics.hallucination;
            stats.count += 1;
            if detected {
                stats.detected_count += 1;
                stats.severity_sum += severity;
            }
        }
        let mut entry = FeedbackEntry::new(
            FeedbackKind::Comment,
            json!({ "hallucination_detected": detected, "severity": severity }),
        );
        if let Some(target) = target_id {
            entry = entry.with_target(target, "response");
        }
        self.record(entry);
    }

    pub fn log_reasoning_quality(
        &self,
        score: f64,
        is_high_quality: bool,
        has_invalid_steps: bool,
        target_id: Option<&str>,
    ) {
        {
            let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
            let stats = &mut metrics.reasoning_quality;
            stats.count += 1;
            stats.sum += score;
            if is_high_quality {
                stats.high_quality_count += 1;
            }
            if has_invalid_steps {
                stats.invalid_steps_count += 1;
            }
        }
        let mut entry = FeedbackEntry::new(FeedbackKind::Rating, json!(score));
        if let Some(target) = target_id {
            entry = entry.with_target(target, "reasoning");
        }
        self.record(entry);
    }

    pub fn log_tool_usage(
        &self,
        tool: &str,
        was_appropriate: bool,
        succeeded: bool,
        target_id: Option<&str>,
    ) {
        {
            let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
            let stats = &mut metrics.tool_usage;
            stats.count += 1;
            if was_appropriate {
                stats.appropriate_count += 1;
                if succeeded {
                    stats.successful_count += 1;
                } else {
                    stats.failed_count += 1;
                }
            }
        }
        let mut entry = FeedbackEntry::new(
            FeedbackKind::Comment,
            json!({ "tool": tool, "appropriate": was_appropriate, "success": succeeded }),
        );
        if let Some(target) = target_id {
            entry = entry.with_target(target, "tool");
        }
        self.record(entry);
    }

    pub fn log_task_completion(&self, succeeded: bool, target_id: Option<&str>) {
        {
            let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
            let stats = &mut metrics.task_completion;
            stats.count += 1;
            if succeeded {
                stats.successful_count += 1;
            } else {
                stats.failed_count += 1;
            }
        }
        let kind = if succeeded { FeedbackKind::Like } else { FeedbackKind::Dislike };
        let mut entry = FeedbackEntry::new(kind, json!(succeeded));
        if let Some(target) = target_id {
            entry = entry.with_target(target, "task");
        }
        self.record(entry);
    }

    pub fn log_performance(
        &self,
        response_time_secs: f64,
        token_count: Option<u64>,
        memory_mb: Option<f64>,
    ) {
        let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
        let stats = &mut metrics.performance;
        push_bounded(&mut stats.response_times, response_time_secs);
        if let Some(tokens) = token_count {
            push_bounded(&mut stats.token_counts, tokens);
        }
        if let Some(memory) = memory_mb {
            push_bounded(&mut stats.memory_usage, memory);
        }
    }

    /// Derived metrics: averages and percentages computed from the raw
    /// counters. Categories with no observations come back as empty
    /// objects.
    pub fn derived(&self) -> Value {
        let metrics = self.metrics.lock().expect("metrics lock poisoned");
        let mut out = json!({
            "timestamp": Utc::now().timestamp(),
            "response_quality": {},
            "hallucination": {},
            "reasoning_quality": {},
            "tool_usage": {},
            "task_completion": {},
            "performance": {},
        });

        let rq = &metrics.response_quality;
        if rq.count > 0 {
            out["response_quality"] = json!({
                "count": rq.count,
                "average_score": rq.sum / rq.count as f64,
                "high_quality_percentage": rq.high_quality_count as f64 / rq.count as f64 * 100.0,
            });
        }

        let h = &metrics.hallucination;
        if h.count > 0 {
            out["hallucination"] = json!({
                "count": h.count,
                "detection_rate": h.detected_count as f64 / h.count as f64 * 100.0,
                "average_severity": h.severity_sum / (h.detected_count.max(1)) as f64,
            });
        }

        let r = &metrics.reasoning_quality;
        if r.count > 0 {
            out["reasoning_quality"] = json!({
                "count": r.count,
                "average_score": r.sum / r.count as f64,
                "high_quality_percentage": r.high_quality_count as f64 / r.count as f64 * 100.0,
                "invalid_steps_rate": r.invalid_steps_count as f64 / r.count as f64 * 100.0,
            });
        }

        let t = &metrics.tool_usage;
        if t.count > 0 {
            out["tool_usage"] = json!({
                "count": t.count,
                "appropriate_usage_rate": t.appropriate_count as f64 / t.count as f64 * 100.0,
                "success_rate": t.successful_count as f64 / (t.appropriate_count.max(1)) as f64 * 100.0,
                "failure_rate": t.failed_count as f64 / (t.appropriate_count.max(1)) as f64 * 100.0,
            });
        }

        let tc = &metrics.task_completion;
        if tc.count > 0 {
            out["task_completion"] = json!({
                "count": tc.count,
                "success_rate": tc.successful_count as f64 / tc.count as f64 * 100.0,
                "failure_rate": tc.failed_count as f64 / tc.count as f64 * 100.0,
            });
        }

        let p = &metrics.performance;
        if !p.response_times.is_empty() {
            let token_samples: Vec<f64> = p.token_counts.iter().map(|t| *t as f64).collect();
            out["performance"] = json!({
                "average_response_time": mean(&p.response_times),
                "average_token_count": mean(&token_samples),
                "average_memory_usage": mean(&p.memory_usage),
            });
        }

        out
    }

    /// Write the derived snapshot to `metrics.json`.
    pub fn save(&self) -> Result<()> {
        let Some(dir) = &self.storage_dir else { return Ok(()) };
        let path = dir.join("metrics.json");
        let tmp = dir.join("metrics.json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.derived())?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn persist(&self) {
        if let Err(e) = self.save() {
            tracing::warn!("Failed to save metrics: {e}");
        }
    }

    pub fn clear(&self) {
        *self.metrics.lock().expect("metrics lock poisoned") = Metrics::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn logger() -> MetricsLogger {
        MetricsLogger::new(None, None).unwrap()
    }

    #[test]
    fn test_empty_derived_metrics() {
        let metrics = logger().derived();
        assert_eq!(metrics["response_quality"], json!({}));
        assert_eq!(metrics["task_completion"], json!({}));
        assert!(metrics["timestamp"].is_i64());
    }

    #[test]
    fn test_response_quality_aggregation() {
        let logger = logger();
        logger.log_response_quality(0.9, true, None);
        logger.log_response_quality(0.5, false, None);

        let derived = logger.derived();
        let rq = &derived["response_quality"];
        assert_eq!(rq["count"], json!(2));
        assert!((rq["average_score"].as_f64().unwrap() - 0.7).abs() < 1e-9);
        assert!((rq["high_quality_percentage"].as_f64().unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_task_completion_rates() {
        let logger = logger();
        logger.log_task_completion(true, Some("t1"));
        logger.log_task_completion(true, None);
        logger.log_task_completion(false, None);

        let derived = logger.derived();
        let tc = &derived["task_completion"];
        assert_eq!(tc["count"], json!(3));
        assert!((tc["success_rate"].as_f64().unwrap() - 200.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_hallucination_severity_only_counts_detected() {
        let logger = logger();
        logger.log_hallucination(true, 0.8, None);
        logger.log_hallucination(false, 0.0, None);

        let derived = logger.derived();
        let h = &derived["hallucination"];
        assert_eq!(h["detection_rate"], json!(50.0));
        assert!((h["average_severity"].as_f64().unwrap() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_tool_usage_rates() {
        let logger = logger();
        logger.log_tool_usage("search", true, true, None);
        logger.log_tool_usage("search", true, false, None);
        logger.log_tool_usage("search", false, false, None);

        let derived = logger.derived();
        let t = &derived["tool_usage"];
        assert_eq!(t["count"], json!(3));
        assert!((t["appropriate_usage_rate"].as_f64().unwrap() - 200.0 / 3.0).abs() < 1e-6);
        assert!((t["success_rate"].as_f64().unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_performance_samples_bounded() {
        let logger = logger();
        for i in 0..(SAMPLE_CAP + 100) {
            logger.log_performance(i as f64, Some(10), None);
        }
        let metrics = logger.metrics.lock().unwrap();
        assert_eq!(metrics.performance.response_times.len(), SAMPLE_CAP);
        assert_eq!(metrics.performance.token_counts.len(), SAMPLE_CAP);
        // Oldest samples were evicted
        assert_eq!(metrics.performance.response_times[0], 100.0);
    }

    #[test]
    fn test_metric_entries_reach_feedback_sink() {
        let feedback =
            Arc::new(FeedbackManager::new(None, false, Duration::from_secs(60)).unwrap());
        let logger = MetricsLogger::new(None, Some(Arc::clone(&feedback))).unwrap();
        logger.log_task_completion(true, Some("task-1"));
        logger.log_response_quality(0.9, true, Some("resp-1"));

        assert_eq!(feedback.count(), 2);
        let summary = feedback.summary("task-1").unwrap();
        assert_eq!(summary.positive_count, 1);
        let entries = feedback.for_target("resp-1");
        assert_eq!(entries[0].source, FeedbackSource::Metric);
    }

    #[test]
    fn test_save_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let logger = MetricsLogger::new(Some(dir.path().to_path_buf()), None).unwrap();
        logger.log_task_completion(true, None);
        logger.save().unwrap();

        let text = std::fs::read_to_string(dir.path().join("metrics.json")).unwrap();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["task_completion"]["count"], json!(1));
    }

    #[test]
    fn test_clear() {
        let logger = logger();
        logger.log_task_completion(true, None);
        logger.clear();
        assert_eq!(logger.derived()["task_completion"], json!({}));
    }
}
