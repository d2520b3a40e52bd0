//! End-to-end scenarios against the full autonomy loop: chains, retries,
//! dependency gating, safety policy, recurring schedules, and persistence
//! across restarts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use taskhive::{
    AutonomyLevel, AutonomyLoop, ParamSpec, Schedule, TaskSpec, TaskStatus, TaskhiveConfig,
};

fn test_config(dir: &Path, level: AutonomyLevel) -> TaskhiveConfig {
    let mut config = TaskhiveConfig {
        storage_dir: Some(dir.display().to_string()),
        ..Default::default()
    };
    config.autonomy.default_level = level;
    config.scheduler.check_interval_secs = 0.1;
    config.feedback.auto_save = false;
    config
}

fn register_echo(core: &AutonomyLoop) {
    core.register_action(
        "echo",
        "Echo the input value",
        vec![("v", ParamSpec::required("Value to echo"))],
        |params| async move { Ok(params.get("v").cloned().unwrap_or(Value::Null)) },
    );
}

#[tokio::test]
async fn linear_chain_completes_with_rollup() {
    let dir = tempfile::tempdir().unwrap();
    let core = AutonomyLoop::new(test_config(dir.path(), AutonomyLevel::Full)).unwrap();
    register_echo(&core);
    core.start();

    let specs: Vec<TaskSpec> = (1..=3)
        .map(|v| TaskSpec::new("echo").with_parameter("v", json!(v)))
        .collect();
    let parent_id = core.create_chain(specs, "triple", "", HashMap::new()).unwrap();

    let result = core
        .wait_for_task(&parent_id, Some(Duration::from_secs(15)))
        .await
        .expect("chain should finish");
    assert!(result.success);
    assert_eq!(
        result.result,
        Some(json!({ "subtasks_completed": 3, "subtasks_failed": 0 }))
    );

    let parent = core.get_task(&parent_id).unwrap();
    assert_eq!(parent.status, TaskStatus::Completed);
    assert_eq!(parent.subtasks.len(), 3);

    let mut children = core.list_tasks(None, Some(&parent_id));
    children.sort_by_key(|t| t.created_at);
    for (i, child) in children.iter().enumerate() {
        assert_eq!(child.status, TaskStatus::Completed);
        assert_eq!(child.result, Some(json!(i as i64 + 1)));
    }
    // Each link starts only after the previous one committed its result
    for pair in children.windows(2) {
        assert!(pair[1].started_at.unwrap() >= pair[0].completed_at.unwrap());
    }

    core.stop(true, Duration::from_secs(3)).await;
}

#[tokio::test]
async fn flaky_action_retries_then_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let core = AutonomyLoop::new(test_config(dir.path(), AutonomyLevel::Full)).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    core.register_action("flaky", "Fails twice then succeeds", vec![], move |_| {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("E".to_string())
            } else {
                Ok(json!("ok"))
            }
        }
    });
    core.start();

    let id = core
        .create_task(TaskSpec::new("flaky").with_max_retries(3).with_retry_delay(0.0))
        .unwrap();
    let result = core
        .wait_for_task(&id, Some(Duration::from_secs(15)))
        .await
        .expect("flaky task should settle");
    assert!(result.success);
    assert_eq!(result.result, Some(json!("ok")));

    let task = core.get_task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    core.stop(true, Duration::from_secs(3)).await;
}

#[tokio::test]
async fn dependent_task_waits_for_scheduled_dependency() {
    let dir = tempfile::tempdir().unwrap();
    let core = AutonomyLoop::new(test_config(dir.path(), AutonomyLevel::Full)).unwrap();
    register_echo(&core);
    core.start();

    let a = core
        .create_task(
            TaskSpec::new("echo")
                .with_parameter("v", json!("a"))
                .with_scheduled_at(Utc::now() + chrono::Duration::seconds(2)),
        )
        .unwrap();
    let b = core
        .create_task(
            TaskSpec::new("echo")
                .with_parameter("v", json!("b"))
                .with_dependencies(vec![a.clone()]),
        )
        .unwrap();

    // Well before A's scheduled time, B must still be pending and unstarted
    tokio::time::sleep(Duration::from_millis(1000)).await;
    let b_task = core.get_task(&b).unwrap();
    assert_eq!(b_task.status, TaskStatus::Pending);
    assert!(b_task.started_at.is_none());

    let result = core
        .wait_for_task(&b, Some(Duration::from_secs(15)))
        .await
        .expect("B should run after A");
    assert!(result.success);

    let a_task = core.get_task(&a).unwrap();
    let b_task = core.get_task(&b).unwrap();
    assert_eq!(a_task.status, TaskStatus::Completed);
    assert!(b_task.started_at.unwrap() >= a_task.completed_at.unwrap());

    core.stop(true, Duration::from_secs(3)).await;
}

#[tokio::test]
async fn restricted_action_fails_safety_check() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), AutonomyLevel::Full);
    config.autonomy.safety.restricted_actions = vec!["dangerous".to_string()];

    let core = AutonomyLoop::new(config).unwrap();
    core.register_action("dangerous", "Should never run", vec![], |_| async {
        Ok(json!("ran anyway"))
    });
    core.start();

    let id = core.create_task(TaskSpec::new("dangerous")).unwrap();
    let result = core
        .wait_for_task(&id, Some(Duration::from_secs(15)))
        .await
        .expect("task should be rejected");
    assert!(!result.success);

    let task = core.get_task(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("Safety check failed"));

    core.stop(true, Duration::from_secs(3)).await;
}

#[tokio::test]
async fn interval_schedule_fires_exactly_max_runs_times() {
    let dir = tempfile::tempdir().unwrap();
    let core = AutonomyLoop::new(test_config(dir.path(), AutonomyLevel::Full)).unwrap();
    register_echo(&core);
    core.start();

    let schedule = Schedule::interval(
        "ticker",
        "echo",
        HashMap::from([("v".to_string(), json!("tick"))]),
        1.0,
    )
    .with_max_runs(3);
    let schedule_id = core.create_schedule(schedule).unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;

    let scheduled_tasks: Vec<_> = core
        .list_tasks(None, None)
        .into_iter()
        .filter(|t| t.metadata.get("scheduled") == Some(&json!(true)))
        .collect();
    assert_eq!(scheduled_tasks.len(), 3);
    for task in &scheduled_tasks {
        assert_eq!(task.metadata.get("schedule_id"), Some(&json!(schedule_id)));
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!("tick")));
    }

    let schedule = core.get_schedule(&schedule_id).unwrap();
    assert_eq!(schedule.run_count, 3);
    assert!(schedule.next_run.is_none());

    core.stop(true, Duration::from_secs(3)).await;
}

#[tokio::test]
async fn scheduled_task_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), AutonomyLevel::Full);
    let scheduled_at = Utc::now() + chrono::Duration::seconds(60);

    let core = AutonomyLoop::new(config.clone()).unwrap();
    register_echo(&core);
    core.start();
    let id = core
        .create_task(
            TaskSpec::new("echo")
                .with_parameter("v", json!(1))
                .with_scheduled_at(scheduled_at),
        )
        .unwrap();
    core.stop(true, Duration::from_secs(3)).await;
    drop(core);

    let core = AutonomyLoop::new(config).unwrap();
    register_echo(&core);
    core.start();

    let task = core.get_task(&id).expect("task survives restart");
    assert_eq!(task.status, TaskStatus::Pending);
    let drift = (task.scheduled_at.unwrap() - scheduled_at).num_milliseconds().abs();
    assert!(drift <= 1, "scheduled_at drifted by {drift}ms");

    core.stop(true, Duration::from_secs(3)).await;
}

#[tokio::test]
async fn completion_feeds_the_feedback_sink() {
    let dir = tempfile::tempdir().unwrap();
    let core = AutonomyLoop::new(test_config(dir.path(), AutonomyLevel::Full)).unwrap();
    register_echo(&core);
    core.start();

    let id = core
        .create_task(TaskSpec::new("echo").with_parameter("v", json!(1)))
        .unwrap();
    core.wait_for_task(&id, Some(Duration::from_secs(15))).await.unwrap();

    let summary = core.get_summary(&id).expect("completion should record feedback");
    assert_eq!(summary.count, 1);
    assert_eq!(summary.positive_count, 1);
    assert_eq!(summary.target_type, "task");

    let metrics = core.metrics().derived();
    assert_eq!(metrics["task_completion"]["count"], json!(1));

    core.stop(true, Duration::from_secs(3)).await;
}

#[tokio::test]
async fn cancel_is_noop_on_terminal_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let core = AutonomyLoop::new(test_config(dir.path(), AutonomyLevel::Full)).unwrap();
    register_echo(&core);
    core.start();

    let id = core
        .create_task(TaskSpec::new("echo").with_parameter("v", json!(1)))
        .unwrap();
    core.wait_for_task(&id, Some(Duration::from_secs(15))).await.unwrap();

    assert!(!core.cancel_task(&id));
    assert_eq!(core.get_task(&id).unwrap().status, TaskStatus::Completed);

    core.stop(true, Duration::from_secs(3)).await;
}
