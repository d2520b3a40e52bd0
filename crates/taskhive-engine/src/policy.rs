//! Policy gate — safety checks and approval per autonomy level.
//!
//! Every task runs through the safety-check chain before approval is
//! considered. The built-in first check rejects restricted actions; user
//! checks run in registration order and the first not-ok result vetoes the
//! task. Approval then depends on the configured autonomy level.

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use taskhive_core::config::{AutonomyConfig, AutonomyLevel};
use taskhive_core::types::Task;

/// Approval callback: `(task) → approved`. Must be side-effect-free with
/// respect to core state; a panic is treated as disapproval.
pub type ApprovalFn = Arc<dyn Fn(&Task) -> bool + Send + Sync>;

/// Safety check: `(task) → (ok, reason)`. A panic is treated as
/// `(false, "check error: …")`.
pub type SafetyCheckFn = Arc<dyn Fn(&Task) -> (bool, String) + Send + Sync>;

/// Governs whether a task is allowed to run.
pub struct PolicyGate {
    level: AutonomyLevel,
    approve_new: bool,
    approve_modified: bool,
    approve_high_risk: bool,
    safety_enabled: bool,
    restricted_actions: HashSet<String>,
    high_risk_actions: HashSet<String>,
    checks: Mutex<Vec<SafetyCheckFn>>,
    approval: Mutex<Option<ApprovalFn>>,
}

impl PolicyGate {
    pub fn new(config: &AutonomyConfig) -> Self {
        Self::with_level(config, config.default_level)
    }

    /// Build a gate with an explicit level override.
    pub fn with_level(config: &AutonomyConfig, level: AutonomyLevel) -> Self {
        Self {
            level,
            approve_new: config.require_approval.new_tasks,
            approve_modified: config.require_approval.modified_tasks,
            approve_high_risk: config.require_approval.high_risk,
            safety_enabled: config.safety.enable_safety_checks,
            restricted_actions: config.safety.restricted_actions.iter().cloned().collect(),
            high_risk_actions: config.safety.high_risk_actions.iter().cloned().collect(),
            checks: Mutex::new(Vec::new()),
            approval: Mutex::new(None),
        }
    }

    pub fn level(&self) -> AutonomyLevel {
        self.level
    }

    pub fn set_approval_callback(&self, callback: ApprovalFn) {
        *self.approval.lock().expect("policy lock poisoned") = Some(callback);
    }

    pub fn add_safety_check(&self, check: SafetyCheckFn) {
        self.checks.lock().expect("policy lock poisoned").push(check);
    }

    /// Run the safety-check chain. Returns the first veto, if any.
    pub fn check_safety(&self, task: &Task) -> (bool, String) {
        if !self.safety_enabled {
            return (true, "safety checks disabled".to_string());
        }

        if self.restricted_actions.contains(&task.action) {
            return (false, format!("action '{}' is restricted", task.action));
        }

        let checks = self.checks.lock().expect("policy lock poisoned").clone();
        for check in checks {
            let outcome = catch_unwind(AssertUnwindSafe(|| check(task)));
            match outcome {
                Ok((true, _)) => {}
                Ok((false, reason)) => return (false, reason),
                Err(payload) => {
                    let message = panic_message(&payload);
                    tracing::error!("Safety check panicked for task {}: {message}", task.id);
                    return (false, format!("check error: {message}"));
                }
            }
        }

        (true, "all safety checks passed".to_string())
    }

    /// High risk: action in the configured set, or metadata carries
    /// `is_high_risk = true`.
    pub fn is_high_risk(&self, task: &Task) -> bool {
        if self.high_risk_actions.contains(&task.action) {
            return true;
        }
        metadata_flag(&task.metadata, "is_high_risk")
    }

    /// Decide approval for a task per the configured autonomy level.
    pub fn approve(&self, task: &Task) -> bool {
        match self.level {
            AutonomyLevel::Disabled => {
                tracing::info!("Rejecting task '{}' (autonomy disabled)", task.name);
                false
            }
            AutonomyLevel::Full => true,
            AutonomyLevel::Assisted => match self.approval_callback() {
                Some(callback) => self.invoke_approval(&callback, task),
                None => {
                    tracing::info!("Rejecting task '{}' (assisted, no approver)", task.name);
                    false
                }
            },
            AutonomyLevel::Supervised => {
                let needs_approval = (self.approve_new
                    && metadata_flag(&task.metadata, "is_new"))
                    || (self.approve_modified && metadata_flag(&task.metadata, "is_modified"))
                    || (self.approve_high_risk && self.is_high_risk(task));
                if !needs_approval {
                    return true;
                }
                match self.approval_callback() {
                    Some(callback) => self.invoke_approval(&callback, task),
                    // Missing callback defaults to approve under supervision
                    None => true,
                }
            }
        }
    }

    fn approval_callback(&self) -> Option<ApprovalFn> {
        self.approval.lock().expect("policy lock poisoned").clone()
    }

    fn invoke_approval(&self, callback: &ApprovalFn, task: &Task) -> bool {
        match catch_unwind(AssertUnwindSafe(|| callback(task))) {
            Ok(approved) => approved,
            Err(payload) => {
                tracing::error!(
                    "Approval callback panicked for task {}: {}",
                    task.id,
                    panic_message(&payload)
                );
                false
            }
        }
    }
}

fn metadata_flag(metadata: &HashMap<String, Value>, key: &str) -> bool {
    metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
