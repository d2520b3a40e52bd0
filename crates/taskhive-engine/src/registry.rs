//! Action registry — name → async callable binding with parameter metadata.
//!
//! Actions are opaque handles bound to a declared parameter schema;
//! submission-time dispatch validates against the schema instead of
//! reflecting on signatures. Registration is idempotent by name (last
//! writer wins).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde_json::Value;
use taskhive_core::error::{Result, TaskhiveError};

/// Outcome of one action invocation. The error string is captured onto the
/// task record and drives retry handling.
pub type ActionOutcome = std::result::Result<Value, String>;

/// An invocable action handler taking keyword parameters.
pub type ActionFn =
    Arc<dyn Fn(HashMap<String, Value>) -> BoxFuture<'static, ActionOutcome> + Send + Sync>;

/// Declared metadata for one action parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub description: String,
    pub required: bool,
}

impl ParamSpec {
    pub fn required(description: &str) -> Self {
        Self { description: description.to_string(), required: true }
    }

    pub fn optional(description: &str) -> Self {
        Self { description: description.to_string(), required: false }
    }
}

/// A registered action: handler plus human description and parameter schema.
#[derive(Clone)]
pub struct RegisteredAction {
    pub handler: ActionFn,
    pub description: String,
    pub params: BTreeMap<String, ParamSpec>,
}

/// Summary of a registered action, for listings.
#[derive(Debug, Clone)]
pub struct ActionInfo {
    pub name: String,
    pub description: String,
    pub params: BTreeMap<String, String>,
}

/// Registry of available actions.
#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, RegisteredAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action. Re-registering a name replaces the previous
    /// binding.
    pub fn register<F, Fut>(
        &self,
        name: &str,
        description: &str,
        params: Vec<(&str, ParamSpec)>,
        handler: F,
    ) where
        F: Fn(HashMap<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ActionOutcome> + Send + 'static,
    {
        let handler: ActionFn = Arc::new(move |params| Box::pin(handler(params)));
        self.register_fn(name, description, params, handler);
    }

    /// Register a pre-built handler.
    pub fn register_fn(
        &self,
        name: &str,
        description: &str,
        params: Vec<(&str, ParamSpec)>,
        handler: ActionFn,
    ) {
        let action = RegisteredAction {
            handler,
            description: description.to_string(),
            params: params.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        };
        self.actions
            .write()
            .expect("action registry lock poisoned")
            .insert(name.to_string(), action);
        tracing::debug!("Registered action: {name}");
    }

    /// Get an action by name.
    pub fn get(&self, name: &str) -> Option<RegisteredAction> {
        self.actions.read().expect("action registry lock poisoned").get(name).cloned()
    }

    /// Check if an action is registered.
    pub fn has(&self, name: &str) -> bool {
        self.actions.read().expect("action registry lock poisoned").contains_key(name)
    }

    /// List all registered actions with descriptions and parameter schemas.
    pub fn list(&self) -> Vec<ActionInfo> {
        let actions = self.actions.read().expect("action registry lock poisoned");
        let mut infos: Vec<ActionInfo> = actions
            .iter()
            .map(|(name, action)| ActionInfo {
                name: name.clone(),
                description: action.description.clone(),
                params: action
                    .params
                    .iter()
                    .map(|(k, v)| (k.clone(), v.description.clone()))
                    .collect(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Validate a submission's parameters against the declared schema.
    /// Unknown actions, unknown parameter names, and missing required
    /// parameters are all rejected.
    pub fn validate(&self, action: &str, parameters: &HashMap<String, Value>) -> Result<()> {
        let actions = self.actions.read().expect("action registry lock poisoned");
        let registered = actions
            .get(action)
            .ok_or_else(|| TaskhiveError::UnknownAction(action.to_string()))?;

        for key in parameters.keys() {
            if !registered.params.contains_key(key) {
                return Err(TaskhiveError::invalid_argument(format!(
                    "unknown parameter '{key}' for action '{action}'"
                )));
            }
        }
        for (key, spec) in &registered.params {
            if spec.required && !parameters.contains_key(key) {
                return Err(TaskhiveError::invalid_argument(format!(
                    "missing required parameter '{key}' for action '{action}'"
                )));
            }
        }
        Ok(())
    }
}
