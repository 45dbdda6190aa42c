use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Live variable scope and timers owned by one state-machine instance.
///
/// Exposed to the host for read/write access between calls; never shared
/// concurrently with an in-flight `update`/`trigger`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Seconds since entering the current state.
    #[serde(default)]
    pub state_time: f64,
    /// Seconds since `start()`. Session telemetry, not restorable state.
    #[serde(default)]
    pub total_time: f64,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variables(variables: HashMap<String, Value>) -> Self {
        Self {
            variables,
            ..Self::default()
        }
    }

    /// Resolves a dotted path (`target.position.x`) against the scope,
    /// descending into nested objects.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.variables.get(parts.next()?)?;
        for part in parts {
            match current {
                Value::Object(map) => current = map.get(part)?,
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }
}

/// Deterministic snapshot of an instance, sufficient to fully restore
/// behavior. The only externally durable representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub current_state: String,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub state_time: f64,
}

/// One transition as observed by listeners and the instance history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub from: Option<String>,
    pub to: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// An action with its value already resolved, as handed to the host sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}
