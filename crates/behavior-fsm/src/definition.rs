use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use behavior_core::{Error, Result};

/// Immutable authored template: states, transitions and default variables.
///
/// This is the wire format authoring tools (e.g. the node-graph editor) hand
/// off to the runtime; field names on the wire are camelCase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMachineDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub initial_state: String,
    pub states: Vec<StateDefinition>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, Value>,
}

impl StateMachineDefinition {
    /// Checks the invariants an instance relies on: at least one state,
    /// unique state ids, and an `initialState` that names one of them.
    /// Transition targets are resolved at transition time, not here.
    pub fn validate(&self) -> Result<()> {
        if self.states.is_empty() {
            return Err(Error::InvalidDefinition(format!(
                "State machine '{}' has no states",
                self.id
            )));
        }
        let mut seen = HashSet::new();
        for state in &self.states {
            if !seen.insert(state.id.as_str()) {
                return Err(Error::InvalidDefinition(format!(
                    "Duplicate state id '{}' in state machine '{}'",
                    state.id, self.id
                )));
            }
        }
        if self.state(&self.initial_state).is_none() {
            return Err(Error::InvalidDefinition(format!(
                "Initial state '{}' not found in state machine '{}'",
                self.initial_state, self.id
            )));
        }
        Ok(())
    }

    pub fn state(&self, id: &str) -> Option<&StateDefinition> {
        self.states.iter().find(|s| s.id == id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Opaque animation tag forwarded to the host; the runtime never
    /// interprets it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_enter: Vec<ActionSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_exit: Vec<ActionSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_update: Vec<ActionSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionSpec>,
}

/// A single outgoing edge. With an `event` it fires on a matching
/// `trigger(event)` call; without one it is scanned on every update tick,
/// gated by `condition` when present. An edge with neither `event` nor
/// `condition` is always satisfied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionSpec {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Higher wins among simultaneously satisfied automatic transitions;
    /// declaration order breaks ties. Not consulted for event transitions.
    #[serde(default)]
    pub priority: i32,
}

impl TransitionSpec {
    pub fn on(event: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            event: Some(event.into()),
            condition: None,
            priority: 0,
        }
    }

    pub fn when(condition: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            event: None,
            condition: Some(condition.into()),
            priority: 0,
        }
    }

    pub fn always(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            event: None,
            condition: None,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A declarative side-effect record. `type` is an open tag (`log`, `set`,
/// `call`, `playSound`, ...) dispatched by the host; the engine only
/// special-cases `set`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ActionValue>,
}

impl ActionSpec {
    pub fn new(kind: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            target: target.into(),
            value: None,
        }
    }

    pub fn set(target: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new("set", target).with_value(value)
    }

    pub fn set_expr(target: impl Into<String>, expr: impl Into<String>) -> Self {
        Self::new("set", target).with_expr(expr)
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(ActionValue::Literal(value.into()));
        self
    }

    pub fn with_expr(mut self, expr: impl Into<String>) -> Self {
        self.value = Some(ActionValue::Expr { expr: expr.into() });
        self
    }
}

/// Either a literal forwarded as-is, or an `{ "$expr": "..." }` wrapper
/// evaluated against the live variable scope at dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionValue {
    Expr {
        #[serde(rename = "$expr")]
        expr: String,
    },
    Literal(Value),
}
