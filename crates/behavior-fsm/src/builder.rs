use std::collections::HashMap;

use serde_json::Value;

use crate::definition::{ActionSpec, StateDefinition, StateMachineDefinition, TransitionSpec};

/// Fluent compiler for [`StateMachineDefinition`]s, for authoring in code
/// without hand-built nested literals.
///
/// If [`initial_state`](Self::initial_state) is never called, the first
/// [`state`](Self::state) opened becomes the initial state (first wins).
/// `build` does not validate; invariants are checked when an instance is
/// constructed.
pub struct StateMachineBuilder {
    id: String,
    name: String,
    initial: Option<String>,
    first_state: Option<String>,
    variables: HashMap<String, Value>,
    states: Vec<StateDefinition>,
}

impl StateMachineBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            initial: None,
            first_state: None,
            variables: HashMap::new(),
            states: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn initial_state(mut self, id: impl Into<String>) -> Self {
        self.initial = Some(id.into());
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Opens a nested state builder; close it with [`StateBuilder::end`].
    pub fn state(mut self, id: impl Into<String>) -> StateBuilder {
        let id = id.into();
        if self.first_state.is_none() {
            self.first_state = Some(id.clone());
        }
        StateBuilder {
            parent: self,
            state: StateDefinition {
                id,
                ..Default::default()
            },
        }
    }

    pub fn build(self) -> StateMachineDefinition {
        let initial_state = self
            .initial
            .or(self.first_state)
            .unwrap_or_default();
        StateMachineDefinition {
            id: self.id,
            name: self.name,
            initial_state,
            states: self.states,
            variables: self.variables,
        }
    }
}

/// Builder for one state, returned by [`StateMachineBuilder::state`].
pub struct StateBuilder {
    parent: StateMachineBuilder,
    state: StateDefinition,
}

impl StateBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.state.name = name.into();
        self
    }

    pub fn animation(mut self, tag: impl Into<String>) -> Self {
        self.state.animation = Some(tag.into());
        self
    }

    pub fn on_enter(mut self, action: ActionSpec) -> Self {
        self.state.on_enter.push(action);
        self
    }

    pub fn on_exit(mut self, action: ActionSpec) -> Self {
        self.state.on_exit.push(action);
        self
    }

    pub fn on_update(mut self, action: ActionSpec) -> Self {
        self.state.on_update.push(action);
        self
    }

    /// Event-driven edge; event transitions are matched in declaration
    /// order, so priority is irrelevant here.
    pub fn transition_on(mut self, event: impl Into<String>, target: impl Into<String>) -> Self {
        self.state.transitions.push(TransitionSpec::on(event, target));
        self
    }

    /// Condition-gated automatic edge, scanned every update tick.
    pub fn transition_when(
        mut self,
        condition: impl Into<String>,
        target: impl Into<String>,
        priority: i32,
    ) -> Self {
        self.state
            .transitions
            .push(TransitionSpec::when(condition, target).with_priority(priority));
        self
    }

    /// Guard-less automatic edge, satisfied on every tick.
    pub fn transition_always(mut self, target: impl Into<String>) -> Self {
        self.state.transitions.push(TransitionSpec::always(target));
        self
    }

    pub fn transition(mut self, transition: TransitionSpec) -> Self {
        self.state.transitions.push(transition);
        self
    }

    /// Closes the state and returns to the machine builder.
    pub fn end(mut self) -> StateMachineBuilder {
        self.parent.states.push(self.state);
        self.parent
    }
}
