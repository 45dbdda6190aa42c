use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use behavior_core::{
    ActionRecord, ActionSink, Error, ExecutionContext, Result, StateChange, StateChangeListener,
    StateSnapshot,
};

use crate::definition::{ActionSpec, ActionValue, StateDefinition, StateMachineDefinition};
use crate::expr::{Evaluator, truthy};

/// One live execution of a [`StateMachineDefinition`].
///
/// An instance is Uninitialized until [`start`](Self::start) enters the
/// initial state; from then on it runs until dropped. All mutation goes
/// through `&mut self` methods — the caller owns call sequencing, and
/// overlapping `update`/`trigger` on one instance is not defended against.
pub struct StateMachineInstance {
    id: String,
    definition: Arc<StateMachineDefinition>,
    context: ExecutionContext,
    current: Option<String>,
    previous: Option<String>,
    evaluator: Arc<Evaluator>,
    sink: Option<Arc<dyn ActionSink>>,
    listener: Option<Arc<dyn StateChangeListener>>,
    history: Vec<StateChange>,
}

impl StateMachineInstance {
    /// Validates the definition and seeds the variable scope from its
    /// defaults. The instance stays Uninitialized until `start`.
    pub fn new(definition: Arc<StateMachineDefinition>) -> Result<Self> {
        definition.validate()?;
        let context = ExecutionContext::with_variables(definition.variables.clone());
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            definition,
            context,
            current: None,
            previous: None,
            evaluator: Arc::new(Evaluator::new()),
            sink: None,
            listener: None,
            history: Vec::new(),
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Overrides seeded variables with explicit initial data, key by key.
    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.context.variables.extend(variables);
        self
    }

    pub fn with_action_sink(mut self, sink: Arc<dyn ActionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_state_listener(mut self, listener: Arc<dyn StateChangeListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn set_action_sink(&mut self, sink: Arc<dyn ActionSink>) {
        self.sink = Some(sink);
    }

    pub fn set_state_listener(&mut self, listener: Arc<dyn StateChangeListener>) {
        self.listener = Some(listener);
    }

    pub fn set_evaluator(&mut self, evaluator: Arc<Evaluator>) {
        self.evaluator = evaluator;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn definition(&self) -> &Arc<StateMachineDefinition> {
        &self.definition
    }

    pub fn current_state_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn current_state(&self) -> Option<&StateDefinition> {
        self.definition.state(self.current.as_deref()?)
    }

    pub fn previous_state_id(&self) -> Option<&str> {
        self.previous.as_deref()
    }

    pub fn previous_state(&self) -> Option<&StateDefinition> {
        self.definition.state(self.previous.as_deref()?)
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ExecutionContext {
        &mut self.context
    }

    /// Transitions observed so far, oldest first. Telemetry — never part of
    /// a snapshot.
    pub fn history(&self) -> &[StateChange] {
        &self.history
    }

    /// Enters the initial state: resets both timers, clears the previous
    /// state, notifies the listener (with no `from` state) and runs the
    /// initial state's `onEnter` actions.
    ///
    /// Calling `start` twice re-enters the initial state without running
    /// `onExit` of the current one; callers own that invariant. Variables
    /// are seeded at construction and left untouched here.
    pub async fn start(&mut self) -> Result<()> {
        let definition = self.definition.clone();
        let initial = definition
            .state(&definition.initial_state)
            .ok_or_else(|| Error::InvalidDefinition(definition.initial_state.clone()))?;

        self.context.state_time = 0.0;
        self.context.total_time = 0.0;
        self.previous = None;
        self.current = Some(initial.id.clone());
        self.record_change(None, initial.id.clone(), "start".into());
        tracing::debug!(instance = %self.id, state = %initial.id, "State machine started");
        self.run_actions(&initial.on_enter).await
    }

    /// Advances the timers, runs the current state's `onUpdate` actions and
    /// then scans automatic transitions: among satisfied candidates the
    /// highest priority wins, earliest-declared on ties.
    pub async fn update(&mut self, dt: f64) -> Result<()> {
        let current_id = self.current.clone().ok_or(Error::NotStarted)?;
        let definition = self.definition.clone();
        let state = definition
            .state(&current_id)
            .ok_or_else(|| Error::UnknownState(current_id))?;

        self.context.state_time += dt;
        self.context.total_time += dt;
        self.run_actions(&state.on_update).await?;

        let mut winner = None;
        for transition in &state.transitions {
            if transition.event.is_some() {
                continue;
            }
            let satisfied = match &transition.condition {
                None => true,
                Some(condition) => {
                    match self.evaluator.evaluate(condition, &self.context) {
                        Ok(value) => truthy(&value),
                        Err(err) => {
                            tracing::warn!(
                                instance = %self.id,
                                condition = %condition,
                                error = %err,
                                "Condition evaluation failed, treating as false"
                            );
                            false
                        }
                    }
                }
            };
            if !satisfied {
                continue;
            }
            match winner {
                None => winner = Some(transition),
                Some(best) if transition.priority > best.priority => winner = Some(transition),
                Some(_) => {}
            }
        }

        if let Some(transition) = winner {
            let reason = match &transition.condition {
                Some(condition) => format!("condition: {}", condition),
                None => "always".to_string(),
            };
            self.perform_transition(&transition.target, reason).await?;
        }
        Ok(())
    }

    /// Fires the first transition (in declaration order) of the current
    /// state whose `event` matches. Event transitions are not subject to
    /// priority arbitration. Returns `false`, leaving the state unchanged,
    /// when nothing matches.
    pub async fn trigger(&mut self, event: &str) -> Result<bool> {
        let current_id = self.current.clone().ok_or(Error::NotStarted)?;
        let definition = self.definition.clone();
        let state = definition
            .state(&current_id)
            .ok_or_else(|| Error::UnknownState(current_id))?;

        let matched = state
            .transitions
            .iter()
            .find(|t| t.event.as_deref() == Some(event));
        match matched {
            Some(transition) => {
                self.perform_transition(&transition.target, format!("event: {}", event))
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Forces a transition, bypassing both event and condition checks.
    pub async fn transition_to(&mut self, state_id: &str) -> Result<()> {
        if self.current.is_none() {
            return Err(Error::NotStarted);
        }
        self.perform_transition(state_id, "forced".into()).await
    }

    /// Snapshot sufficient to fully restore behavior. `totalTime` is
    /// session-scoped telemetry and deliberately not captured.
    pub fn snapshot(&self) -> Result<StateSnapshot> {
        let current_state = self.current.clone().ok_or(Error::NotStarted)?;
        Ok(StateSnapshot {
            current_state,
            variables: self.context.variables.clone(),
            state_time: self.context.state_time,
        })
    }

    /// Raw state restoration, distinct from a triggered transition: no
    /// `onEnter`/`onExit` actions run and no notification fires.
    pub fn restore(&mut self, snapshot: StateSnapshot) -> Result<()> {
        if self.definition.state(&snapshot.current_state).is_none() {
            return Err(Error::UnknownState(snapshot.current_state));
        }
        self.current = Some(snapshot.current_state);
        self.context.variables = snapshot.variables;
        self.context.state_time = snapshot.state_time;
        Ok(())
    }

    /// The shared transition path. Target resolution happens before any
    /// side effect, so a failure never leaves a half-finished transition:
    /// `onExit` → swap states → reset `stateTime` → notify → `onEnter`.
    async fn perform_transition(&mut self, target: &str, reason: String) -> Result<()> {
        let definition = self.definition.clone();
        let target_state = definition
            .state(target)
            .ok_or_else(|| Error::UnknownState(target.to_string()))?;

        let current_id = self.current.clone();
        if let Some(current_id) = current_id {
            if let Some(outgoing) = definition.state(&current_id) {
                self.run_actions(&outgoing.on_exit).await?;
            }
        }

        let from = self.current.take();
        self.previous = from.clone();
        self.current = Some(target_state.id.clone());
        self.context.state_time = 0.0;

        tracing::debug!(
            instance = %self.id,
            from = from.as_deref().unwrap_or("<none>"),
            to = %target_state.id,
            reason = %reason,
            "State transition"
        );
        self.record_change(from, target_state.id.clone(), reason);
        self.run_actions(&target_state.on_enter).await
    }

    fn record_change(&mut self, from: Option<String>, to: String, reason: String) {
        let change = StateChange {
            from,
            to,
            reason,
            timestamp: Utc::now(),
        };
        if let Some(listener) = &self.listener {
            listener.on_state_change(&change);
        }
        self.history.push(change);
    }

    async fn run_actions(&mut self, actions: &[ActionSpec]) -> Result<()> {
        for action in actions {
            self.dispatch(action).await?;
        }
        Ok(())
    }

    /// Resolves the action value (`$expr` failures are hard errors, unlike
    /// condition failures), applies the built-in `set` interpretation, then
    /// forwards to the host sink.
    async fn dispatch(&mut self, action: &ActionSpec) -> Result<()> {
        let value = match &action.value {
            Some(ActionValue::Expr { expr }) => {
                Some(self.evaluator.evaluate(expr, &self.context)?)
            }
            Some(ActionValue::Literal(literal)) => Some(literal.clone()),
            None => None,
        };

        if action.kind == "set" {
            self.context
                .variables
                .insert(action.target.clone(), value.clone().unwrap_or(Value::Null));
        }

        let record = ActionRecord {
            kind: action.kind.clone(),
            target: action.target.clone(),
            value,
        };
        match self.sink.clone() {
            Some(sink) => sink.dispatch(&record, &mut self.context).await,
            None => {
                if record.kind != "set" {
                    tracing::debug!(
                        instance = %self.id,
                        action = %record.kind,
                        target = %record.target,
                        "No action sink registered, action dropped"
                    );
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use crate::builder::StateMachineBuilder;
    use crate::definition::TransitionSpec;

    /// Records every dispatched action and state change, in order.
    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn entries(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    #[async_trait]
    impl ActionSink for Recorder {
        async fn dispatch(&self, action: &ActionRecord, _: &mut ExecutionContext) -> Result<()> {
            self.log
                .lock()
                .push(format!("{}:{}", action.kind, action.target));
            Ok(())
        }
    }

    impl StateChangeListener for Recorder {
        fn on_state_change(&self, change: &StateChange) {
            self.log.lock().push(format!(
                "change:{}->{}",
                change.from.as_deref().unwrap_or("<none>"),
                change.to
            ));
        }
    }

    fn movement_def() -> Arc<StateMachineDefinition> {
        Arc::new(
            StateMachineBuilder::new("movement")
                .state("idle")
                .transition_on("move", "walking")
                .end()
                .state("walking")
                .transition_on("run", "running")
                .transition_on("stop", "idle")
                .end()
                .state("running")
                .transition_on("stop", "idle")
                .end()
                .build(),
        )
    }

    fn instance(def: Arc<StateMachineDefinition>) -> StateMachineInstance {
        StateMachineInstance::new(def).unwrap()
    }

    #[tokio::test]
    async fn test_uninitialized_until_start() {
        let mut fsm = instance(movement_def());
        assert!(fsm.current_state_id().is_none());
        assert!(fsm.current_state().is_none());
        fsm.start().await.unwrap();
        assert_eq!(fsm.current_state_id(), Some("idle"));
        assert_eq!(fsm.current_state().unwrap().id, "idle");
    }

    #[test]
    fn test_unknown_initial_state_fails_at_construction() {
        let def = Arc::new(
            StateMachineBuilder::new("broken")
                .initial_state("missing")
                .state("idle")
                .end()
                .build(),
        );
        assert!(matches!(
            StateMachineInstance::new(def),
            Err(Error::InvalidDefinition(_))
        ));
    }

    #[tokio::test]
    async fn test_not_started_errors() {
        let mut fsm = instance(movement_def());
        assert!(matches!(fsm.update(0.1).await, Err(Error::NotStarted)));
        assert!(matches!(fsm.trigger("move").await, Err(Error::NotStarted)));
        assert!(matches!(
            fsm.transition_to("walking").await,
            Err(Error::NotStarted)
        ));
        assert!(matches!(fsm.snapshot(), Err(Error::NotStarted)));
    }

    #[tokio::test]
    async fn test_trigger_unknown_event_is_not_an_error() {
        let mut fsm = instance(movement_def());
        fsm.start().await.unwrap();
        assert!(!fsm.trigger("fly").await.unwrap());
        assert_eq!(fsm.current_state_id(), Some("idle"));
    }

    #[tokio::test]
    async fn test_event_scenario_idle_walking_running_idle() {
        let mut fsm = instance(movement_def());
        fsm.start().await.unwrap();
        assert!(fsm.trigger("move").await.unwrap());
        assert_eq!(fsm.current_state_id(), Some("walking"));
        assert_eq!(fsm.previous_state_id(), Some("idle"));
        assert!(fsm.trigger("run").await.unwrap());
        assert!(fsm.trigger("stop").await.unwrap());
        assert_eq!(fsm.current_state_id(), Some("idle"));
        assert_eq!(fsm.previous_state_id(), Some("running"));
    }

    #[tokio::test]
    async fn test_condition_scenario_energy() {
        let def = Arc::new(
            StateMachineBuilder::new("stamina")
                .variable("energy", json!(100))
                .state("active")
                .transition_when("energy < 20", "tired", 0)
                .end()
                .state("tired")
                .end()
                .build(),
        );
        let mut fsm = instance(def);
        fsm.start().await.unwrap();

        fsm.update(0.1).await.unwrap();
        assert_eq!(fsm.current_state_id(), Some("active"));

        fsm.context_mut().set("energy", json!(10));
        fsm.update(0.1).await.unwrap();
        assert_eq!(fsm.current_state_id(), Some("tired"));
    }

    #[tokio::test]
    async fn test_priority_law() {
        let def = Arc::new(
            StateMachineBuilder::new("priorities")
                .variable("ready", json!(true))
                .state("start")
                .transition_when("ready", "low", 1)
                .transition_when("ready", "high", 5)
                .end()
                .state("low")
                .end()
                .state("high")
                .end()
                .build(),
        );
        let mut fsm = instance(def);
        fsm.start().await.unwrap();
        fsm.update(0.1).await.unwrap();
        assert_eq!(fsm.current_state_id(), Some("high"));
    }

    #[tokio::test]
    async fn test_priority_tie_breaks_by_declaration_order() {
        let def = Arc::new(
            StateMachineBuilder::new("tie")
                .state("start")
                .transition_when("true", "first", 3)
                .transition_when("true", "second", 3)
                .end()
                .state("first")
                .end()
                .state("second")
                .end()
                .build(),
        );
        let mut fsm = instance(def);
        fsm.start().await.unwrap();
        fsm.update(0.1).await.unwrap();
        assert_eq!(fsm.current_state_id(), Some("first"));
    }

    #[tokio::test]
    async fn test_guardless_transition_fires_every_tick() {
        let def = Arc::new(
            StateMachineBuilder::new("pass-through")
                .state("a")
                .transition_always("b")
                .end()
                .state("b")
                .transition_always("a")
                .end()
                .build(),
        );
        let mut fsm = instance(def);
        fsm.start().await.unwrap();
        fsm.update(0.1).await.unwrap();
        assert_eq!(fsm.current_state_id(), Some("b"));
        fsm.update(0.1).await.unwrap();
        assert_eq!(fsm.current_state_id(), Some("a"));
    }

    #[tokio::test]
    async fn test_event_transitions_ignore_priority() {
        let def = Arc::new(
            StateMachineBuilder::new("events")
                .state("start")
                .transition(TransitionSpec::on("go", "first"))
                .transition(TransitionSpec::on("go", "second").with_priority(10))
                .end()
                .state("first")
                .end()
                .state("second")
                .end()
                .build(),
        );
        let mut fsm = instance(def);
        fsm.start().await.unwrap();
        assert!(fsm.trigger("go").await.unwrap());
        assert_eq!(fsm.current_state_id(), Some("first"));
    }

    #[tokio::test]
    async fn test_timer_law() {
        let def = Arc::new(
            StateMachineBuilder::new("timers")
                .state("a")
                .transition_on("next", "b")
                .end()
                .state("b")
                .transition_when("stateTime >= 1", "a", 0)
                .end()
                .build(),
        );
        let mut fsm = instance(def);
        fsm.start().await.unwrap();

        fsm.update(0.25).await.unwrap();
        fsm.update(0.25).await.unwrap();
        assert_eq!(fsm.context().state_time, 0.5);
        assert_eq!(fsm.context().total_time, 0.5);

        // Event transition resets stateTime, not totalTime.
        fsm.trigger("next").await.unwrap();
        assert_eq!(fsm.context().state_time, 0.0);
        assert_eq!(fsm.context().total_time, 0.5);

        // Automatic transition after the timer matures.
        fsm.update(0.6).await.unwrap();
        assert_eq!(fsm.current_state_id(), Some("b"));
        fsm.update(0.5).await.unwrap();
        assert_eq!(fsm.current_state_id(), Some("a"));
        assert_eq!(fsm.context().state_time, 0.0);
        assert!((fsm.context().total_time - 1.6).abs() < 1e-9);

        // Forced transition resets stateTime as well.
        fsm.update(0.3).await.unwrap();
        fsm.transition_to("b").await.unwrap();
        assert_eq!(fsm.context().state_time, 0.0);
        assert!((fsm.context().total_time - 1.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_transition_to_unknown_state() {
        let recorder = Arc::new(Recorder::default());
        let def = Arc::new(
            StateMachineBuilder::new("forced")
                .state("idle")
                .on_exit(ActionSpec::new("log", "leaving"))
                .end()
                .build(),
        );
        let mut fsm = instance(def).with_action_sink(recorder.clone());
        fsm.start().await.unwrap();
        assert!(matches!(
            fsm.transition_to("nowhere").await,
            Err(Error::UnknownState(_))
        ));
        // The failure happened before any side effect: no onExit ran and the
        // state is unchanged.
        assert_eq!(fsm.current_state_id(), Some("idle"));
        assert!(recorder.entries().is_empty());
    }

    #[tokio::test]
    async fn test_action_and_notification_order() {
        let recorder = Arc::new(Recorder::default());
        let def = Arc::new(
            StateMachineBuilder::new("ordered")
                .state("a")
                .on_enter(ActionSpec::new("log", "enter_a"))
                .on_exit(ActionSpec::new("log", "exit_a1"))
                .on_exit(ActionSpec::new("log", "exit_a2"))
                .transition_on("next", "b")
                .end()
                .state("b")
                .on_enter(ActionSpec::new("log", "enter_b1"))
                .on_enter(ActionSpec::new("log", "enter_b2"))
                .end()
                .build(),
        );
        let mut fsm = instance(def)
            .with_action_sink(recorder.clone())
            .with_state_listener(recorder.clone());
        fsm.start().await.unwrap();
        fsm.trigger("next").await.unwrap();

        assert_eq!(
            recorder.entries(),
            vec![
                "change:<none>->a",
                "log:enter_a",
                "log:exit_a1",
                "log:exit_a2",
                "change:a->b",
                "log:enter_b1",
                "log:enter_b2",
            ]
        );
    }

    #[tokio::test]
    async fn test_on_update_actions_run_in_order_every_tick() {
        let recorder = Arc::new(Recorder::default());
        let def = Arc::new(
            StateMachineBuilder::new("updating")
                .state("a")
                .on_update(ActionSpec::new("log", "u1"))
                .on_update(ActionSpec::new("log", "u2"))
                .end()
                .build(),
        );
        let mut fsm = instance(def).with_action_sink(recorder.clone());
        fsm.start().await.unwrap();
        fsm.update(0.1).await.unwrap();
        fsm.update(0.1).await.unwrap();
        assert_eq!(
            recorder.entries(),
            vec!["log:u1", "log:u2", "log:u1", "log:u2"]
        );
    }

    #[tokio::test]
    async fn test_set_action_writes_scope_and_reaches_sink() {
        let recorder = Arc::new(Recorder::default());
        let def = Arc::new(
            StateMachineBuilder::new("setter")
                .variable("count", json!(1))
                .state("a")
                .on_enter(ActionSpec::set_expr("count", "count + 1"))
                .on_enter(ActionSpec::set("label", "ready"))
                .end()
                .build(),
        );
        let mut fsm = instance(def).with_action_sink(recorder.clone());
        fsm.start().await.unwrap();
        assert_eq!(fsm.context().get("count"), Some(&json!(2.0)));
        assert_eq!(fsm.context().get("label"), Some(&json!("ready")));
        assert_eq!(recorder.entries(), vec!["set:count", "set:label"]);
    }

    #[tokio::test]
    async fn test_set_action_works_without_sink() {
        let def = Arc::new(
            StateMachineBuilder::new("setter")
                .state("a")
                .on_enter(ActionSpec::set("armed", true))
                .end()
                .build(),
        );
        let mut fsm = instance(def);
        fsm.start().await.unwrap();
        assert_eq!(fsm.context().get("armed"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_condition_failure_degrades_to_false() {
        let def = Arc::new(
            StateMachineBuilder::new("broken-guard")
                .state("a")
                .transition_when("no_such * 2", "b", 0)
                .end()
                .state("b")
                .end()
                .build(),
        );
        let mut fsm = instance(def);
        fsm.start().await.unwrap();
        fsm.update(0.1).await.unwrap();
        assert_eq!(fsm.current_state_id(), Some("a"));
    }

    #[tokio::test]
    async fn test_expr_value_failure_is_a_hard_error() {
        let def = Arc::new(
            StateMachineBuilder::new("broken-set")
                .state("a")
                .on_update(ActionSpec::set_expr("x", "no_such + 1"))
                .end()
                .build(),
        );
        let mut fsm = instance(def);
        fsm.start().await.unwrap();
        assert!(matches!(fsm.update(0.1).await, Err(Error::Expr(_))));
        // The broken assignment did not corrupt the scope.
        assert!(fsm.context().get("x").is_none());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let def = movement_def();
        let mut fsm = instance(def.clone());
        fsm.start().await.unwrap();
        fsm.trigger("move").await.unwrap();
        fsm.update(0.75).await.unwrap();
        fsm.context_mut().set("ammo", json!(7));

        let snapshot = fsm.snapshot().unwrap();
        assert_eq!(snapshot.current_state, "walking");
        assert_eq!(snapshot.state_time, 0.75);

        let mut fresh = instance(def);
        fresh.restore(snapshot.clone()).unwrap();
        assert_eq!(fresh.current_state_id(), Some("walking"));
        assert_eq!(fresh.context().state_time, 0.75);
        assert_eq!(fresh.context().get("ammo"), Some(&json!(7)));
        assert_eq!(fresh.snapshot().unwrap(), snapshot);
    }

    #[tokio::test]
    async fn test_restore_fires_no_actions() {
        let recorder = Arc::new(Recorder::default());
        let def = Arc::new(
            StateMachineBuilder::new("silent")
                .state("a")
                .transition_on("next", "b")
                .end()
                .state("b")
                .on_enter(ActionSpec::new("log", "enter_b"))
                .end()
                .build(),
        );
        let mut fsm = instance(def)
            .with_action_sink(recorder.clone())
            .with_state_listener(recorder.clone());
        fsm.start().await.unwrap();
        recorder.log.lock().clear();

        fsm.restore(StateSnapshot {
            current_state: "b".into(),
            variables: HashMap::new(),
            state_time: 2.0,
        })
        .unwrap();
        assert_eq!(fsm.current_state_id(), Some("b"));
        assert!(recorder.entries().is_empty());
    }

    #[tokio::test]
    async fn test_restore_unknown_state() {
        let mut fsm = instance(movement_def());
        fsm.start().await.unwrap();
        let result = fsm.restore(StateSnapshot {
            current_state: "flying".into(),
            variables: HashMap::new(),
            state_time: 0.0,
        });
        assert!(matches!(result, Err(Error::UnknownState(_))));
    }

    #[tokio::test]
    async fn test_double_start_re_enters_initial_state() {
        let recorder = Arc::new(Recorder::default());
        let def = Arc::new(
            StateMachineBuilder::new("restart")
                .state("a")
                .on_enter(ActionSpec::new("log", "enter_a"))
                .transition_on("next", "b")
                .end()
                .state("b")
                .end()
                .build(),
        );
        let mut fsm = instance(def).with_action_sink(recorder.clone());
        fsm.start().await.unwrap();
        fsm.trigger("next").await.unwrap();
        fsm.update(1.0).await.unwrap();

        fsm.start().await.unwrap();
        assert_eq!(fsm.current_state_id(), Some("a"));
        assert!(fsm.previous_state_id().is_none());
        assert_eq!(fsm.context().state_time, 0.0);
        assert_eq!(fsm.context().total_time, 0.0);
        assert_eq!(recorder.entries(), vec!["log:enter_a", "log:enter_a"]);
    }

    #[tokio::test]
    async fn test_history_records_transitions() {
        let mut fsm = instance(movement_def());
        fsm.start().await.unwrap();
        fsm.trigger("move").await.unwrap();
        fsm.transition_to("idle").await.unwrap();

        let history = fsm.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].reason, "start");
        assert!(history[0].from.is_none());
        assert_eq!(history[1].reason, "event: move");
        assert_eq!(history[1].from.as_deref(), Some("idle"));
        assert_eq!(history[2].reason, "forced");
        assert_eq!(history[2].to, "idle");
    }

    #[tokio::test]
    async fn test_sink_can_suspend_and_mutate_context() {
        struct SlowSink;

        #[async_trait]
        impl ActionSink for SlowSink {
            async fn dispatch(
                &self,
                action: &ActionRecord,
                context: &mut ExecutionContext,
            ) -> Result<()> {
                tokio::task::yield_now().await;
                if action.kind == "call" {
                    context.set("called", json!(true));
                }
                Ok(())
            }
        }

        let def = Arc::new(
            StateMachineBuilder::new("suspend")
                .state("a")
                .on_enter(ActionSpec::new("call", "prepare"))
                .end()
                .build(),
        );
        let mut fsm = instance(def).with_action_sink(Arc::new(SlowSink));
        fsm.start().await.unwrap();
        assert_eq!(fsm.context().get("called"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_sink_error_propagates() {
        struct FailingSink;

        #[async_trait]
        impl ActionSink for FailingSink {
            async fn dispatch(&self, _: &ActionRecord, _: &mut ExecutionContext) -> Result<()> {
                Err(Error::Action("sound device lost".into()))
            }
        }

        let def = Arc::new(
            StateMachineBuilder::new("failing")
                .state("a")
                .on_enter(ActionSpec::new("playSound", "alarm"))
                .end()
                .build(),
        );
        let mut fsm = instance(def).with_action_sink(Arc::new(FailingSink));
        assert!(matches!(fsm.start().await, Err(Error::Action(_))));
    }

    #[tokio::test]
    async fn test_initial_variables_override_definition_defaults() {
        let def = Arc::new(
            StateMachineBuilder::new("seeded")
                .variable("energy", json!(100))
                .variable("name", json!("guard"))
                .state("a")
                .end()
                .build(),
        );
        let fsm = StateMachineInstance::new(def)
            .unwrap()
            .with_variables(HashMap::from([("energy".to_string(), json!(40))]));
        assert_eq!(fsm.context().get("energy"), Some(&json!(40)));
        assert_eq!(fsm.context().get("name"), Some(&json!("guard")));
    }
}
