//! A sentry AI driven by the behavior runtime: patrols until an intruder
//! gets close, chases until it runs out of energy, then rests.
//!
//! Run with: `cargo run --example sentry`

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use behavior_fsm::{
    ActionRecord, ActionSink, ActionSpec, ExecutionContext, Result, StateChange,
    StateChangeListener, StateMachineBuilder, StateMachineManager,
};

struct ConsoleHost;

#[async_trait]
impl ActionSink for ConsoleHost {
    async fn dispatch(&self, action: &ActionRecord, _: &mut ExecutionContext) -> Result<()> {
        match action.kind.as_str() {
            "playSound" => println!("  [audio] {}", action.target),
            "log" => println!("  [log] {}", action.target),
            "set" => {}
            other => println!("  [action] {} -> {}", other, action.target),
        }
        Ok(())
    }
}

struct ConsoleListener;

impl StateChangeListener for ConsoleListener {
    fn on_state_change(&self, change: &StateChange) {
        println!(
            "  [state] {} -> {} ({})",
            change.from.as_deref().unwrap_or("<none>"),
            change.to,
            change.reason
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let definition = StateMachineBuilder::new("sentry")
        .name("Sentry")
        .variable("energy", json!(10))
        .variable("position", json!({ "x": 0.0, "y": 0.0 }))
        .variable("intruder", json!({ "x": 40.0, "y": 30.0 }))
        .state("patrol")
        .animation("walk_cycle")
        .on_enter(ActionSpec::new("playSound", "footsteps"))
        .transition_when("distance(position, intruder) < 20", "chase", 0)
        .end()
        .state("chase")
        .animation("run_cycle")
        .on_enter(ActionSpec::new("log", "intruder spotted"))
        .on_update(ActionSpec::set_expr("energy", "energy - 1"))
        .transition_when("energy <= 0", "rest", 10)
        .transition_when("distance(position, intruder) >= 20", "patrol", 0)
        .end()
        .state("rest")
        .animation("sit")
        .on_enter(ActionSpec::set("energy", 10))
        .transition_when("stateTime >= 2", "patrol", 0)
        .end()
        .build();

    let mut manager = StateMachineManager::new();
    manager.set_action_sink(Arc::new(ConsoleHost));
    manager.set_state_listener(Arc::new(ConsoleListener));
    manager.register_definition(definition);
    manager.create_instance("sentry", Some("gate-guard")).await?;

    for step in 0..30 {
        println!("tick {}", step);
        if step == 5 {
            // The intruder closes in.
            let guard = manager.instance_mut("gate-guard").expect("instance exists");
            guard
                .context_mut()
                .set("intruder", json!({ "x": 3.0, "y": 4.0 }));
        }
        manager.update_all(0.5).await?;
    }

    let guard = manager.instance("gate-guard").expect("instance exists");
    let snapshot = guard.snapshot()?;
    println!("snapshot: {}", serde_json::to_string_pretty(&snapshot).map_err(|e| {
        behavior_fsm::Error::Other(e.to_string())
    })?);
    Ok(())
}
