//! Data-driven behavior state machines for game entities
//!
//! A [`StateMachineDefinition`] is authored once (by hand, via the
//! [`StateMachineBuilder`], or deserialized from the editor wire format) and
//! registered with a [`StateMachineManager`]; each [`StateMachineInstance`]
//! owns one live execution driven by discrete `update(dt)` ticks and
//! `trigger(event)` calls. Side effects are delegated to a host
//! [`ActionSink`]; guards run through the embedded [`Evaluator`].

mod builder;
mod definition;
mod expr;
mod instance;
mod manager;

pub use behavior_core::{
    ActionRecord, ActionSink, Error, ExecutionContext, Result, StateChange, StateChangeListener,
    StateSnapshot,
};
pub use builder::{StateBuilder, StateMachineBuilder};
pub use definition::{
    ActionSpec, ActionValue, StateDefinition, StateMachineDefinition, TransitionSpec,
};
pub use expr::{EvalError, Evaluator};
pub use instance::StateMachineInstance;
pub use manager::StateMachineManager;
