use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ActionRecord, ExecutionContext, StateChange};

/// Host callback invoked for every declared action in every
/// `onEnter`/`onExit`/`onUpdate` list. The runtime performs no I/O itself:
/// `set` is the one engine-interpreted action type (written to the scope
/// before the sink is notified), everything else is forwarded as-is.
///
/// A sink may suspend (e.g. to await an animation or sound); the runtime
/// awaits each dispatch to completion before the next action begins.
#[async_trait]
pub trait ActionSink: Send + Sync {
    async fn dispatch(&self, action: &ActionRecord, context: &mut ExecutionContext) -> Result<()>;
}

/// Host callback fired once per transition, after the outgoing state's
/// `onExit` actions and before the incoming state's `onEnter` actions run.
pub trait StateChangeListener: Send + Sync {
    fn on_state_change(&self, change: &StateChange);
}
