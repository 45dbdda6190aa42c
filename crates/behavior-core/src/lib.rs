//! Core types and traits for the behavior state-machine runtime

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::{ActionSink, StateChangeListener};
pub use types::{ActionRecord, ExecutionContext, StateChange, StateSnapshot};
