//! Dispatch — pick an execution mode and run tasks against named workers.

pub mod dispatcher;
pub mod mode;

pub use dispatcher::{DispatchOutcome, DispatchRequest, Dispatcher, WorkerSpec};
pub use mode::{
    Complexity, ExecutionMode, ResolvedMode, TaskCharacteristics, WorkerPreference, decide,
};
