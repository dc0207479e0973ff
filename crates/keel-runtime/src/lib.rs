pub mod ambient;
pub mod checkpoint;
pub mod client;
pub mod engine;
pub mod handler;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod tools;

// Testing utilities - available when the "testing" feature is enabled or in test mode
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use ambient::{current_execution, set_ambient_disabled, ExecutingStep, ExecutionScope};
pub use checkpoint::{
    CheckpointBuffer, CheckpointRoute, CheckpointSettings, CheckpointTransport, FlushOutcome,
    StepCheckpointer,
};
pub use client::{clients_from_config, HttpCheckpointer, HttpEventSender};
pub use engine::{CycleInputs, EngineSettings, ExecutionEngine};
pub use handler::{FunctionSpec, HandlerCtx, HandlerFn};
pub use registry::AppRegistry;
pub use scheduler::Checkpoint;
pub use state::{FoundStep, RunState};
pub use tools::{match_to_expression, InvokeOpts, StepHandle, WaitForEventOpts};
