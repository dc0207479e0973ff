pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod function;
pub mod id;
pub mod middleware;
pub mod op;
pub mod retry;
pub mod timestr;
pub mod wire;

pub use config::Config;
pub use error::{Error, ErrorShape, Result, Retriable, StepError};
pub use event::EventPayload;
pub use executor::{
    CheckpointAsyncRequest, CheckpointRequest, Checkpointer, EventSender, EventValidator,
    NewRunRequest, NewRunResponse, SendResult, SigningVerifier, VerifyOutcome,
};
pub use function::{Cancellation, Concurrency, ConcurrencyScope, FunctionOpts, Throttle, Trigger};
pub use id::hash_step_id;
pub use middleware::{HandlerInput, Middleware, MiddlewareStack, OutputTransform};
pub use op::{MemoizedOp, OpStack, OutgoingOp, StepOpCode, Userland};
pub use retry::RetryPolicy;
pub use wire::{ExecutionResult, ExecutorRequest, MemoizedShape, RequestCtx, StackInfo, WireResponse};
