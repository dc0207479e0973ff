use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use keel_core::error::Result;
use keel_core::event::EventPayload;
use keel_core::function::FunctionOpts;

use crate::tools::StepHandle;

/// Context handed to a handler for one cycle.
#[derive(Clone)]
pub struct HandlerCtx {
    pub event: EventPayload,
    pub events: Vec<EventPayload>,
    pub run_id: String,
    pub attempt: u32,
    /// Step primitives bound to this cycle.
    pub step: StepHandle,
}

/// Type-erased handler function.
pub type HandlerFn = Arc<dyn Fn(HandlerCtx) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A durable function: declarative configuration plus the handler body.
#[derive(Clone)]
pub struct FunctionSpec {
    pub opts: FunctionOpts,
    handler: HandlerFn,
}

impl FunctionSpec {
    /// Pair configuration with a handler.
    pub fn new<F, Fut>(opts: FunctionOpts, handler: F) -> Self
    where
        F: Fn(HandlerCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            opts,
            handler: Arc::new(move |ctx| Box::pin(handler(ctx))),
        }
    }

    /// The handler body.
    pub fn handler(&self) -> HandlerFn {
        self.handler.clone()
    }

    /// JSON descriptor for Executor registration.
    pub fn describe(&self, serve_url: &str) -> Value {
        self.opts.describe(serve_url)
    }
}
