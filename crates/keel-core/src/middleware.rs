use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ErrorShape;
use crate::event::EventPayload;

/// Mutable view of the handler input, passed through `transform_input`.
#[derive(Debug, Clone)]
pub struct HandlerInput {
    pub event: EventPayload,
    pub events: Vec<EventPayload>,
    pub run_id: String,
    pub attempt: u32,
}

/// Mutable view of an outgoing result payload, passed through
/// `transform_output`. Exactly one of `data`/`error` is set on entry and the
/// stack keeps it that way: a hook cannot turn a resolution into a rejection
/// or vice versa.
#[derive(Debug, Clone, Default)]
pub struct OutputTransform {
    pub data: Option<Value>,
    pub error: Option<ErrorShape>,
}

impl OutputTransform {
    /// A successful output.
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    /// A failed output.
    pub fn error(error: ErrorShape) -> Self {
        Self {
            data: None,
            error: Some(error),
        }
    }
}

/// Ordered hook pipeline around one function run.
///
/// Hooks default to no-ops; middlewares override only what they need.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Rewrite the handler input (events, run metadata) before execution.
    async fn transform_input(&self, _input: &mut HandlerInput) {}

    /// Runs once, before memoized state starts being replayed.
    async fn before_memoization(&self) {}

    /// Runs once, after the last memoized op has been rediscovered.
    async fn after_memoization(&self) {}

    /// Runs once, before any new step body or handler tail executes.
    async fn before_execution(&self) {}

    /// Runs once, after execution for the cycle has finished.
    async fn after_execution(&self) {}

    /// Rewrite outgoing data or error payloads.
    async fn transform_output(&self, _output: &mut OutputTransform) {}

    /// Runs once, just before the cycle's response is returned.
    async fn before_response(&self) {}

    /// Runs once when the run reaches a terminal result.
    async fn finished(&self) {}

    /// Rewrite outgoing event payloads (`send_event`, `invoke`).
    async fn on_send_event(&self, _payloads: &mut Vec<EventPayload>) {}
}

/// Composed middleware pipeline with once-only lifecycle hooks.
///
/// Input-side hooks run in registration order; output-side hooks run in
/// reverse registration order. Lifecycle hooks are latched so that repeated
/// transitions run their effects exactly once per engine instance. Cloning
/// shares the middlewares but resets the latches: each clone is a fresh
/// lifecycle.
#[derive(Default)]
pub struct MiddlewareStack {
    items: Vec<Arc<dyn Middleware>>,
    latches: Arc<Latches>,
}

impl Clone for MiddlewareStack {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            latches: Arc::new(Latches::default()),
        }
    }
}

#[derive(Default)]
struct Latches {
    before_memoization: AtomicBool,
    after_memoization: AtomicBool,
    before_execution: AtomicBool,
    after_execution: AtomicBool,
    before_response: AtomicBool,
    finished: AtomicBool,
}

impl Latches {
    fn first(&self, flag: &AtomicBool) -> bool {
        !flag.swap(true, Ordering::SeqCst)
    }
}

impl MiddlewareStack {
    /// An empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware; registration order is significant.
    pub fn register(&mut self, middleware: Arc<dyn Middleware>) {
        self.items.push(middleware);
    }

    /// Builder-style registration.
    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.register(middleware);
        self
    }

    /// Number of registered middlewares.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no middleware is registered.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub async fn transform_input(&self, input: &mut HandlerInput) {
        for mw in &self.items {
            mw.transform_input(input).await;
        }
    }

    pub async fn before_memoization(&self) {
        if self.latches.first(&self.latches.before_memoization) {
            for mw in &self.items {
                mw.before_memoization().await;
            }
        }
    }

    pub async fn after_memoization(&self) {
        if self.latches.first(&self.latches.after_memoization) {
            for mw in &self.items {
                mw.after_memoization().await;
            }
        }
    }

    pub async fn before_execution(&self) {
        if self.latches.first(&self.latches.before_execution) {
            for mw in &self.items {
                mw.before_execution().await;
            }
        }
    }

    pub async fn after_execution(&self) {
        if self.latches.first(&self.latches.after_execution) {
            for mw in self.items.iter().rev() {
                mw.after_execution().await;
            }
        }
    }

    /// Run `transform_output` hooks in reverse order. The resolved/rejected
    /// polarity of the payload is pinned: hooks may rewrite the present side
    /// but cannot flip which side is present.
    pub async fn transform_output(&self, output: &mut OutputTransform) {
        let was_error = output.error.is_some();
        for mw in self.items.iter().rev() {
            mw.transform_output(output).await;
            if was_error {
                if output.error.is_none() {
                    output.error = Some(ErrorShape::new("Error", "unknown error"));
                }
                output.data = None;
            } else {
                if output.data.is_none() {
                    output.data = Some(Value::Null);
                }
                output.error = None;
            }
        }
    }

    pub async fn before_response(&self) {
        if self.latches.first(&self.latches.before_response) {
            for mw in self.items.iter().rev() {
                mw.before_response().await;
            }
        }
    }

    pub async fn finished(&self) {
        if self.latches.first(&self.latches.finished) {
            for mw in &self.items {
                mw.finished().await;
            }
        }
    }

    pub async fn on_send_event(&self, payloads: &mut Vec<EventPayload>) {
        for mw in &self.items {
            mw.on_send_event(payloads).await;
        }
    }
}
