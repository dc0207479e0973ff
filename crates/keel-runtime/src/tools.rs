//! User-facing step primitives.
//!
//! Every primitive registers a discovery with the shared run state and
//! returns an awaitable completion. Replayed steps settle immediately from
//! memoized state; genuinely new steps stay pending until the scheduler
//! decides they should fulfill (or the cycle ends, in which case the
//! awaitable never settles).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use keel_core::error::{Error, Result};
use keel_core::event::EventPayload;
use keel_core::executor::{EventSender, SendResult};
use keel_core::middleware::MiddlewareStack;
use keel_core::op::StepOpCode;
use keel_core::timestr;

use crate::state::{Discover, RunState, StepBody, StepRequest};

/// Options for `wait_for_event`.
#[derive(Debug, Clone, Default)]
pub struct WaitForEventOpts {
    /// Explicit step id; defaults to the event name.
    pub id: Option<String>,
    /// How long to wait before the step resolves to `None`.
    pub timeout: String,
    /// Match a field of the triggering event against the same field of the
    /// awaited event. Sugar for `if: "event.<path> == async.<path>"`.
    pub match_path: Option<String>,
    /// Full matching expression; takes precedence over `match_path`.
    pub if_expression: Option<String>,
}

/// Options for `invoke`.
#[derive(Debug, Clone)]
pub struct InvokeOpts {
    /// Id of the function to invoke.
    pub function_id: String,
    /// Payload event data handed to the invoked function.
    pub payload: Option<Value>,
    /// How long to wait for the invoked function.
    pub timeout: Option<String>,
    /// Explicit step id; defaults to the function id.
    pub id: Option<String>,
}

/// Translate a `match` path into the equivalent matching expression.
pub fn match_to_expression(path: &str) -> String {
    format!("event.{path} == async.{path}")
}

/// Handle through which a handler requests steps.
#[derive(Clone)]
pub struct StepHandle {
    state: Arc<RunState>,
    events: Arc<dyn EventSender>,
    middleware: MiddlewareStack,
}

impl StepHandle {
    pub(crate) fn new(
        state: Arc<RunState>,
        events: Arc<dyn EventSender>,
        middleware: MiddlewareStack,
    ) -> Self {
        Self {
            state,
            events,
            middleware,
        }
    }

    /// Run a retriable block of work exactly once across the whole run.
    pub fn run<T, F, Fut>(&self, name: &str, f: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let body: StepBody = Box::new(move || {
            Box::pin(async move {
                let value = f().await?;
                serde_json::to_value(value).map_err(Error::from)
            })
        });
        let outcome = self.state.discover(StepRequest {
            base_id: name.to_string(),
            op: StepOpCode::StepPlanned,
            display_name: name.to_string(),
            name: name.to_string(),
            opts: None,
            body: Some(body),
        });
        settle::<T>(outcome)
    }

    /// Pause the run for the given duration.
    pub fn sleep(&self, duration: Duration) -> impl Future<Output = Result<()>> + Send + 'static {
        let text = timestr::format_duration(duration);
        let outcome = self.state.discover(StepRequest {
            base_id: text.clone(),
            op: StepOpCode::Sleep,
            display_name: text.clone(),
            name: text.clone(),
            opts: Some(json!({ "duration": text })),
            body: None,
        });
        settle::<()>(outcome)
    }

    /// Pause the run until a point in time.
    pub fn sleep_until(
        &self,
        until: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let iso = until.to_rfc3339();
        let outcome = self.state.discover(StepRequest {
            base_id: iso.clone(),
            op: StepOpCode::Sleep,
            display_name: iso.clone(),
            name: iso.clone(),
            opts: Some(json!({ "until": iso })),
            body: None,
        });
        settle::<()>(outcome)
    }

    /// Wait for a matching event, resolving to `None` on timeout.
    pub fn wait_for_event(
        &self,
        event: &str,
        opts: WaitForEventOpts,
    ) -> impl Future<Output = Result<Option<EventPayload>>> + Send + 'static {
        let expression = opts
            .if_expression
            .clone()
            .or_else(|| opts.match_path.as_deref().map(match_to_expression));
        let mut op_opts = json!({ "event": event, "timeout": opts.timeout });
        if let Some(expr) = &expression {
            op_opts["if"] = json!(expr);
        }
        let base_id = opts.id.unwrap_or_else(|| event.to_string());
        let outcome = self.state.discover(StepRequest {
            base_id: base_id.clone(),
            op: StepOpCode::WaitForEvent,
            display_name: base_id,
            name: event.to_string(),
            opts: Some(op_opts),
            body: None,
        });
        async move {
            let value = settle::<Value>(outcome).await?;
            if value.is_null() {
                Ok(None)
            } else {
                serde_json::from_value(value).map(Some).map_err(Error::from)
            }
        }
    }

    /// Invoke another durable function and wait for its result.
    pub fn invoke(&self, opts: InvokeOpts) -> impl Future<Output = Result<Value>> + Send + 'static {
        let base_id = opts.id.clone().unwrap_or_else(|| opts.function_id.clone());
        let op_opts = json!({
            "function_id": opts.function_id,
            "payload": opts.payload,
            "timeout": opts.timeout,
        });
        let outcome = self.state.discover(StepRequest {
            base_id: base_id.clone(),
            op: StepOpCode::InvokeFunction,
            display_name: base_id,
            name: opts.function_id,
            opts: Some(op_opts),
            body: None,
        });
        settle::<Value>(outcome)
    }

    /// Send events reliably as a step.
    pub fn send_event(
        &self,
        payloads: Vec<EventPayload>,
    ) -> impl Future<Output = Result<SendResult>> + Send + 'static {
        let sender = self.events.clone();
        let middleware = self.middleware.clone();
        let body: StepBody = Box::new(move || {
            Box::pin(async move {
                let mut payloads = payloads;
                middleware.on_send_event(&mut payloads).await;
                let result = sender.send(payloads).await?;
                serde_json::to_value(result).map_err(Error::from)
            })
        });
        let outcome = self.state.discover(StepRequest {
            base_id: "sendEvent".to_string(),
            op: StepOpCode::StepPlanned,
            display_name: "sendEvent".to_string(),
            name: "sendEvent".to_string(),
            opts: None,
            body: Some(body),
        });
        settle::<SendResult>(outcome)
    }

    /// Offload a model inference request to the gateway.
    pub fn ai_infer(
        &self,
        id: &str,
        body: Value,
    ) -> impl Future<Output = Result<Value>> + Send + 'static {
        let outcome = self.state.discover(StepRequest {
            base_id: id.to_string(),
            op: StepOpCode::AiGateway,
            display_name: id.to_string(),
            name: id.to_string(),
            opts: Some(json!({ "body": body })),
            body: None,
        });
        settle::<Value>(outcome)
    }
}

/// Turn a discovery outcome into the step's typed awaitable.
fn settle<T>(outcome: Discover) -> impl Future<Output = Result<T>> + Send + 'static
where
    T: DeserializeOwned + Send + 'static,
{
    async move {
        let value = match outcome {
            Discover::Ready(result) => result?,
            Discover::Pending(rx) => match rx.await {
                Ok(result) => result?,
                // The cycle ended without fulfilling this step; the
                // awaitable must never settle observably.
                Err(_) => return futures::future::pending().await,
            },
        };
        serde_json::from_value(value).map_err(Error::from)
    }
}
