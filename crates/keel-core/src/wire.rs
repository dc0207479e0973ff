use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorShape, Retriable};
use crate::event::EventPayload;
use crate::op::{MemoizedOp, OpStack, OutgoingOp};

/// The request body the Executor posts to the SDK for one cycle.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorRequest {
    /// Negotiated protocol version; `-1` means "use the SDK's preferred".
    #[serde(default = "default_version")]
    pub version: i32,
    pub event: EventPayload,
    #[serde(default)]
    pub events: Vec<EventPayload>,
    /// Memoized step state, keyed by hashed id.
    #[serde(default)]
    pub steps: HashMap<String, MemoizedShape>,
    pub ctx: RequestCtx,
    /// v0 placement of the `use_api` flag.
    #[serde(default)]
    pub use_api: Option<bool>,
}

fn default_version() -> i32 {
    -1
}

/// Run context within an Executor request.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestCtx {
    pub run_id: String,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub stack: Option<StackInfo>,
    #[serde(default)]
    pub disable_immediate_execution: bool,
    #[serde(default)]
    pub use_api: Option<bool>,
}

/// The Executor's recorded completion order.
#[derive(Debug, Clone, Deserialize)]
pub struct StackInfo {
    pub stack: Option<Vec<String>>,
    #[serde(default)]
    pub current: i64,
}

/// A memoized step entry, normalized from the accepted wire shapes:
/// a wrapped `{data}`, a wrapped `{error}`, `null` (a defined null result),
/// a wrapped `{input}` (a planned step whose body has not run yet), or a
/// bare event payload (`waitForEvent` shorthand).
#[derive(Debug, Clone, PartialEq)]
pub enum MemoizedShape {
    Data(Value),
    Error(ErrorShape),
    Input(Vec<Value>),
}

impl MemoizedShape {
    /// Normalize a raw wire value.
    pub fn normalize(value: Value) -> Self {
        match value {
            Value::Null => Self::Data(Value::Null),
            Value::Object(map) => {
                if let Some(error) = map.get("error") {
                    if let Ok(shape) = serde_json::from_value::<ErrorShape>(error.clone()) {
                        return Self::Error(shape);
                    }
                }
                if map.len() == 1 {
                    if let Some(data) = map.get("data") {
                        return Self::Data(data.clone());
                    }
                    if let Some(Value::Array(input)) = map.get("input") {
                        return Self::Input(input.clone());
                    }
                }
                // Bare event payload shorthand.
                Self::Data(Value::Object(map))
            }
            other => Self::Data(other),
        }
    }

    /// Project into a [`MemoizedOp`] for the given hashed id.
    pub fn into_op(self, hashed_id: String) -> MemoizedOp {
        match self {
            Self::Data(data) => MemoizedOp::with_data(hashed_id, data),
            Self::Error(error) => MemoizedOp::with_error(hashed_id, error),
            Self::Input(input) => MemoizedOp::with_input(hashed_id, input),
        }
    }
}

impl<'de> Deserialize<'de> for MemoizedShape {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        Ok(Self::normalize(Value::deserialize(deserializer)?))
    }
}

impl ExecutorRequest {
    /// Build the per-cycle [`OpStack`] from this request.
    pub fn op_stack(&self) -> OpStack {
        let ops: HashMap<String, MemoizedOp> = self
            .steps
            .iter()
            .map(|(id, shape)| (id.clone(), shape.clone().into_op(id.clone())))
            .collect();
        let order = self
            .ctx
            .stack
            .as_ref()
            .and_then(|s| s.stack.clone())
            .unwrap_or_default();
        OpStack::new(ops, order)
    }

    /// Whether this cycle should prefer the Executor API for state.
    pub fn use_api(&self) -> bool {
        self.ctx.use_api.or(self.use_api).unwrap_or(false)
    }
}

/// The single outcome of one execution cycle. Stable wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExecutionResult {
    FunctionResolved {
        data: Value,
    },
    FunctionRejected {
        error: ErrorShape,
        retriable: Retriable,
    },
    StepsFound {
        steps: Vec<OutgoingOp>,
    },
    StepRan {
        step: OutgoingOp,
        #[serde(skip_serializing_if = "Option::is_none")]
        retriable: Option<Retriable>,
    },
    StepNotFound {
        step: OutgoingOp,
    },
}

/// A transport-agnostic HTTP response projection; serve adapters only have
/// to copy status, headers and body into their framework's response type.
#[derive(Debug, Clone, PartialEq)]
pub struct WireResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl ExecutionResult {
    /// Project this result onto the wire status-code table.
    pub fn to_wire(&self) -> WireResponse {
        match self {
            Self::FunctionResolved { data } => WireResponse {
                status: 200,
                headers: Vec::new(),
                body: data.clone(),
            },
            Self::StepsFound { steps } => WireResponse {
                status: 206,
                headers: Vec::new(),
                body: serde_json::to_value(steps).unwrap_or(Value::Null),
            },
            Self::StepRan { step, retriable } => {
                let mut headers = Vec::new();
                if let Some(Retriable::After(delay)) = retriable {
                    headers.push(("Retry-After".to_string(), delay.clone()));
                }
                WireResponse {
                    status: 206,
                    headers,
                    body: serde_json::to_value(vec![step]).unwrap_or(Value::Null),
                }
            }
            Self::StepNotFound { step } => WireResponse {
                status: 206,
                headers: Vec::new(),
                body: serde_json::to_value(vec![step]).unwrap_or(Value::Null),
            },
            Self::FunctionRejected { error, retriable } => {
                let mut headers = Vec::new();
                let status = match retriable {
                    Retriable::No => 400,
                    Retriable::Yes => 500,
                    Retriable::After(delay) => {
                        headers.push(("Retry-After".to_string(), delay.clone()));
                        500
                    }
                };
                WireResponse {
                    status,
                    headers,
                    body: serde_json::to_value(error).unwrap_or(Value::Null),
                }
            }
        }
    }
}
