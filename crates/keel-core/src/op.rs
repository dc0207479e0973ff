use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorShape;

/// Step opcodes. These are stable wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOpCode {
    StepPlanned,
    StepRun,
    StepError,
    StepFailed,
    StepNotFound,
    Sleep,
    WaitForEvent,
    InvokeFunction,
    AiGateway,
    RunComplete,
}

impl StepOpCode {
    /// Wire/log string for this opcode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepPlanned => "StepPlanned",
            Self::StepRun => "StepRun",
            Self::StepError => "StepError",
            Self::StepFailed => "StepFailed",
            Self::StepNotFound => "StepNotFound",
            Self::Sleep => "Sleep",
            Self::WaitForEvent => "WaitForEvent",
            Self::InvokeFunction => "InvokeFunction",
            Self::AiGateway => "AiGateway",
            Self::RunComplete => "RunComplete",
        }
    }
}

/// A memoized step result reconstructed from Executor input.
///
/// `data` and `error` are mutually exclusive; both absent means only the
/// step's input was recorded and its body has not produced output yet.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoizedOp {
    /// Hashed step id.
    pub id: String,
    /// Recorded output data. `Some(Value::Null)` is a defined null result
    /// (sleep completions, wait timeouts) and is distinct from absent.
    pub data: Option<Value>,
    /// Recorded error.
    pub error: Option<ErrorShape>,
    /// Recorded invocation input, when the Executor planned the step
    /// without running it yet.
    pub input: Option<Vec<Value>>,
    /// Whether the handler has rediscovered this op during the current cycle.
    pub seen: bool,
    /// Whether the recorded output has been consumed by the handler.
    pub fulfilled: bool,
}

impl MemoizedOp {
    /// An op carrying recorded output data.
    pub fn with_data(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data: Some(data),
            error: None,
            input: None,
            seen: false,
            fulfilled: false,
        }
    }

    /// An op carrying a recorded error.
    pub fn with_error(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            id: id.into(),
            data: None,
            error: Some(error),
            input: None,
            seen: false,
            fulfilled: false,
        }
    }

    /// An op carrying recorded input only (planned, not yet run).
    pub fn with_input(id: impl Into<String>, input: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            data: None,
            error: None,
            input: Some(input),
            seen: false,
            fulfilled: false,
        }
    }

    /// Whether this op carries consumable output (data or error).
    pub fn has_output(&self) -> bool {
        self.data.is_some() || self.error.is_some()
    }
}

/// The per-cycle memoized state: ops keyed by hashed id, the Executor's
/// recorded completion order, and the set of ids the handler has not yet
/// rediscovered this cycle.
#[derive(Debug, Clone, Default)]
pub struct OpStack {
    ops: HashMap<String, MemoizedOp>,
    order: Vec<String>,
    remaining: HashSet<String>,
}

impl OpStack {
    /// Build a stack from memoized ops and the recorded completion order.
    ///
    /// When the Executor sends no order vector, the op id set itself is used
    /// as the remaining-to-be-seen set.
    pub fn new(ops: HashMap<String, MemoizedOp>, order: Vec<String>) -> Self {
        let remaining: HashSet<String> = if order.is_empty() {
            ops.keys().cloned().collect()
        } else {
            order.iter().cloned().collect()
        };
        Self {
            ops,
            order,
            remaining,
        }
    }

    /// Look up a memoized op by hashed id.
    pub fn lookup(&self, hashed_id: &str) -> Option<&MemoizedOp> {
        self.ops.get(hashed_id)
    }

    /// Mutable lookup, used by the tools layer to flip `seen`/`fulfilled`.
    pub fn lookup_mut(&mut self, hashed_id: &str) -> Option<&mut MemoizedOp> {
        self.ops.get_mut(hashed_id)
    }

    /// Remove an id from the remaining-to-be-seen set.
    pub fn mark_seen(&mut self, hashed_id: &str) {
        self.remaining.remove(hashed_id);
        if let Some(op) = self.ops.get_mut(hashed_id) {
            op.seen = true;
        }
    }

    /// True once every recorded id has been rediscovered.
    pub fn all_seen(&self) -> bool {
        self.remaining.is_empty()
    }

    /// Number of memoized ops.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the stack holds no memoized state at all.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The Executor's recorded completion order.
    pub fn order(&self) -> &[String] {
        &self.order
    }
}

/// Parallel-index metadata attached to collided step ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Userland {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

/// The externally visible description of a step in a cycle's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingOp {
    /// Hashed step id.
    pub id: String,
    /// Opcode.
    pub op: StepOpCode,
    /// User-facing display name (collision suffix stripped).
    #[serde(rename = "displayName")]
    pub display_name: String,
    /// Primitive-specific name: the step name for `run`, the duration string
    /// for `sleep`, the event name for `waitForEvent`, and so on.
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opts: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub userland: Option<Userland>,
}

impl OutgoingOp {
    /// Create an op with no payload fields set.
    pub fn new(
        id: impl Into<String>,
        op: StepOpCode,
        display_name: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            op,
            display_name: display_name.into(),
            name: name.into(),
            opts: None,
            data: None,
            error: None,
            userland: None,
        }
    }

    /// The synthetic marker translating a handler's successful return into a
    /// buffered completion.
    pub fn run_complete(data: Value) -> Self {
        let mut op = Self::new(
            crate::id::hash_step_id("run-complete"),
            StepOpCode::RunComplete,
            "run-complete",
            "run-complete",
        );
        op.data = Some(data);
        op
    }

    /// Attach opts.
    pub fn with_opts(mut self, opts: Value) -> Self {
        self.opts = Some(opts);
        self
    }

    /// Attach a parallel index.
    pub fn with_index(mut self, index: u32) -> Self {
        self.userland = Some(Userland { index: Some(index) });
        self
    }
}
