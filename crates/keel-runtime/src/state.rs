//! Shared per-run state between the step tools, the scheduler and the engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;

use keel_core::error::{Error, Result, StepError};
use keel_core::id::hash_step_id;
use keel_core::op::{MemoizedOp, OpStack, OutgoingOp, StepOpCode};

use crate::ambient::ExecutingStep;

/// A step body, taken out of its [`FoundStep`] exactly once.
pub type StepBody = Box<dyn FnOnce() -> BoxFuture<'static, Result<Value>> + Send>;

/// A step the handler has requested during the current cycle.
pub struct FoundStep {
    /// Raw (possibly collision-suffixed) id.
    pub raw_id: String,
    /// Hashed id, the Executor-facing key.
    pub hashed_id: String,
    /// Opcode used when reporting this step as planned.
    pub op: StepOpCode,
    /// User-facing name with any collision suffix stripped.
    pub display_name: String,
    /// Primitive-specific name (step name, duration string, event name, …).
    pub name: String,
    pub opts: Option<Value>,
    pub input: Option<Vec<Value>>,
    /// Collision index; `None` for the first occurrence of a raw id.
    pub index: Option<u32>,
    /// Whether the Executor already holds state (input) for this step.
    pub has_step_state: bool,
    body: Mutex<Option<StepBody>>,
    resolver: Mutex<Option<oneshot::Sender<Result<Value>>>>,
    fulfilled: AtomicBool,
    handled: AtomicBool,
}

impl FoundStep {
    /// Whether this step carries a locally executable body (and it has not
    /// been taken yet).
    pub fn has_body(&self) -> bool {
        self.body.lock().map(|b| b.is_some()).unwrap_or(false)
    }

    /// Take the body for execution. Returns `None` if the step has no body
    /// or was already handled; each body runs at most once per cycle.
    pub fn take_body(&self) -> Option<StepBody> {
        let body = self.body.lock().ok()?.take();
        if body.is_some() {
            self.handled.store(true, Ordering::SeqCst);
        }
        body
    }

    /// Acknowledge the step's outcome to the handler.
    pub fn resolve(&self, outcome: Result<Value>) {
        self.fulfilled.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.resolver.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(outcome);
            }
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        self.fulfilled.load(Ordering::SeqCst)
    }

    pub fn was_handled(&self) -> bool {
        self.handled.load(Ordering::SeqCst)
    }

    /// Project this step onto an outgoing op with the given opcode.
    pub fn to_outgoing(&self, op: StepOpCode) -> OutgoingOp {
        let mut out = OutgoingOp::new(
            self.hashed_id.as_str(),
            op,
            self.display_name.as_str(),
            self.name.as_str(),
        );
        out.opts = self.opts.clone();
        if let Some(index) = self.index {
            out = out.with_index(index);
        }
        out
    }
}

impl std::fmt::Debug for FoundStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FoundStep")
            .field("raw_id", &self.raw_id)
            .field("hashed_id", &self.hashed_id)
            .field("op", &self.op)
            .field("has_step_state", &self.has_step_state)
            .field("fulfilled", &self.is_fulfilled())
            .finish()
    }
}

/// How a discovery call resolves for the caller.
pub enum Discover {
    /// Satisfied from memoized state; the awaitable settles immediately.
    Ready(Result<Value>),
    /// A genuinely pending step; the awaitable settles when (and if) the
    /// scheduler decides the step should fulfill.
    Pending(oneshot::Receiver<Result<Value>>),
}

/// Descriptor for one discovery, supplied by a tool primitive.
pub struct StepRequest {
    /// Raw id before collision suffixing.
    pub base_id: String,
    pub op: StepOpCode,
    pub display_name: String,
    pub name: String,
    pub opts: Option<Value>,
    pub body: Option<StepBody>,
}

struct RunInner {
    op_stack: OpStack,
    steps: Vec<Arc<FoundStep>>,
    new_steps: Vec<Arc<FoundStep>>,
    expected_indexes: HashMap<String, u32>,
    recently_rejected: Option<u64>,
    executing_step: Option<ExecutingStep>,
    nondeterminism_warned: bool,
    token_counter: u64,
}

/// Mutable state shared by one cycle's tools, scheduler and engine. All
/// mutation happens behind one lock; contention is nil because everything
/// runs on the engine's cooperative schedule.
pub struct RunState {
    inner: Mutex<RunInner>,
}

impl RunState {
    pub fn new(op_stack: OpStack) -> Self {
        Self {
            inner: Mutex::new(RunInner {
                op_stack,
                steps: Vec::new(),
                new_steps: Vec::new(),
                expected_indexes: HashMap::new(),
                recently_rejected: None,
                executing_step: None,
                nondeterminism_warned: false,
                token_counter: 0,
            }),
        }
    }

    /// Register one step discovery: assign the collision-suffixed raw id,
    /// satisfy it from memoized state when possible, or enqueue it for the
    /// scheduler's next report.
    pub fn discover(&self, request: StepRequest) -> Discover {
        let mut inner = self.inner.lock().expect("run state lock poisoned");

        if let Some(executing) = &inner.executing_step {
            tracing::warn!(
                outer = %executing.name,
                inner = %request.base_id,
                "step requested from inside another step body; nested steps \
                 are not supported and behave unpredictably"
            );
        }

        let next_index = *inner.expected_indexes.get(&request.base_id).unwrap_or(&0);
        let raw_id = if next_index == 0 {
            request.base_id.clone()
        } else {
            format!("{}:{next_index}", request.base_id)
        };
        inner
            .expected_indexes
            .insert(request.base_id.clone(), next_index + 1);
        let hashed_id = hash_step_id(&raw_id);

        let memoized: Option<MemoizedOp> = inner.op_stack.lookup(&hashed_id).cloned();
        if let Some(memo) = memoized {
            inner.op_stack.mark_seen(&hashed_id);
            if let Some(data) = memo.data {
                if let Some(op) = inner.op_stack.lookup_mut(&hashed_id) {
                    op.fulfilled = true;
                }
                return Discover::Ready(Ok(data));
            }
            if let Some(shape) = memo.error {
                if let Some(op) = inner.op_stack.lookup_mut(&hashed_id) {
                    op.fulfilled = true;
                }
                inner.token_counter += 1;
                let token = inner.token_counter;
                inner.recently_rejected = Some(token);
                return Discover::Ready(Err(Error::Step(StepError {
                    step_id: raw_id,
                    hashed_id,
                    shape,
                    token,
                })));
            }
            // Input-only state: the step is known to the Executor but its
            // body has not produced output; it runs when targeted.
            let (tx, rx) = oneshot::channel();
            let step = Arc::new(FoundStep {
                raw_id,
                hashed_id,
                op: request.op,
                display_name: request.display_name,
                name: request.name,
                opts: request.opts,
                input: memo.input,
                index: (next_index > 0).then_some(next_index),
                has_step_state: true,
                body: Mutex::new(request.body),
                resolver: Mutex::new(Some(tx)),
                fulfilled: AtomicBool::new(false),
                handled: AtomicBool::new(false),
            });
            inner.steps.push(step.clone());
            inner.new_steps.push(step);
            return Discover::Pending(rx);
        }

        if !inner.op_stack.all_seen() && !inner.nondeterminism_warned {
            inner.nondeterminism_warned = true;
            tracing::warn!(
                step = %raw_id,
                "new step found while memoized state remains unseen; step \
                 ordering may not be deterministic across retries"
            );
        }

        let (tx, rx) = oneshot::channel();
        let step = Arc::new(FoundStep {
            raw_id,
            hashed_id,
            op: request.op,
            display_name: request.display_name,
            name: request.name,
            opts: request.opts,
            input: None,
            index: (next_index > 0).then_some(next_index),
            has_step_state: false,
            body: Mutex::new(request.body),
            resolver: Mutex::new(Some(tx)),
            fulfilled: AtomicBool::new(false),
            handled: AtomicBool::new(false),
        });
        inner.steps.push(step.clone());
        inner.new_steps.push(step);
        Discover::Pending(rx)
    }

    /// Drain the steps discovered since the last report, in enqueue order.
    pub fn drain_new_steps(&self) -> Vec<Arc<FoundStep>> {
        let mut inner = self.inner.lock().expect("run state lock poisoned");
        std::mem::take(&mut inner.new_steps)
    }

    /// All steps found so far this cycle, in discovery order.
    pub fn found_steps(&self) -> Vec<Arc<FoundStep>> {
        self.inner
            .lock()
            .expect("run state lock poisoned")
            .steps
            .clone()
    }

    /// Steps the Executor has never seen: unfulfilled and without recorded
    /// state. These are what a `steps-found` result reports.
    pub fn new_unreported_steps(&self) -> Vec<Arc<FoundStep>> {
        self.inner
            .lock()
            .expect("run state lock poisoned")
            .steps
            .iter()
            .filter(|s| !s.is_fulfilled() && !s.has_step_state && !s.was_handled())
            .cloned()
            .collect()
    }

    /// Whether every memoized id has been rediscovered.
    pub fn all_seen(&self) -> bool {
        self.inner
            .lock()
            .expect("run state lock poisoned")
            .op_stack
            .all_seen()
    }

    /// Identity token of the most recently materialized memoized step error.
    pub fn recently_rejected(&self) -> Option<u64> {
        self.inner
            .lock()
            .expect("run state lock poisoned")
            .recently_rejected
    }

    /// Expected collision index for a raw id (next suffix to assign).
    pub fn expected_index(&self, base_id: &str) -> u32 {
        *self
            .inner
            .lock()
            .expect("run state lock poisoned")
            .expected_indexes
            .get(base_id)
            .unwrap_or(&0)
    }

    /// Publish (or clear) the step whose body is currently running.
    pub fn set_executing_step(&self, step: Option<ExecutingStep>) {
        self.inner
            .lock()
            .expect("run state lock poisoned")
            .executing_step = step;
    }
}
