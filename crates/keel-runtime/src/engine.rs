//! The execution engine: one instance drives one cycle of one run.
//!
//! Given the handler, the triggering event, the memoized op stack and an
//! optional target step, `start()` replays the handler, reacts to scheduler
//! checkpoints, possibly executes one step (or, in checkpointing mode, many),
//! and produces a single [`ExecutionResult`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use keel_core::error::{Error, Retriable};
use keel_core::event::EventPayload;
use keel_core::executor::{Checkpointer, EventSender, EventValidator, NewRunRequest};
use keel_core::middleware::{HandlerInput, MiddlewareStack, OutputTransform};
use keel_core::op::{OpStack, OutgoingOp, StepOpCode};
use keel_core::wire::{ExecutionResult, ExecutorRequest};

use crate::ambient::{self, ExecutingStep, ExecutionScope};
use crate::checkpoint::{
    attempt_checkpoint_and_resume, register_new_run, CheckpointBuffer, CheckpointRoute,
    CheckpointSettings, CheckpointTransport, FlushOutcome, StepCheckpointer,
};
use crate::handler::{FunctionSpec, HandlerCtx};
use crate::scheduler::{Checkpoint, Driver};
use crate::state::{FoundStep, RunState};
use crate::tools::StepHandle;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// App id used for run registration.
    pub app_id: String,
    /// How long to wait for the targeted step to surface before reporting
    /// `step-not-found`.
    pub target_step_timeout: Duration,
    /// Allow executing a lone newly-planned step without a round-trip.
    pub immediate_execution: bool,
    /// Enables checkpointing mode when set.
    pub checkpointing: Option<CheckpointSettings>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            app_id: "app".to_string(),
            target_step_timeout: Duration::from_secs(10),
            immediate_execution: false,
            checkpointing: None,
        }
    }
}

/// Per-cycle inputs decoded from the Executor request.
#[derive(Clone)]
pub struct CycleInputs {
    pub run_id: String,
    pub attempt: u32,
    pub event: EventPayload,
    pub events: Vec<EventPayload>,
    pub op_stack: OpStack,
    /// Hashed id of the step the Executor wants run this cycle.
    pub target_step_id: Option<String>,
    pub disable_immediate_execution: bool,
}

impl CycleInputs {
    /// Decode from a parsed request body plus the adapter-supplied target.
    pub fn from_request(request: &ExecutorRequest, target_step_id: Option<String>) -> Self {
        Self {
            run_id: request.ctx.run_id.clone(),
            attempt: request.ctx.attempt,
            event: request.event.clone(),
            events: if request.events.is_empty() {
                vec![request.event.clone()]
            } else {
                request.events.clone()
            },
            op_stack: request.op_stack(),
            target_step_id,
            disable_immediate_execution: request.ctx.disable_immediate_execution,
        }
    }
}

/// Single-use engine bound to one (run, attempt) cycle.
pub struct ExecutionEngine {
    function: Arc<FunctionSpec>,
    inputs: CycleInputs,
    middleware: MiddlewareStack,
    events: Arc<dyn EventSender>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    validator: Option<Arc<dyn EventValidator>>,
    settings: EngineSettings,
    settled: Mutex<Option<ExecutionResult>>,
}

/// Aborts the driver task when the cycle ends, leaving any still-pending
/// handler awaitables unsettled.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum Waited {
    Checkpoint(Checkpoint),
    TimedOut,
    Closed,
}

enum Advance {
    Continue,
    Done(ExecutionResult),
}

impl ExecutionEngine {
    pub fn new(
        function: Arc<FunctionSpec>,
        inputs: CycleInputs,
        middleware: MiddlewareStack,
        events: Arc<dyn EventSender>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            function,
            inputs,
            middleware,
            events,
            checkpointer: None,
            validator: None,
            settings,
            settled: Mutex::new(None),
        }
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn EventValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Run the cycle. Idempotent: repeated calls return the same settled
    /// result without re-running the handler.
    pub async fn start(&self) -> ExecutionResult {
        let mut settled = self.settled.lock().await;
        if let Some(result) = settled.as_ref() {
            return result.clone();
        }
        let result = self.run_cycle().await;
        self.middleware.before_response().await;
        *settled = Some(result.clone());
        result
    }

    async fn run_cycle(&self) -> ExecutionResult {
        let mut input = HandlerInput {
            event: self.inputs.event.clone(),
            events: self.inputs.events.clone(),
            run_id: self.inputs.run_id.clone(),
            attempt: self.inputs.attempt,
        };
        self.middleware.transform_input(&mut input).await;

        if let Some(validator) = &self.validator {
            if let Err(err) = validator.validate(&input.event) {
                let mut out = OutputTransform::error(err.to_shape());
                self.middleware.transform_output(&mut out).await;
                return ExecutionResult::FunctionRejected {
                    error: out.error.unwrap_or_else(|| err.to_shape()),
                    retriable: Retriable::No,
                };
            }
        }

        let mut flusher = self.setup_checkpointing(&input).await;

        self.middleware.before_memoization().await;
        let state = Arc::new(RunState::new(self.inputs.op_stack.clone()));
        if state.all_seen() {
            self.middleware.after_memoization().await;
            self.middleware.before_execution().await;
        }

        let scope = ExecutionScope::new(
            input.run_id.as_str(),
            input.attempt,
            self.function.opts.id.as_str(),
        );
        let step = StepHandle::new(state.clone(), self.events.clone(), self.middleware.clone());
        let ctx = HandlerCtx {
            event: input.event.clone(),
            events: input.events.clone(),
            run_id: input.run_id.clone(),
            attempt: input.attempt,
            step,
        };
        let handler = (self.function.handler())(ctx);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let driver = Driver::new(handler, state.clone(), tx);
        let _guard = AbortOnDrop(tokio::spawn(ambient::with_scope(scope.clone(), driver)));

        loop {
            let checkpoint = match self.wait_checkpoint(&mut rx).await {
                Waited::Checkpoint(c) => c,
                Waited::TimedOut => {
                    let target = self
                        .inputs
                        .target_step_id
                        .clone()
                        .unwrap_or_default();
                    return ExecutionResult::StepNotFound {
                        step: OutgoingOp::new(
                            target.as_str(),
                            StepOpCode::StepNotFound,
                            target.as_str(),
                            target.as_str(),
                        ),
                    };
                }
                Waited::Closed => {
                    let error = Error::InvalidState(
                        "handler ended without producing a result".to_string(),
                    );
                    return ExecutionResult::FunctionRejected {
                        error: error.to_shape(),
                        retriable: Retriable::Yes,
                    };
                }
            };

            match checkpoint {
                Checkpoint::FunctionResolved { data } => {
                    let mut out = OutputTransform::data(data);
                    self.middleware.transform_output(&mut out).await;
                    let data = out.data.unwrap_or(Value::Null);

                    if let Some((buffer, cp)) = flusher.as_mut() {
                        let marker = OutgoingOp::run_complete(data.clone());
                        match attempt_checkpoint_and_resume(buffer, cp, Some(marker), true).await {
                            FlushOutcome::Fallback(snapshot) => {
                                return ExecutionResult::StepsFound { steps: snapshot };
                            }
                            _ => {}
                        }
                    }
                    self.middleware.finished().await;
                    return ExecutionResult::FunctionResolved { data };
                }
                Checkpoint::FunctionRejected { error } => {
                    if let Some((buffer, cp)) = flusher.as_mut() {
                        if let FlushOutcome::Fallback(snapshot) =
                            attempt_checkpoint_and_resume(buffer, cp, None, true).await
                        {
                            return ExecutionResult::StepsFound { steps: snapshot };
                        }
                    }
                    let retriable = self.classify_rejection(&error, &state);
                    let mut out = OutputTransform::error(error.to_shape());
                    self.middleware.transform_output(&mut out).await;
                    self.middleware.finished().await;
                    return ExecutionResult::FunctionRejected {
                        error: out.error.unwrap_or_else(|| error.to_shape()),
                        retriable,
                    };
                }
                Checkpoint::StepsFound { steps } => {
                    if state.all_seen() {
                        self.middleware.after_memoization().await;
                    }

                    if let Some(target) = self.inputs.target_step_id.as_deref() {
                        match steps.iter().find(|s| s.hashed_id == target) {
                            Some(step) if step.has_body() => {
                                return self.execute_step_result(step, &state, &scope).await;
                            }
                            Some(_) => {
                                // A body-less match cannot run locally; fall
                                // through and re-report so the Executor can
                                // re-plan.
                            }
                            None => continue,
                        }
                    }

                    if let Some((buffer, cp)) = flusher.as_mut() {
                        match self
                            .advance_checkpointing(&steps, &state, &scope, buffer, cp)
                            .await
                        {
                            Advance::Continue => continue,
                            Advance::Done(result) => return result,
                        }
                    }

                    let new_steps = state.new_unreported_steps();
                    if new_steps.len() == 1
                        && new_steps[0].has_body()
                        && self.inputs.target_step_id.is_none()
                        && self.settings.immediate_execution
                        && !self.inputs.disable_immediate_execution
                    {
                        return self.execute_step_result(&new_steps[0], &state, &scope).await;
                    }

                    let report = if new_steps.is_empty() {
                        steps.clone()
                    } else {
                        new_steps
                    };
                    self.middleware.after_memoization().await;
                    self.middleware.before_execution().await;
                    self.middleware.after_execution().await;
                    let ops = self.outgoing_report(&report).await;
                    return ExecutionResult::StepsFound { steps: ops };
                }
            }
        }
    }

    /// Resolve checkpointing for this cycle, if configured. Registration
    /// failures (Sync transport) downgrade the cycle to plain request mode.
    async fn setup_checkpointing(
        &self,
        input: &HandlerInput,
    ) -> Option<(CheckpointBuffer, StepCheckpointer)> {
        let settings = self.settings.checkpointing.as_ref()?;
        let client = self.checkpointer.as_ref()?;
        if self.inputs.target_step_id.is_some() {
            return None;
        }

        let route = match &settings.transport {
            CheckpointTransport::Async {
                internal_fn_id,
                queue_item_id,
            } => CheckpointRoute::Async {
                internal_fn_id: internal_fn_id.clone(),
                queue_item_id: queue_item_id.clone(),
            },
            CheckpointTransport::Sync { app_id, fn_id } => {
                let request = NewRunRequest {
                    run_id: input.run_id.clone(),
                    app_id: app_id.clone(),
                    fn_id: fn_id.clone(),
                    event: input.event.clone(),
                };
                match register_new_run(client, &settings.policy, request).await {
                    Ok(resp) => CheckpointRoute::Sync { token: resp.token },
                    Err(e) => {
                        tracing::warn!(
                            run_id = %input.run_id,
                            error = %e,
                            "run registration failed, continuing without checkpointing"
                        );
                        return None;
                    }
                }
            }
        };

        let buffer = CheckpointBuffer::new(settings);
        let checkpointer = StepCheckpointer::new(
            client.clone(),
            settings.policy.clone(),
            input.run_id.clone(),
            route,
        );
        Some((buffer, checkpointer))
    }

    async fn wait_checkpoint(&self, rx: &mut mpsc::UnboundedReceiver<Checkpoint>) -> Waited {
        if self.inputs.target_step_id.is_some() {
            match tokio::time::timeout(self.settings.target_step_timeout, rx.recv()).await {
                Ok(Some(checkpoint)) => Waited::Checkpoint(checkpoint),
                Ok(None) => Waited::Closed,
                Err(_) => Waited::TimedOut,
            }
        } else {
            match rx.recv().await {
                Some(checkpoint) => Waited::Checkpoint(checkpoint),
                None => Waited::Closed,
            }
        }
    }

    /// Execute one step body and produce the cycle's `step-ran` result.
    async fn execute_step_result(
        &self,
        step: &Arc<FoundStep>,
        state: &Arc<RunState>,
        scope: &ExecutionScope,
    ) -> ExecutionResult {
        self.middleware.after_memoization().await;
        self.middleware.before_execution().await;
        let outcome = self.invoke_body(step, state, scope).await;
        self.middleware.after_execution().await;

        match outcome {
            Ok(data) => {
                let mut out = OutputTransform::data(data);
                self.middleware.transform_output(&mut out).await;
                let mut op = step.to_outgoing(StepOpCode::StepRun);
                op.data = Some(out.data.unwrap_or(Value::Null));
                ExecutionResult::StepRan {
                    step: op,
                    retriable: None,
                }
            }
            Err(error) => {
                let retriable = self.classify_step_failure(&error);
                let mut out = OutputTransform::error(error.to_shape());
                self.middleware.transform_output(&mut out).await;
                let opcode = if retriable == Retriable::No {
                    StepOpCode::StepFailed
                } else {
                    StepOpCode::StepError
                };
                let mut op = step.to_outgoing(opcode);
                op.error = Some(out.error.unwrap_or_else(|| error.to_shape()));
                ExecutionResult::StepRan {
                    step: op,
                    retriable: Some(retriable),
                }
            }
        }
    }

    /// Drive one checkpointing-mode batch: execute a lone step inline, or
    /// flush and report parallel/plan-only steps.
    async fn advance_checkpointing(
        &self,
        batch: &[Arc<FoundStep>],
        state: &Arc<RunState>,
        scope: &ExecutionScope,
        buffer: &mut CheckpointBuffer,
        checkpointer: &StepCheckpointer,
    ) -> Advance {
        let new_steps: Vec<Arc<FoundStep>> = batch
            .iter()
            .filter(|s| !s.is_fulfilled() && !s.was_handled())
            .cloned()
            .collect();
        if new_steps.is_empty() {
            return Advance::Continue;
        }

        if new_steps.len() == 1 && new_steps[0].has_body() {
            let step = &new_steps[0];
            self.middleware.after_memoization().await;
            self.middleware.before_execution().await;
            let outcome = self.invoke_body(step, state, scope).await;
            self.middleware.after_execution().await;

            return match outcome {
                Ok(data) => {
                    let mut out = OutputTransform::data(data);
                    self.middleware.transform_output(&mut out).await;
                    let data = out.data.unwrap_or(Value::Null);
                    let mut op = step.to_outgoing(StepOpCode::StepRun);
                    op.data = Some(data.clone());
                    match attempt_checkpoint_and_resume(buffer, checkpointer, Some(op), false).await
                    {
                        FlushOutcome::Fallback(snapshot) => {
                            // The completion stays unacknowledged; it reaches
                            // the Executor inside the fallback instead.
                            Advance::Done(ExecutionResult::StepsFound { steps: snapshot })
                        }
                        _ => {
                            step.resolve(Ok(data));
                            Advance::Continue
                        }
                    }
                }
                Err(error) => {
                    // Preceding completions must land before the error is
                    // reported; the failing step itself re-runs next cycle.
                    if let FlushOutcome::Fallback(snapshot) =
                        attempt_checkpoint_and_resume(buffer, checkpointer, None, true).await
                    {
                        return Advance::Done(ExecutionResult::StepsFound { steps: snapshot });
                    }
                    let retriable = self.classify_step_failure(&error);
                    let mut out = OutputTransform::error(error.to_shape());
                    self.middleware.transform_output(&mut out).await;
                    let opcode = if retriable == Retriable::No {
                        StepOpCode::StepFailed
                    } else {
                        StepOpCode::StepError
                    };
                    let mut op = step.to_outgoing(opcode);
                    op.error = Some(out.error.unwrap_or_else(|| error.to_shape()));
                    Advance::Done(ExecutionResult::StepRan {
                        step: op,
                        retriable: Some(retriable),
                    })
                }
            };
        }

        // Parallel (or plan-only) discovery: land buffered completions first,
        // then hand the new steps back to the Executor. On flush failure the
        // fallback carries only the completions; the Executor rediscovers the
        // new steps on the next invocation.
        if let FlushOutcome::Fallback(snapshot) =
            attempt_checkpoint_and_resume(buffer, checkpointer, None, true).await
        {
            return Advance::Done(ExecutionResult::StepsFound { steps: snapshot });
        }
        self.middleware.after_memoization().await;
        self.middleware.before_execution().await;
        self.middleware.after_execution().await;
        let ops = self.outgoing_report(&new_steps).await;
        Advance::Done(ExecutionResult::StepsFound { steps: ops })
    }

    async fn invoke_body(
        &self,
        step: &Arc<FoundStep>,
        state: &Arc<RunState>,
        scope: &ExecutionScope,
    ) -> keel_core::Result<Value> {
        let Some(body) = step.take_body() else {
            return Err(Error::InvalidState(format!(
                "step '{}' has no executable body",
                step.raw_id
            )));
        };
        let info = ExecutingStep {
            id: step.hashed_id.clone(),
            name: step.display_name.clone(),
        };
        state.set_executing_step(Some(info.clone()));
        scope.set_executing_step(Some(info));
        let outcome = ambient::with_scope(scope.clone(), body()).await;
        state.set_executing_step(None);
        scope.set_executing_step(None);
        outcome
    }

    fn classify_rejection(&self, error: &Error, state: &Arc<RunState>) -> Retriable {
        if let Error::Step(step_err) = error {
            // A re-thrown memoized step error must not trigger a retry storm.
            if state.recently_rejected() == Some(step_err.token) {
                return Retriable::No;
            }
        }
        error.retriable()
    }

    fn classify_step_failure(&self, error: &Error) -> Retriable {
        if matches!(error, Error::NonRetriable { .. })
            || self.inputs.attempt + 1 >= self.function.opts.max_attempts()
        {
            return Retriable::No;
        }
        match error {
            Error::RetryAfter { delay, .. } => Retriable::After(delay.clone()),
            _ => Retriable::Yes,
        }
    }

    /// Project found steps onto outgoing ops, applying the send-event hooks
    /// to invocation payloads.
    async fn outgoing_report(&self, steps: &[Arc<FoundStep>]) -> Vec<OutgoingOp> {
        let mut ops = Vec::with_capacity(steps.len());
        for step in steps {
            let mut op = step.to_outgoing(step.op);
            if step.op == StepOpCode::InvokeFunction {
                self.apply_send_hooks(&mut op).await;
            }
            ops.push(op);
        }
        ops
    }

    async fn apply_send_hooks(&self, op: &mut OutgoingOp) {
        let Some(opts) = op.opts.as_mut() else { return };
        let Some(payload) = opts.get("payload").filter(|p| !p.is_null()).cloned() else {
            return;
        };
        let mut payloads = vec![EventPayload::new(op.name.clone(), payload)];
        self.middleware.on_send_event(&mut payloads).await;
        if let Some(rewritten) = payloads.into_iter().next() {
            opts["payload"] = rewritten.data;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use keel_core::function::{FunctionOpts, Trigger};
    use keel_core::id::hash_step_id;
    use keel_core::retry::RetryPolicy;
    use keel_core::wire::MemoizedShape;

    use crate::testing::{MockCheckpointer, MockEventSender};

    fn op_stack_from(entries: &[(&str, Value)]) -> OpStack {
        let mut ops = HashMap::new();
        let mut order = Vec::new();
        for (raw, value) in entries {
            let hashed = hash_step_id(raw);
            ops.insert(
                hashed.clone(),
                MemoizedShape::normalize(value.clone()).into_op(hashed.clone()),
            );
            order.push(hashed);
        }
        OpStack::new(ops, order)
    }

    fn inputs_with(entries: &[(&str, Value)], target: Option<&str>) -> CycleInputs {
        CycleInputs {
            run_id: "run-1".to_string(),
            attempt: 0,
            event: EventPayload::new("test/started", serde_json::json!({"n": 1})),
            events: vec![EventPayload::new("test/started", serde_json::json!({"n": 1}))],
            op_stack: op_stack_from(entries),
            target_step_id: target.map(|t| t.to_string()),
            disable_immediate_execution: false,
        }
    }

    fn engine(spec: FunctionSpec, inputs: CycleInputs) -> ExecutionEngine {
        ExecutionEngine::new(
            Arc::new(spec),
            inputs,
            MiddlewareStack::new(),
            Arc::new(MockEventSender::default()),
            EngineSettings::default(),
        )
    }

    fn seq_spec() -> FunctionSpec {
        FunctionSpec::new(
            FunctionOpts::new("seq").with_trigger(Trigger::event("test/started")),
            |ctx| async move {
                let r1: String = ctx
                    .step
                    .run("seq-1", || async { Ok("r1".to_string()) })
                    .await?;
                let r2: String = ctx
                    .step
                    .run("seq-2", || async { Ok("r2".to_string()) })
                    .await?;
                assert_eq!((r1.as_str(), r2.as_str()), ("r1", "r2"));
                Ok(serde_json::json!("done"))
            },
        )
    }

    fn parallel_spec() -> FunctionSpec {
        FunctionSpec::new(
            FunctionOpts::new("par").with_trigger(Trigger::event("test/started")),
            |ctx| async move {
                let a = ctx.step.run("a", || async { Ok(serde_json::json!("ra")) });
                let b = ctx.step.run("b", || async { Ok(serde_json::json!("rb")) });
                let (a, b) = futures::join!(a, b);
                let _ = (a?, b?);
                Ok(serde_json::json!("joined"))
            },
        )
    }

    // S1: plain sequential steps across three cycles.
    #[tokio::test]
    async fn test_sequential_first_cycle_plans_first_step() {
        let result = engine(seq_spec(), inputs_with(&[], None)).start().await;
        match result {
            ExecutionResult::StepsFound { steps } => {
                assert_eq!(steps.len(), 1);
                assert_eq!(steps[0].id, hash_step_id("seq-1"));
                assert_eq!(steps[0].op, StepOpCode::StepPlanned);
                assert_eq!(steps[0].display_name, "seq-1");
            }
            other => panic!("expected steps-found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sequential_second_cycle_plans_second_step() {
        let result = engine(
            seq_spec(),
            inputs_with(&[("seq-1", serde_json::json!({"data": "r1"}))], None),
        )
        .start()
        .await;
        match result {
            ExecutionResult::StepsFound { steps } => {
                assert_eq!(steps.len(), 1);
                assert_eq!(steps[0].id, hash_step_id("seq-2"));
            }
            other => panic!("expected steps-found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sequential_final_cycle_resolves() {
        let result = engine(
            seq_spec(),
            inputs_with(
                &[
                    ("seq-1", serde_json::json!({"data": "r1"})),
                    ("seq-2", serde_json::json!({"data": "r2"})),
                ],
                None,
            ),
        )
        .start()
        .await;
        assert_eq!(
            result,
            ExecutionResult::FunctionResolved {
                data: serde_json::json!("done")
            }
        );
    }

    // S2: parallel discovery reports both steps in enqueue order.
    #[tokio::test]
    async fn test_parallel_discovery_in_enqueue_order() {
        let result = engine(parallel_spec(), inputs_with(&[], None)).start().await;
        match result {
            ExecutionResult::StepsFound { steps } => {
                assert_eq!(steps.len(), 2);
                assert_eq!(steps[0].id, hash_step_id("a"));
                assert_eq!(steps[1].id, hash_step_id("b"));
            }
            other => panic!("expected steps-found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_parallel_resolves_when_memoized() {
        let result = engine(
            parallel_spec(),
            inputs_with(
                &[
                    ("a", serde_json::json!({"data": "ra"})),
                    ("b", serde_json::json!({"data": "rb"})),
                ],
                None,
            ),
        )
        .start()
        .await;
        assert_eq!(
            result,
            ExecutionResult::FunctionResolved {
                data: serde_json::json!("joined")
            }
        );
    }

    // S3: same-name parallel collision gets deterministic suffixes.
    #[tokio::test]
    async fn test_same_name_collision_suffixes() {
        let spec = FunctionSpec::new(
            FunctionOpts::new("dup").with_trigger(Trigger::event("test/started")),
            |ctx| async move {
                let a = ctx.step.run("x", || async { Ok(serde_json::json!(1)) });
                let b = ctx.step.run("x", || async { Ok(serde_json::json!(2)) });
                let _ = futures::join!(a, b);
                Ok(Value::Null)
            },
        );
        let result = engine(spec, inputs_with(&[], None)).start().await;
        match result {
            ExecutionResult::StepsFound { steps } => {
                assert_eq!(steps[0].id, hash_step_id("x"));
                assert_eq!(steps[1].id, hash_step_id("x:1"));
                assert_eq!(steps[1].userland.unwrap().index, Some(1));
            }
            other => panic!("expected steps-found, got {other:?}"),
        }
    }

    // S4: a non-retriable step error surfaces as StepFailed.
    #[tokio::test]
    async fn test_non_retriable_step_failure() {
        let spec = FunctionSpec::new(
            FunctionOpts::new("bad").with_trigger(Trigger::event("test/started")),
            |ctx| async move {
                let _: Value = ctx
                    .step
                    .run("explode", || async {
                        Err(Error::non_retriable("kaboom"))
                    })
                    .await?;
                Ok(Value::Null)
            },
        );
        let target = hash_step_id("explode");
        let result = engine(spec, inputs_with(&[], Some(&target))).start().await;
        match result {
            ExecutionResult::StepRan { step, retriable } => {
                assert_eq!(step.op, StepOpCode::StepFailed);
                assert_eq!(step.error.as_ref().unwrap().message, "kaboom");
                assert_eq!(retriable, Some(Retriable::No));
            }
            other => panic!("expected step-ran, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_after_step_failure() {
        let spec = FunctionSpec::new(
            FunctionOpts::new("busy").with_trigger(Trigger::event("test/started")),
            |ctx| async move {
                let _: Value = ctx
                    .step
                    .run("throttled", || async {
                        Err(Error::retry_after("5m", "rate limited"))
                    })
                    .await?;
                Ok(Value::Null)
            },
        );
        let target = hash_step_id("throttled");
        let result = engine(spec, inputs_with(&[], Some(&target))).start().await;
        match result {
            ExecutionResult::StepRan { step, retriable } => {
                assert_eq!(step.op, StepOpCode::StepError);
                assert_eq!(retriable, Some(Retriable::After("5m".to_string())));
            }
            other => panic!("expected step-ran, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_last_attempt_exhausts_retries() {
        let spec = FunctionSpec::new(
            FunctionOpts::new("flaky")
                .with_trigger(Trigger::event("test/started"))
                .with_retries(3),
            |ctx| async move {
                let _: Value = ctx
                    .step
                    .run("wobbly", || async {
                        Err(Error::Handler("transient".into()))
                    })
                    .await?;
                Ok(Value::Null)
            },
        );
        let target = hash_step_id("wobbly");
        let mut inputs = inputs_with(&[], Some(&target));
        inputs.attempt = 3; // attempt + 1 == max_attempts
        let result = engine(spec, inputs).start().await;
        match result {
            ExecutionResult::StepRan { step, retriable } => {
                assert_eq!(step.op, StepOpCode::StepFailed);
                assert_eq!(retriable, Some(Retriable::No));
            }
            other => panic!("expected step-ran, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_targeted_step_runs_and_returns_data() {
        let spec = seq_spec();
        let target = hash_step_id("seq-1");
        let result = engine(spec, inputs_with(&[], Some(&target))).start().await;
        match result {
            ExecutionResult::StepRan { step, retriable } => {
                assert_eq!(step.op, StepOpCode::StepRun);
                assert_eq!(step.data, Some(serde_json::json!("r1")));
                assert_eq!(retriable, None);
            }
            other => panic!("expected step-ran, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_targeted_step_with_recorded_input_runs() {
        let target = hash_step_id("seq-1");
        let result = engine(
            seq_spec(),
            inputs_with(
                &[("seq-1", serde_json::json!({"input": []}))],
                Some(&target),
            ),
        )
        .start()
        .await;
        match result {
            ExecutionResult::StepRan { step, .. } => {
                assert_eq!(step.id, target);
                assert_eq!(step.data, Some(serde_json::json!("r1")));
            }
            other => panic!("expected step-ran, got {other:?}"),
        }
    }

    // Invariant 8: an absent target times out into step-not-found.
    #[tokio::test]
    async fn test_target_step_timeout() {
        let spec = FunctionSpec::new(
            FunctionOpts::new("idle").with_trigger(Trigger::event("test/started")),
            |_ctx| async move {
                futures::future::pending::<()>().await;
                Ok(Value::Null)
            },
        );
        let target = hash_step_id("never-appears");
        let mut settings = EngineSettings::default();
        settings.target_step_timeout = Duration::from_millis(50);
        let engine = ExecutionEngine::new(
            Arc::new(spec),
            inputs_with(&[], Some(&target)),
            MiddlewareStack::new(),
            Arc::new(MockEventSender::default()),
            settings,
        );
        match engine.start().await {
            ExecutionResult::StepNotFound { step } => {
                assert_eq!(step.id, target);
                assert_eq!(step.op, StepOpCode::StepNotFound);
            }
            other => panic!("expected step-not-found, got {other:?}"),
        }
    }

    // S8: a re-thrown memoized step error is not retriable.
    #[tokio::test]
    async fn test_memoized_error_rethrow_is_not_retriable() {
        let spec = FunctionSpec::new(
            FunctionOpts::new("rethrow").with_trigger(Trigger::event("test/started")),
            |ctx| async move {
                let _: Value = ctx.step.run("x", || async { Ok(Value::Null) }).await?;
                Ok(Value::Null)
            },
        );
        let result = engine(
            spec,
            inputs_with(
                &[("x", serde_json::json!({"error": {"name": "E", "message": "boom"}}))],
                None,
            ),
        )
        .start()
        .await;
        match result {
            ExecutionResult::FunctionRejected { error, retriable } => {
                assert_eq!(error.name, "E");
                assert_eq!(error.message, "boom");
                assert_eq!(retriable, Retriable::No);
            }
            other => panic!("expected function-rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_caught_memoized_error_then_fresh_error_is_retriable() {
        let spec = FunctionSpec::new(
            FunctionOpts::new("catcher").with_trigger(Trigger::event("test/started")),
            |ctx| async move {
                let outcome: keel_core::Result<Value> =
                    ctx.step.run("x", || async { Ok(Value::Null) }).await;
                assert!(outcome.is_err());
                Err(Error::Handler("different failure".into()))
            },
        );
        let result = engine(
            spec,
            inputs_with(
                &[("x", serde_json::json!({"error": {"name": "E", "message": "boom"}}))],
                None,
            ),
        )
        .start()
        .await;
        match result {
            ExecutionResult::FunctionRejected { retriable, .. } => {
                assert_eq!(retriable, Retriable::Yes);
            }
            other => panic!("expected function-rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_rejection_before_any_step() {
        let spec = FunctionSpec::new(
            FunctionOpts::new("early").with_trigger(Trigger::event("test/started")),
            |_ctx| async move { Err(Error::Handler("immediate".into())) },
        );
        let result = engine(spec, inputs_with(&[], None)).start().await;
        match result {
            ExecutionResult::FunctionRejected { retriable, .. } => {
                assert_eq!(retriable, Retriable::Yes);
            }
            other => panic!("expected function-rejected, got {other:?}"),
        }
    }

    // Invariant 1: repeated starts return the settled result.
    #[tokio::test]
    async fn test_start_is_idempotent() {
        let eng = engine(seq_spec(), inputs_with(&[], None));
        let first = eng.start().await;
        let second = eng.start().await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_replay_is_deterministic_across_instances() {
        let entries = [("seq-1", serde_json::json!({"data": "r1"}))];
        let a = engine(seq_spec(), inputs_with(&entries, None)).start().await;
        let b = engine(seq_spec(), inputs_with(&entries, None)).start().await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_immediate_execution_elides_round_trip() {
        let mut settings = EngineSettings::default();
        settings.immediate_execution = true;
        let engine = ExecutionEngine::new(
            Arc::new(seq_spec()),
            inputs_with(&[], None),
            MiddlewareStack::new(),
            Arc::new(MockEventSender::default()),
            settings,
        );
        match engine.start().await {
            ExecutionResult::StepRan { step, .. } => {
                assert_eq!(step.id, hash_step_id("seq-1"));
                assert_eq!(step.data, Some(serde_json::json!("r1")));
            }
            other => panic!("expected step-ran, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disable_immediate_execution_flag_wins() {
        let mut settings = EngineSettings::default();
        settings.immediate_execution = true;
        let mut inputs = inputs_with(&[], None);
        inputs.disable_immediate_execution = true;
        let engine = ExecutionEngine::new(
            Arc::new(seq_spec()),
            inputs,
            MiddlewareStack::new(),
            Arc::new(MockEventSender::default()),
            settings,
        );
        match engine.start().await {
            ExecutionResult::StepsFound { steps } => {
                assert_eq!(steps[0].op, StepOpCode::StepPlanned);
            }
            other => panic!("expected steps-found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sleep_reports_planned_op() {
        let spec = FunctionSpec::new(
            FunctionOpts::new("sleepy").with_trigger(Trigger::event("test/started")),
            |ctx| async move {
                ctx.step.sleep(Duration::from_secs(3600)).await?;
                Ok(Value::Null)
            },
        );
        let result = engine(spec, inputs_with(&[], None)).start().await;
        match result {
            ExecutionResult::StepsFound { steps } => {
                assert_eq!(steps[0].op, StepOpCode::Sleep);
                assert_eq!(steps[0].name, "1h");
                assert_eq!(steps[0].opts.as_ref().unwrap()["duration"], "1h");
            }
            other => panic!("expected steps-found, got {other:?}"),
        }
    }

    struct PayloadStamp;

    #[async_trait::async_trait]
    impl keel_core::Middleware for PayloadStamp {
        async fn on_send_event(&self, payloads: &mut Vec<EventPayload>) {
            for payload in payloads {
                payload.data["stamped"] = serde_json::json!(true);
            }
        }
    }

    #[tokio::test]
    async fn test_invoke_payload_passes_through_send_hooks() {
        let spec = FunctionSpec::new(
            FunctionOpts::new("caller").with_trigger(Trigger::event("test/started")),
            |ctx| async move {
                let _ = ctx
                    .step
                    .invoke(crate::tools::InvokeOpts {
                        function_id: "callee".into(),
                        payload: Some(serde_json::json!({"k": "v"})),
                        timeout: Some("1m".into()),
                        id: None,
                    })
                    .await?;
                Ok(Value::Null)
            },
        );
        let mut stack = MiddlewareStack::new();
        stack.register(Arc::new(PayloadStamp));
        let engine = ExecutionEngine::new(
            Arc::new(spec),
            inputs_with(&[], None),
            stack,
            Arc::new(MockEventSender::default()),
            EngineSettings::default(),
        );
        match engine.start().await {
            ExecutionResult::StepsFound { steps } => {
                assert_eq!(steps[0].op, StepOpCode::InvokeFunction);
                let opts = steps[0].opts.as_ref().unwrap();
                assert_eq!(opts["payload"]["k"], "v");
                assert_eq!(opts["payload"]["stamped"], true);
            }
            other => panic!("expected steps-found, got {other:?}"),
        }
    }

    struct RejectAll;

    impl EventValidator for RejectAll {
        fn validate(&self, event: &EventPayload) -> keel_core::Result<()> {
            Err(Error::Validation(format!("unexpected event '{}'", event.name)))
        }
    }

    #[tokio::test]
    async fn test_event_validation_failure_is_non_retriable() {
        let engine = engine(seq_spec(), inputs_with(&[], None)).with_validator(Arc::new(RejectAll));
        match engine.start().await {
            ExecutionResult::FunctionRejected { retriable, error } => {
                assert_eq!(retriable, Retriable::No);
                assert!(error.message.contains("test/started"));
            }
            other => panic!("expected function-rejected, got {other:?}"),
        }
    }

    // --- checkpointing mode ---

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(1),
            max_attempts: 2,
            max_backoff: Duration::from_millis(2),
        }
    }

    fn checkpointing_engine(
        spec: FunctionSpec,
        buffered_steps: usize,
        client: Arc<MockCheckpointer>,
    ) -> ExecutionEngine {
        let mut settings = EngineSettings::default();
        settings.checkpointing = Some(
            CheckpointSettings::new(CheckpointTransport::Async {
                internal_fn_id: "ifn-1".into(),
                queue_item_id: "qi-1".into(),
            })
            .with_buffered_steps(buffered_steps)
            .with_policy(fast_policy()),
        );
        ExecutionEngine::new(
            Arc::new(spec),
            inputs_with(&[], None),
            MiddlewareStack::new(),
            Arc::new(MockEventSender::default()),
            settings,
        )
        .with_checkpointer(client)
    }

    fn three_step_spec() -> FunctionSpec {
        FunctionSpec::new(
            FunctionOpts::new("three").with_trigger(Trigger::event("test/started")),
            |ctx| async move {
                let _: String = ctx
                    .step
                    .run("seq-1", || async { Ok("r1".to_string()) })
                    .await?;
                let _: String = ctx
                    .step
                    .run("seq-2", || async { Ok("r2".to_string()) })
                    .await?;
                let _: String = ctx
                    .step
                    .run("seq-3", || async { Ok("r3".to_string()) })
                    .await?;
                Ok(serde_json::json!("done"))
            },
        )
    }

    // S5: threshold flush batches [seq-1, seq-2] then [seq-3, RunComplete].
    #[tokio::test]
    async fn test_checkpoint_threshold_batches() {
        let client = Arc::new(MockCheckpointer::default());
        let engine = checkpointing_engine(three_step_spec(), 2, client.clone());

        let result = engine.start().await;
        assert_eq!(
            result,
            ExecutionResult::FunctionResolved {
                data: serde_json::json!("done")
            }
        );

        let batches = client.step_batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(
            batches[0].iter().map(|o| o.id.as_str()).collect::<Vec<_>>(),
            vec![hash_step_id("seq-1"), hash_step_id("seq-2")]
        );
        assert_eq!(batches[1][0].id, hash_step_id("seq-3"));
        assert_eq!(batches[1][1].op, StepOpCode::RunComplete);
        assert_eq!(batches[1][1].data, Some(serde_json::json!("done")));

        // Invariant 6: no step appears in two checkpoint payloads.
        let mut all: Vec<&str> = batches.iter().flatten().map(|o| o.id.as_str()).collect();
        all.sort_unstable();
        let before = all.len();
        all.dedup();
        assert_eq!(before, all.len());
    }

    // S6: pre-parallel flush failure falls back to the buffered completions.
    #[tokio::test]
    async fn test_parallel_flush_failure_falls_back_to_completions() {
        crate::testing::init_test_logging();
        let spec = FunctionSpec::new(
            FunctionOpts::new("mixed").with_trigger(Trigger::event("test/started")),
            |ctx| async move {
                let _: String = ctx
                    .step
                    .run("seq-1", || async { Ok("r1".to_string()) })
                    .await?;
                let _: String = ctx
                    .step
                    .run("seq-2", || async { Ok("r2".to_string()) })
                    .await?;
                let p1 = ctx.step.run("p1", || async { Ok(serde_json::json!(1)) });
                let p2 = ctx.step.run("p2", || async { Ok(serde_json::json!(2)) });
                let _ = futures::join!(p1, p2);
                Ok(Value::Null)
            },
        );
        let client = Arc::new(MockCheckpointer::default());
        client.fail_next(u32::MAX);
        let engine = checkpointing_engine(spec, 5, client.clone());

        match engine.start().await {
            ExecutionResult::StepsFound { steps } => {
                let ids: Vec<&str> = steps.iter().map(|s| s.id.as_str()).collect();
                assert_eq!(ids, vec![hash_step_id("seq-1"), hash_step_id("seq-2")]);
                assert_eq!(steps[0].data, Some(serde_json::json!("r1")));
                assert_eq!(steps[1].data, Some(serde_json::json!("r2")));
                assert!(steps.iter().all(|s| s.error.is_none()));
            }
            other => panic!("expected steps-found fallback, got {other:?}"),
        }
    }

    // S7: a handler rejection forces a flush first.
    #[tokio::test]
    async fn test_rejection_flushes_buffer_first() {
        let spec = FunctionSpec::new(
            FunctionOpts::new("boom").with_trigger(Trigger::event("test/started")),
            |ctx| async move {
                let _: String = ctx
                    .step
                    .run("seq-1", || async { Ok("r1".to_string()) })
                    .await?;
                let _: String = ctx
                    .step
                    .run("seq-2", || async { Ok("r2".to_string()) })
                    .await?;
                Err(Error::Handler("explode".into()))
            },
        );
        let client = Arc::new(MockCheckpointer::default());
        let engine = checkpointing_engine(spec, 5, client.clone());

        match engine.start().await {
            ExecutionResult::FunctionRejected { error, retriable } => {
                assert!(error.message.contains("explode"));
                assert_eq!(retriable, Retriable::Yes);
            }
            other => panic!("expected function-rejected, got {other:?}"),
        }
        let batches = client.step_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[tokio::test]
    async fn test_rejection_flush_failure_defers_the_rejection() {
        let spec = FunctionSpec::new(
            FunctionOpts::new("boom").with_trigger(Trigger::event("test/started")),
            |ctx| async move {
                let _: String = ctx
                    .step
                    .run("seq-1", || async { Ok("r1".to_string()) })
                    .await?;
                let _: String = ctx
                    .step
                    .run("seq-2", || async { Ok("r2".to_string()) })
                    .await?;
                Err(Error::Handler("explode".into()))
            },
        );
        let client = Arc::new(MockCheckpointer::default());
        client.fail_next(u32::MAX);
        let engine = checkpointing_engine(spec, 5, client.clone());

        match engine.start().await {
            ExecutionResult::StepsFound { steps } => {
                assert_eq!(steps.len(), 2);
                assert!(steps.iter().all(|s| s.error.is_none()));
            }
            other => panic!("expected steps-found fallback, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_complete_flush_failure_falls_back() {
        let spec = FunctionSpec::new(
            FunctionOpts::new("fin").with_trigger(Trigger::event("test/started")),
            |ctx| async move {
                let _: String = ctx
                    .step
                    .run("only", || async { Ok("r".to_string()) })
                    .await?;
                Ok(serde_json::json!("fin"))
            },
        );
        let client = Arc::new(MockCheckpointer::default());
        client.fail_next(u32::MAX);
        let engine = checkpointing_engine(spec, 5, client.clone());

        match engine.start().await {
            ExecutionResult::StepsFound { steps } => {
                assert_eq!(steps.len(), 2);
                assert_eq!(steps[0].id, hash_step_id("only"));
                assert_eq!(steps[1].op, StepOpCode::RunComplete);
            }
            other => panic!("expected steps-found fallback, got {other:?}"),
        }
    }

    // Pre-step-error flush: completions land before the error is reported.
    #[tokio::test]
    async fn test_step_error_flushes_preceding_completions() {
        let spec = FunctionSpec::new(
            FunctionOpts::new("failing").with_trigger(Trigger::event("test/started")),
            |ctx| async move {
                let _: String = ctx
                    .step
                    .run("good", || async { Ok("ok".to_string()) })
                    .await?;
                let _: Value = ctx
                    .step
                    .run("bad", || async { Err(Error::Handler("nope".into())) })
                    .await?;
                Ok(Value::Null)
            },
        );
        let client = Arc::new(MockCheckpointer::default());
        let engine = checkpointing_engine(spec, 5, client.clone());

        match engine.start().await {
            ExecutionResult::StepRan { step, retriable } => {
                assert_eq!(step.id, hash_step_id("bad"));
                assert_eq!(step.op, StepOpCode::StepError);
                assert_eq!(retriable, Some(Retriable::Yes));
            }
            other => panic!("expected step-ran, got {other:?}"),
        }
        // The completed step was flushed; the failing step was not buffered.
        let batches = client.step_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].id, hash_step_id("good"));
    }

    #[tokio::test]
    async fn test_sync_transport_registers_run() {
        let spec = three_step_spec();
        let client = Arc::new(MockCheckpointer::default());
        let mut settings = EngineSettings::default();
        settings.checkpointing = Some(
            CheckpointSettings::new(CheckpointTransport::Sync {
                app_id: "app-1".into(),
                fn_id: "three".into(),
            })
            .with_buffered_steps(10)
            .with_policy(fast_policy()),
        );
        let engine = ExecutionEngine::new(
            Arc::new(spec),
            inputs_with(&[], None),
            MiddlewareStack::new(),
            Arc::new(MockEventSender::default()),
            settings,
        )
        .with_checkpointer(client.clone());

        let result = engine.start().await;
        assert!(matches!(result, ExecutionResult::FunctionResolved { .. }));
        assert_eq!(client.new_runs().len(), 1);
        assert_eq!(client.new_runs()[0].app_id, "app-1");
        assert_eq!(client.step_batches().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_registration_downgrades_to_request_mode() {
        let spec = three_step_spec();
        let client = Arc::new(MockCheckpointer::default());
        client.fail_next(u32::MAX);
        let mut settings = EngineSettings::default();
        settings.checkpointing = Some(
            CheckpointSettings::new(CheckpointTransport::Sync {
                app_id: "app-1".into(),
                fn_id: "three".into(),
            })
            .with_policy(fast_policy()),
        );
        let engine = ExecutionEngine::new(
            Arc::new(spec),
            inputs_with(&[], None),
            MiddlewareStack::new(),
            Arc::new(MockEventSender::default()),
            settings,
        )
        .with_checkpointer(client.clone());

        // Request-mode behavior: the first step is planned, not executed.
        match engine.start().await {
            ExecutionResult::StepsFound { steps } => {
                assert_eq!(steps[0].id, hash_step_id("seq-1"));
                assert_eq!(steps[0].op, StepOpCode::StepPlanned);
            }
            other => panic!("expected steps-found, got {other:?}"),
        }
    }
}
