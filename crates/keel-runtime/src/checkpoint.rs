//! Buffering and delivery of completed step outcomes.
//!
//! Completed steps accumulate in a [`CheckpointBuffer`] and are shipped to
//! the Executor by a [`StepCheckpointer`] under the retry policy. A terminal
//! delivery failure never raises into the cycle: the caller receives the
//! undelivered snapshot and downgrades the cycle's result to a `steps-found`
//! carrying every buffered completion, so no acknowledged step is ever lost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_core::error::{Error, Result};
use keel_core::executor::{
    CheckpointAsyncRequest, CheckpointRequest, Checkpointer, NewRunRequest, NewRunResponse,
};
use keel_core::op::OutgoingOp;
use keel_core::retry::RetryPolicy;

/// How checkpoints reach the Executor.
#[derive(Debug, Clone)]
pub enum CheckpointTransport {
    /// Register the run first and ship with the returned token.
    Sync { app_id: String, fn_id: String },
    /// Ship against an existing queue item.
    Async {
        internal_fn_id: String,
        queue_item_id: String,
    },
}

/// Engine configuration for checkpointing mode.
#[derive(Debug, Clone)]
pub struct CheckpointSettings {
    /// Buffer capacity; reaching it triggers a flush.
    pub buffered_steps: usize,
    /// Flush when the cycle has run this long. Zero disables.
    pub max_runtime: Duration,
    /// Flush when this long has passed since the last flush. Zero disables.
    pub max_interval: Duration,
    pub transport: CheckpointTransport,
    pub policy: RetryPolicy,
}

impl CheckpointSettings {
    pub fn new(transport: CheckpointTransport) -> Self {
        Self {
            buffered_steps: 10,
            max_runtime: Duration::ZERO,
            max_interval: Duration::ZERO,
            transport,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_buffered_steps(mut self, buffered_steps: usize) -> Self {
        self.buffered_steps = buffered_steps;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Ring of completed step outcomes awaiting delivery.
///
/// The buffer is owned by the engine task; appends and clears happen on the
/// same cooperative schedule, so a successful flush empties it atomically
/// with respect to subsequent appends.
pub struct CheckpointBuffer {
    steps: Vec<OutgoingOp>,
    capacity: usize,
    max_runtime: Duration,
    max_interval: Duration,
    started_at: Instant,
    last_flush_at: Instant,
}

impl CheckpointBuffer {
    pub fn new(settings: &CheckpointSettings) -> Self {
        let now = Instant::now();
        Self {
            steps: Vec::new(),
            capacity: settings.buffered_steps.max(1),
            max_runtime: settings.max_runtime,
            max_interval: settings.max_interval,
            started_at: now,
            last_flush_at: now,
        }
    }

    pub fn push(&mut self, op: OutgoingOp) {
        self.steps.push(op);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Whether the capacity threshold or a time trigger has fired.
    pub fn should_flush(&self) -> bool {
        if self.steps.len() >= self.capacity {
            return true;
        }
        if self.steps.is_empty() {
            return false;
        }
        if !self.max_runtime.is_zero() && self.started_at.elapsed() >= self.max_runtime {
            return true;
        }
        if !self.max_interval.is_zero() && self.last_flush_at.elapsed() >= self.max_interval {
            return true;
        }
        false
    }

    /// The current contents, in append order.
    pub fn snapshot(&self) -> Vec<OutgoingOp> {
        self.steps.clone()
    }

    /// Drop the first `count` entries after a successful delivery.
    pub fn mark_flushed(&mut self, count: usize) {
        self.steps.drain(..count.min(self.steps.len()));
        self.last_flush_at = Instant::now();
    }
}

/// Resolved delivery route for one cycle.
#[derive(Debug, Clone)]
pub enum CheckpointRoute {
    Sync { token: String },
    Async {
        internal_fn_id: String,
        queue_item_id: String,
    },
}

/// Ships step batches to the Executor with retry-with-backoff.
pub struct StepCheckpointer {
    client: Arc<dyn Checkpointer>,
    policy: RetryPolicy,
    run_id: String,
    route: CheckpointRoute,
}

impl StepCheckpointer {
    pub fn new(
        client: Arc<dyn Checkpointer>,
        policy: RetryPolicy,
        run_id: impl Into<String>,
        route: CheckpointRoute,
    ) -> Self {
        Self {
            client,
            policy,
            run_id: run_id.into(),
            route,
        }
    }

    /// Deliver one batch, retrying under the policy. The returned error is
    /// terminal: every attempt has been spent.
    pub async fn flush(&self, steps: Vec<OutgoingOp>) -> Result<()> {
        let mut attempt = 1u32;
        loop {
            match self.ship(steps.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if attempt >= self.policy.max_attempts {
                        return Err(Error::CheckpointExhausted {
                            attempts: attempt,
                            message: e.to_string(),
                        });
                    }
                    tracing::warn!(
                        run_id = %self.run_id,
                        attempt,
                        error = %e,
                        "checkpoint delivery failed, backing off"
                    );
                    tokio::time::sleep(self.policy.delay_for(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn ship(&self, steps: Vec<OutgoingOp>) -> Result<()> {
        match &self.route {
            CheckpointRoute::Sync { token } => {
                self.client
                    .checkpoint_steps(CheckpointRequest {
                        run_id: self.run_id.clone(),
                        token: token.clone(),
                        steps,
                    })
                    .await
            }
            CheckpointRoute::Async {
                internal_fn_id,
                queue_item_id,
            } => {
                self.client
                    .checkpoint_steps_async(CheckpointAsyncRequest {
                        run_id: self.run_id.clone(),
                        internal_fn_id: internal_fn_id.clone(),
                        queue_item_id: queue_item_id.clone(),
                        steps,
                    })
                    .await
            }
        }
    }
}

/// Outcome of one flush attempt over the buffer.
#[derive(Debug)]
pub enum FlushOutcome {
    /// Delivered (or nothing to deliver); the flushed entries left the buffer.
    Flushed,
    /// No trigger fired; the buffer keeps accumulating.
    Deferred,
    /// Delivery exhausted its retries. The snapshot is every buffered
    /// completion at the moment of failure; the buffer is left intact.
    Fallback(Vec<OutgoingOp>),
}

/// Append an optional completed step, then flush if forced or triggered.
pub async fn attempt_checkpoint_and_resume(
    buffer: &mut CheckpointBuffer,
    checkpointer: &StepCheckpointer,
    step_result: Option<OutgoingOp>,
    force: bool,
) -> FlushOutcome {
    if let Some(op) = step_result {
        buffer.push(op);
    }
    if !force && !buffer.should_flush() {
        return FlushOutcome::Deferred;
    }
    let snapshot = buffer.snapshot();
    if snapshot.is_empty() {
        return FlushOutcome::Flushed;
    }
    match checkpointer.flush(snapshot.clone()).await {
        Ok(()) => {
            buffer.mark_flushed(snapshot.len());
            FlushOutcome::Flushed
        }
        Err(e) => {
            tracing::error!(
                steps = snapshot.len(),
                error = %e,
                "checkpoint flush exhausted retries, returning buffered steps to the Executor"
            );
            FlushOutcome::Fallback(snapshot)
        }
    }
}

/// Register a new run with the Executor under the retry policy.
pub async fn register_new_run(
    client: &Arc<dyn Checkpointer>,
    policy: &RetryPolicy,
    request: NewRunRequest,
) -> Result<NewRunResponse> {
    let mut attempt = 1u32;
    loop {
        match client.checkpoint_new_run(request.clone()).await {
            Ok(resp) => return Ok(resp),
            Err(e) => {
                if attempt >= policy.max_attempts {
                    return Err(Error::CheckpointExhausted {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
                tracing::warn!(
                    run_id = %request.run_id,
                    attempt,
                    error = %e,
                    "run registration failed, backing off"
                );
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
        }
    }
}
