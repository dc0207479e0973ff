//! Test doubles for the Executor-facing interfaces.
//!
//! Available to downstream crates through the `testing` feature.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use keel_core::error::{Error, Result};
use keel_core::event::EventPayload;
use keel_core::executor::{
    CheckpointAsyncRequest, CheckpointRequest, Checkpointer, EventSender, NewRunRequest,
    NewRunResponse, SendResult,
};
use keel_core::op::OutgoingOp;

/// Recording event sender.
#[derive(Default)]
pub struct MockEventSender {
    sent: Mutex<Vec<EventPayload>>,
    counter: AtomicU32,
}

impl MockEventSender {
    /// All payloads sent so far.
    pub fn sent(&self) -> Vec<EventPayload> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSender for MockEventSender {
    async fn send(&self, payloads: Vec<EventPayload>) -> Result<SendResult> {
        let ids: Vec<String> = payloads
            .iter()
            .map(|_| format!("evt-{}", self.counter.fetch_add(1, Ordering::SeqCst)))
            .collect();
        self.sent.lock().unwrap().extend(payloads);
        Ok(SendResult { ids })
    }
}

/// Recording checkpointer with scriptable failures.
///
/// `fail_next(n)` makes the next `n` calls (of any kind) fail; combined with
/// a small retry policy this exercises both the retry-then-succeed and the
/// terminal-exhaustion paths.
#[derive(Default)]
pub struct MockCheckpointer {
    fail_remaining: AtomicU32,
    new_runs: Mutex<Vec<NewRunRequest>>,
    batches: Mutex<Vec<Vec<OutgoingOp>>>,
    step_calls: AtomicU32,
}

impl MockCheckpointer {
    /// Make the next `n` calls fail.
    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Successfully delivered step batches, in delivery order.
    pub fn step_batches(&self) -> Vec<Vec<OutgoingOp>> {
        self.batches.lock().unwrap().clone()
    }

    /// Total step-checkpoint calls, including failed attempts.
    pub fn step_call_count(&self) -> u32 {
        self.step_calls.load(Ordering::SeqCst)
    }

    /// Recorded run registrations.
    pub fn new_runs(&self) -> Vec<NewRunRequest> {
        self.new_runs.lock().unwrap().clone()
    }

    fn should_fail(&self) -> bool {
        self.fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Checkpointer for MockCheckpointer {
    async fn checkpoint_new_run(&self, req: NewRunRequest) -> Result<NewRunResponse> {
        if self.should_fail() {
            return Err(Error::Http("scripted registration failure".into()));
        }
        self.new_runs.lock().unwrap().push(req.clone());
        Ok(NewRunResponse {
            app_id: req.app_id,
            fn_id: req.fn_id,
            token: "test-token".to_string(),
        })
    }

    async fn checkpoint_steps(&self, req: CheckpointRequest) -> Result<()> {
        self.step_calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail() {
            return Err(Error::Http("scripted checkpoint failure".into()));
        }
        self.batches.lock().unwrap().push(req.steps);
        Ok(())
    }

    async fn checkpoint_steps_async(&self, req: CheckpointAsyncRequest) -> Result<()> {
        self.step_calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail() {
            return Err(Error::Http("scripted checkpoint failure".into()));
        }
        self.batches.lock().unwrap().push(req.steps);
        Ok(())
    }
}

/// Install a compact tracing subscriber for test runs, once per process.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
