//! Ambient per-run execution context.
//!
//! A best-effort, task-scoped value reachable from user code and middleware
//! without threading it through every call. On runtimes (or configurations)
//! where ambient propagation is unavailable, the accessor returns `None` and
//! warns once; the engine stays functionally correct without it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};

tokio::task_local! {
    static EXECUTION_SCOPE: ExecutionScope;
}

static AMBIENT_DISABLED: AtomicBool = AtomicBool::new(false);
static MISS_WARNING: Once = Once::new();

/// The step currently being executed, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutingStep {
    /// Hashed step id.
    pub id: String,
    /// User-facing step name.
    pub name: String,
}

/// Ambient view of one run's execution.
#[derive(Debug, Clone)]
pub struct ExecutionScope {
    pub run_id: String,
    pub attempt: u32,
    pub fn_id: String,
    executing_step: Arc<Mutex<Option<ExecutingStep>>>,
}

impl ExecutionScope {
    /// Create a scope for one run.
    pub fn new(run_id: impl Into<String>, attempt: u32, fn_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            attempt,
            fn_id: fn_id.into(),
            executing_step: Arc::new(Mutex::new(None)),
        }
    }

    /// The step currently executing under this scope, if any.
    pub fn executing_step(&self) -> Option<ExecutingStep> {
        self.executing_step.lock().ok().and_then(|s| s.clone())
    }

    /// Publish (or clear) the currently executing step.
    pub fn set_executing_step(&self, step: Option<ExecutingStep>) {
        if let Ok(mut slot) = self.executing_step.lock() {
            *slot = step;
        }
    }
}

/// Globally disable the ambient accessor (the env kill switch).
pub fn set_ambient_disabled(disabled: bool) {
    AMBIENT_DISABLED.store(disabled, Ordering::SeqCst);
}

/// Access the current run's ambient scope, if reachable from this task.
pub fn current_execution() -> Option<ExecutionScope> {
    if AMBIENT_DISABLED.load(Ordering::SeqCst) {
        return None;
    }
    let found = EXECUTION_SCOPE.try_with(|scope| scope.clone()).ok();
    if found.is_none() {
        MISS_WARNING.call_once(|| {
            tracing::warn!(
                "ambient execution context unavailable; step and middleware \
                 code must receive the context explicitly"
            );
        });
    }
    found
}

/// Run a future with the given scope installed as the ambient context.
pub async fn with_scope<F: Future>(scope: ExecutionScope, fut: F) -> F::Output {
    EXECUTION_SCOPE.scope(scope, fut).await
}
