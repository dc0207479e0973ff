//! Cooperative scheduler driving the user handler.
//!
//! The handler runs as one future wrapped in a [`Driver`]. Every poll first
//! advances the handler as far as it can go (memoized steps settle inline,
//! so whole replayed prefixes complete within a single poll), then drains the
//! discovery queue: steps found since the last poll are batched into one
//! `steps-found` checkpoint. This is the explicit drain point that coalesces
//! same-tick discoveries: `join`-style parallel step requests surface as a
//! single checkpoint, in enqueue order.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use keel_core::error::Error;

use crate::state::{FoundStep, RunState};

/// Scheduler-to-engine signal values. Distinct from the wire-level
/// execution result: these carry live [`FoundStep`] handles.
pub enum Checkpoint {
    StepsFound { steps: Vec<Arc<FoundStep>> },
    FunctionResolved { data: Value },
    FunctionRejected { error: Error },
}

impl std::fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StepsFound { steps } => f
                .debug_struct("StepsFound")
                .field("count", &steps.len())
                .finish(),
            Self::FunctionResolved { .. } => f.write_str("FunctionResolved"),
            Self::FunctionRejected { error } => f
                .debug_struct("FunctionRejected")
                .field("error", &error.to_string())
                .finish(),
        }
    }
}

/// Wraps the handler future; emits checkpoints onto the engine's channel.
///
/// Once a terminal checkpoint is sent the driver completes; aborting the
/// driver task leaves any still-pending step awaitables unsettled, which is
/// exactly the cancellation contract.
pub struct Driver {
    handler: Option<BoxFuture<'static, keel_core::Result<Value>>>,
    state: Arc<RunState>,
    checkpoints: mpsc::UnboundedSender<Checkpoint>,
}

impl Driver {
    pub fn new(
        handler: BoxFuture<'static, keel_core::Result<Value>>,
        state: Arc<RunState>,
        checkpoints: mpsc::UnboundedSender<Checkpoint>,
    ) -> Self {
        Self {
            handler: Some(handler),
            state,
            checkpoints,
        }
    }
}

impl Future for Driver {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let Some(handler) = this.handler.as_mut() else {
            return Poll::Ready(());
        };

        match handler.as_mut().poll(cx) {
            Poll::Ready(outcome) => {
                this.handler = None;
                // Flush any discoveries made in the handler's final tick
                // before the terminal checkpoint.
                let steps = this.state.drain_new_steps();
                if !steps.is_empty() {
                    let _ = this.checkpoints.send(Checkpoint::StepsFound { steps });
                }
                let checkpoint = match outcome {
                    Ok(data) => Checkpoint::FunctionResolved { data },
                    Err(error) => Checkpoint::FunctionRejected { error },
                };
                let _ = this.checkpoints.send(checkpoint);
                Poll::Ready(())
            }
            Poll::Pending => {
                let steps = this.state.drain_new_steps();
                if !steps.is_empty() {
                    let _ = this.checkpoints.send(Checkpoint::StepsFound { steps });
                }
                Poll::Pending
            }
        }
    }
}
