use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::event::EventPayload;
use crate::op::OutgoingOp;

/// Registration of a new run with the Executor (Sync checkpointing mode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRunRequest {
    pub run_id: String,
    pub app_id: String,
    pub fn_id: String,
    pub event: EventPayload,
}

/// Executor acknowledgement of a new run, carrying the checkpoint token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRunResponse {
    pub app_id: String,
    pub fn_id: String,
    pub token: String,
}

/// Token-authenticated step checkpoint (Sync mode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRequest {
    pub run_id: String,
    pub token: String,
    pub steps: Vec<OutgoingOp>,
}

/// Queue-addressed step checkpoint (Async mode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointAsyncRequest {
    pub run_id: String,
    pub internal_fn_id: String,
    pub queue_item_id: String,
    pub steps: Vec<OutgoingOp>,
}

/// Client that ships completed step outcomes to the Executor for
/// persistence. Implementations retry internally; a returned error is
/// terminal for the cycle and triggers the engine's fallback.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn checkpoint_new_run(&self, req: NewRunRequest) -> Result<NewRunResponse>;

    async fn checkpoint_steps(&self, req: CheckpointRequest) -> Result<()>;

    async fn checkpoint_steps_async(&self, req: CheckpointAsyncRequest) -> Result<()>;
}

/// Ids assigned to sent events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResult {
    pub ids: Vec<String>,
}

/// Event-send interface, used by the `send_event` tool and `invoke` bodies.
#[async_trait]
pub trait EventSender: Send + Sync {
    async fn send(&self, payloads: Vec<EventPayload>) -> Result<SendResult>;
}

/// Outcome of webhook signature verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Valid,
    Expired,
    Invalid,
}

/// Request-signature verifier. The engine itself never calls this; serve
/// adapters verify before handing the body to the engine.
pub trait SigningVerifier: Send + Sync {
    fn verify(&self, signature_header: &str, raw_body: &[u8]) -> VerifyOutcome;
}

/// Optional event-payload validation consulted before the handler runs.
/// A failure rejects the run without retries.
pub trait EventValidator: Send + Sync {
    fn validate(&self, event: &EventPayload) -> Result<()>;
}
