use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An event payload as exchanged with the Executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Event id, assigned on send if absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Event name/type, e.g. `billing/invoice.paid`.
    pub name: String,
    /// Event data.
    #[serde(default)]
    pub data: Value,
    /// Optional user identification block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    /// Millisecond timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    /// Payload schema version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
}

impl EventPayload {
    /// Create a new event with the current timestamp.
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            data,
            user: None,
            ts: Some(Utc::now().timestamp_millis()),
            v: None,
        }
    }

    /// Assign a fresh id if the event does not carry one yet.
    pub fn ensure_id(&mut self) -> &str {
        if self.id.is_none() {
            self.id = Some(Uuid::new_v4().to_string());
        }
        self.id.as_deref().unwrap_or_default()
    }

    /// Get the data as a typed value.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.data.clone()).ok()
    }
}
