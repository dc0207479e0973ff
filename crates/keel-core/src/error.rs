use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Serialized error shape exchanged with the Executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorShape {
    /// Error class name (e.g. `NonRetriableError`).
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Optional stack or backtrace text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Optional underlying cause description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ErrorShape {
    /// Create a plain error shape.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            cause: None,
        }
    }
}

/// An error raised from (or memoized for) a single step, tagged with the
/// step's raw id so user code can tell which step failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepError {
    /// Raw (unhashed) step id.
    pub step_id: String,
    /// Hashed step id as known to the Executor.
    pub hashed_id: String,
    /// The underlying error in wire form.
    pub shape: ErrorShape,
    /// Identity marker for this materialized instance. A handler that lets
    /// the same instance escape uncaught is recognized by this marker.
    pub token: u64,
}

/// Core error type for keel operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The operation must not be retried by the Executor.
    #[error("{message}")]
    NonRetriable { message: String },

    /// The operation should be retried after the given delay string.
    #[error("{message} (retry after {delay})")]
    RetryAfter { delay: String, message: String },

    /// A step's awaitable rejected with this error.
    #[error("step '{}' failed: {}", .0.step_id, .0.shape.message)]
    Step(StepError),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Event send error: {0}")]
    EventSend(String),

    #[error("Checkpoint delivery failed after {attempts} attempts: {message}")]
    CheckpointExhausted { attempts: u32, message: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Shorthand for a non-retriable error.
    pub fn non_retriable(message: impl Into<String>) -> Self {
        Self::NonRetriable {
            message: message.into(),
        }
    }

    /// Shorthand for a retry-after error carrying a delay string like `5m`.
    pub fn retry_after(delay: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RetryAfter {
            delay: delay.into(),
            message: message.into(),
        }
    }

    /// Project this error onto the wire shape.
    pub fn to_shape(&self) -> ErrorShape {
        match self {
            Self::NonRetriable { message } => ErrorShape::new("NonRetriableError", message),
            Self::RetryAfter { message, .. } => ErrorShape::new("RetryAfterError", message),
            Self::Step(step) => step.shape.clone(),
            other => ErrorShape::new("Error", other.to_string()),
        }
    }

    /// Base retriability of this error, before attempt-count or memoized
    /// re-throw rules are applied.
    pub fn retriable(&self) -> Retriable {
        match self {
            Self::NonRetriable { .. } => Retriable::No,
            Self::RetryAfter { delay, .. } => Retriable::After(delay.clone()),
            _ => Retriable::Yes,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias using keel's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Wire-level retriability: `false`, `true`, or a delay string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retriable {
    No,
    Yes,
    After(String),
}

impl Retriable {
    /// Whether the Executor is allowed to retry at all.
    pub fn allows_retry(&self) -> bool {
        !matches!(self, Self::No)
    }

    /// The delay string, when one applies.
    pub fn delay(&self) -> Option<&str> {
        match self {
            Self::After(d) => Some(d),
            _ => None,
        }
    }
}

impl Serialize for Retriable {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::No => serializer.serialize_bool(false),
            Self::Yes => serializer.serialize_bool(true),
            Self::After(delay) => serializer.serialize_str(delay),
        }
    }
}

impl<'de> Deserialize<'de> for Retriable {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::Bool(true) => Ok(Self::Yes),
            serde_json::Value::Bool(false) => Ok(Self::No),
            serde_json::Value::String(delay) => Ok(Self::After(delay)),
            other => Err(serde::de::Error::custom(format!(
                "expected bool or delay string, got {other}"
            ))),
        }
    }
}
