use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// What causes a function to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Trigger {
    Event {
        event: String,
        /// Optional expression gating the trigger, e.g.
        /// `event.data.amount > 100`.
        #[serde(rename = "if", skip_serializing_if = "Option::is_none")]
        expression: Option<String>,
    },
    Cron {
        cron: String,
    },
}

impl Trigger {
    /// An event trigger with no gating expression.
    pub fn event(name: impl Into<String>) -> Self {
        Self::Event {
            event: name.into(),
            expression: None,
        }
    }

    /// A cron trigger.
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron {
            cron: expression.into(),
        }
    }
}

/// Concurrency scope for a limit key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyScope {
    Account,
    Env,
    Fn,
}

/// Concurrency limit clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concurrency {
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<ConcurrencyScope>,
}

/// Throttle clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Throttle {
    pub limit: u32,
    /// Window as a duration string, e.g. `1m`.
    pub period: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub burst: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Cancel-on clause: a matching event cancels in-flight runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub event: String,
    #[serde(rename = "if", skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// Declarative configuration of a durable function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionOpts {
    /// Stable function id (slug).
    pub id: String,
    /// Human-readable name; defaults to the id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub triggers: Vec<Trigger>,
    /// Retry count for failed runs; attempts = retries + 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<Concurrency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle: Option<Throttle>,
    /// Idempotency key expression.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancel_on: Vec<Cancellation>,
}

impl FunctionOpts {
    /// Create a config with the required fields.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            triggers: Vec::new(),
            retries: None,
            concurrency: None,
            throttle: None,
            idempotency: None,
            cancel_on: Vec::new(),
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a trigger.
    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Set the retry count.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Maximum attempts for a run (retries + 1). The default matches the
    /// default retry config.
    pub fn max_attempts(&self) -> u32 {
        self.retries.unwrap_or(3) + 1
    }

    /// Validate the configuration: non-empty id, at least one trigger, and
    /// parseable cron expressions.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Validation("function id must not be empty".into()));
        }
        if self.triggers.is_empty() {
            return Err(Error::Validation(format!(
                "function '{}' declares no triggers",
                self.id
            )));
        }
        for trigger in &self.triggers {
            if let Trigger::Cron { cron } = trigger {
                cron::Schedule::from_str(cron).map_err(|e| {
                    Error::Validation(format!(
                        "function '{}' has an invalid cron expression '{cron}': {e}",
                        self.id
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// The JSON descriptor the serve adapter registers with the Executor.
    ///
    /// `serve_url` is the publicly reachable URL of the adapter; the single
    /// `step` entry points the Executor back at it.
    pub fn describe(&self, serve_url: &str) -> Value {
        serde_json::json!({
            "id": self.id,
            "name": self.display_name(),
            "triggers": self.triggers,
            "steps": {
                "step": {
                    "id": "step",
                    "name": "step",
                    "runtime": {"type": "http", "url": serve_url},
                    "retries": {"attempts": self.max_attempts()},
                }
            },
            "cancel": self.cancel_on,
            "idempotency": self.idempotency,
            "throttle": self.throttle,
            "concurrency": self.concurrency,
        })
    }
}
