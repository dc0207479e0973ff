//! Registry of durable functions served by one embedded app.
//!
//! Serve adapters resolve incoming Executor requests through the registry:
//! look up the function, build a single-use engine, run it, map the result
//! to the wire response. Registration (`PUT`) serializes `describe_all`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use keel_core::error::{Error, Result};
use keel_core::executor::{Checkpointer, EventSender, EventValidator};
use keel_core::middleware::MiddlewareStack;
use keel_core::wire::ExecutorRequest;

use crate::engine::{CycleInputs, EngineSettings, ExecutionEngine};
use crate::handler::FunctionSpec;

/// Functions, middleware and Executor clients of one embedded app.
#[derive(Clone)]
pub struct AppRegistry {
    app_id: String,
    functions: HashMap<String, Arc<FunctionSpec>>,
    middleware: MiddlewareStack,
    events: Arc<dyn EventSender>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    validator: Option<Arc<dyn EventValidator>>,
    settings: EngineSettings,
}

impl AppRegistry {
    /// Build a registry wired to the configured Executor endpoints, applying
    /// the ambient-context kill switch.
    pub fn from_config(app_id: impl Into<String>, config: &keel_core::Config) -> Result<Self> {
        crate::ambient::set_ambient_disabled(config.ambient_context_disabled);
        let (checkpointer, events) = crate::client::clients_from_config(config)?;
        Ok(Self::new(app_id, events).with_checkpointer(checkpointer))
    }

    pub fn new(app_id: impl Into<String>, events: Arc<dyn EventSender>) -> Self {
        let app_id = app_id.into();
        let settings = EngineSettings {
            app_id: app_id.clone(),
            ..EngineSettings::default()
        };
        Self {
            app_id,
            functions: HashMap::new(),
            middleware: MiddlewareStack::new(),
            events,
            checkpointer: None,
            validator: None,
            settings,
        }
    }

    pub fn with_middleware(mut self, middleware: MiddlewareStack) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn EventValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Register a function. The id must be unique within the app and the
    /// configuration must validate.
    pub fn register(&mut self, spec: FunctionSpec) -> Result<()> {
        spec.opts.validate()?;
        let id = spec.opts.id.clone();
        if self.functions.contains_key(&id) {
            return Err(Error::Validation(format!(
                "function '{id}' is registered twice"
            )));
        }
        self.functions.insert(id, Arc::new(spec));
        Ok(())
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Look up a function by id.
    pub fn get(&self, fn_id: &str) -> Option<Arc<FunctionSpec>> {
        self.functions.get(fn_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// All function ids, sorted for stable registration payloads.
    pub fn function_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Descriptors for every registered function, addressed back at the
    /// serving URL.
    pub fn describe_all(&self, serve_url: &str) -> Vec<Value> {
        self.function_ids()
            .into_iter()
            .filter_map(|id| self.functions.get(id))
            .map(|spec| {
                let url = format!("{serve_url}?fnId={}&stepId=step", spec.opts.id);
                spec.describe(&url)
            })
            .collect()
    }

    /// Build the single-use engine for one incoming cycle.
    pub fn engine_for(
        &self,
        fn_id: &str,
        request: &ExecutorRequest,
        target_step_id: Option<String>,
    ) -> Result<ExecutionEngine> {
        let spec = self
            .get(fn_id)
            .ok_or_else(|| Error::Validation(format!("unknown function '{fn_id}'")))?;
        let inputs = CycleInputs::from_request(request, target_step_id);
        let mut engine = ExecutionEngine::new(
            spec,
            inputs,
            self.middleware.clone(),
            self.events.clone(),
            self.settings.clone(),
        );
        if let Some(checkpointer) = &self.checkpointer {
            engine = engine.with_checkpointer(checkpointer.clone());
        }
        if let Some(validator) = &self.validator {
            engine = engine.with_validator(validator.clone());
        }
        Ok(engine)
    }
}
