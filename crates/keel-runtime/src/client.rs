//! HTTP clients for the Executor API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use keel_core::config::Config;
use keel_core::error::{Error, Result};
use keel_core::event::EventPayload;
use keel_core::executor::{
    CheckpointAsyncRequest, CheckpointRequest, Checkpointer, EventSender, NewRunRequest,
    NewRunResponse, SendResult,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared reqwest plumbing for the Executor endpoints.
#[derive(Clone)]
struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    signing_key: Option<String>,
}

impl ApiClient {
    fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.resolve_base_url().trim_end_matches('/').to_string(),
            signing_key: config.signing_key.clone(),
        })
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.http.post(&url).json(body);
        if let Some(key) = &self.signing_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Http(format!("POST {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Http(format!(
                "POST {url} returned {status}: {text}"
            )));
        }
        response
            .json::<R>()
            .await
            .map_err(|e| Error::Http(format!("POST {url} returned an unreadable body: {e}")))
    }

    async fn post_ack<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.http.post(&url).json(body);
        if let Some(key) = &self.signing_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Http(format!("POST {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Http(format!(
                "POST {url} returned {status}: {text}"
            )));
        }
        Ok(())
    }
}

/// Checkpointer backed by the Executor's HTTP API.
///
/// Each call is a single attempt; the engine-side retry loop owns backoff.
pub struct HttpCheckpointer {
    api: ApiClient,
}

impl HttpCheckpointer {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new(config)?,
        })
    }

    /// Convenience constructor from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::new(&Config::from_env())
    }
}

#[async_trait]
impl Checkpointer for HttpCheckpointer {
    async fn checkpoint_new_run(&self, req: NewRunRequest) -> Result<NewRunResponse> {
        self.api.post("/v1/runs", &req).await
    }

    async fn checkpoint_steps(&self, req: CheckpointRequest) -> Result<()> {
        let path = format!("/v1/runs/{}/steps", req.run_id);
        self.api.post_ack(&path, &req).await
    }

    async fn checkpoint_steps_async(&self, req: CheckpointAsyncRequest) -> Result<()> {
        let path = format!("/v1/runs/{}/steps/async", req.run_id);
        self.api.post_ack(&path, &req).await
    }
}

/// Event sender backed by the Executor's event intake.
pub struct HttpEventSender {
    api: ApiClient,
}

impl HttpEventSender {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new(config)?,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(&Config::from_env())
    }
}

#[async_trait]
impl EventSender for HttpEventSender {
    async fn send(&self, mut payloads: Vec<EventPayload>) -> Result<SendResult> {
        for payload in &mut payloads {
            payload.ensure_id();
        }
        self.api
            .post::<_, SendResult>("/e", &payloads)
            .await
            .map_err(|e| Error::EventSend(e.to_string()))
    }
}

/// Bundle the HTTP clients an engine needs, as trait objects.
pub fn clients_from_config(
    config: &Config,
) -> Result<(Arc<dyn Checkpointer>, Arc<dyn EventSender>)> {
    Ok((
        Arc::new(HttpCheckpointer::new(config)?),
        Arc::new(HttpEventSender::new(config)?),
    ))
}
