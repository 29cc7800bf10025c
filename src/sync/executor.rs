use super::types::SyncRequest;
use crate::config::ExecutorConfig;
use crate::http::build_client;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("remote rejected task: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid response: {0}")]
    Deserialize(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionReport {
    pub remote_requests: i64,
}

/// Pushes one sync request to the remote side.
pub trait RemoteSyncExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        request: &SyncRequest,
    ) -> impl Future<Output = Result<ExecutionReport, ExecutorError>> + Send;
}

/// Logs the task instead of running it.
#[derive(Debug, Clone, Default)]
pub struct DryRunExecutor;

impl RemoteSyncExecutor for DryRunExecutor {
    async fn execute(&self, request: &SyncRequest) -> Result<ExecutionReport, ExecutorError> {
        info!(
            target = "pim_sync.executor",
            request_id = request.id,
            task = %request.task_func_path,
            remote_product_id = request.remote_product_id,
            view_id = request.sales_channel_view_id,
            "dry_run_task"
        );
        Ok(ExecutionReport { remote_requests: 1 })
    }
}

/// Forwards tasks to an integration worker over HTTP.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    base_url: String,
    token: Option<String>,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct TaskAccepted {
    #[serde(default)]
    remote_requests: Option<i64>,
}

impl HttpExecutor {
    pub fn new(base_url: &str, token: Option<String>, http: Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http,
        }
    }
}

impl RemoteSyncExecutor for HttpExecutor {
    async fn execute(&self, request: &SyncRequest) -> Result<ExecutionReport, ExecutorError> {
        let payload = json!({
            "sync_request_id": request.id,
            "task": request.task_func_path,
            "sync_type": request.sync_type,
            "kwargs": request.task_kwargs,
            "target": request.target(),
        });
        let mut call = self
            .http
            .post(format!("{}/tasks", self.base_url))
            .header("X-Request-Id", Uuid::new_v4().to_string())
            .json(&payload);
        if let Some(token) = &self.token {
            call = call.bearer_auth(token);
        }
        let response = call
            .send()
            .await
            .map_err(|err| ExecutorError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutorError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|err| ExecutorError::Deserialize(err.to_string()))?;
        if body.trim().is_empty() {
            return Ok(ExecutionReport { remote_requests: 1 });
        }
        let accepted: TaskAccepted = serde_json::from_str(&body)
            .map_err(|err| ExecutorError::Deserialize(err.to_string()))?;
        Ok(ExecutionReport {
            remote_requests: accepted.remote_requests.unwrap_or(1),
        })
    }
}

/// Executor picked from configuration at start-up.
#[derive(Debug, Clone)]
pub enum ConfiguredExecutor {
    DryRun(DryRunExecutor),
    Http(HttpExecutor),
}

impl ConfiguredExecutor {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        match config.endpoint.as_deref() {
            Some(url) => ConfiguredExecutor::Http(HttpExecutor::new(
                url,
                config.token.clone(),
                build_client(config),
            )),
            None => ConfiguredExecutor::DryRun(DryRunExecutor),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConfiguredExecutor::DryRun(_) => "dry_run",
            ConfiguredExecutor::Http(_) => "http",
        }
    }
}

impl RemoteSyncExecutor for ConfiguredExecutor {
    async fn execute(&self, request: &SyncRequest) -> Result<ExecutionReport, ExecutorError> {
        match self {
            ConfiguredExecutor::DryRun(inner) => inner.execute(request).await,
            ConfiguredExecutor::Http(inner) => inner.execute(request).await,
        }
    }
}
