//! REST boundary of the orchestrator.

use crate::config::ClientConfig;
use crate::error::ClientError;
use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder};
use sdlc_core::{
    CommandAck, CreateExecutionRequest, CreatedExecution, Execution, IntegrationHealth,
    IssuesOverview, MessageRequest, MetricsSummary, Run, RunPhaseRequest, SelectRunRequest,
    StatusSummary,
};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use tracing::debug;
use url::Url;

/// Everything the dashboard asks of the orchestrator. Reads are safe to
/// repeat; commands are not and are never retried by callers in this crate.
#[async_trait]
pub trait SdlcApi: Send + Sync {
    async fn status(&self) -> Result<StatusSummary, ClientError>;

    async fn list_runs(&self) -> Result<Vec<Run>, ClientError>;

    async fn select_run(&self, run_id: &str) -> Result<CommandAck, ClientError>;

    /// Executions of one run, or of every run when `run_id` is `None`.
    async fn list_executions(&self, run_id: Option<&str>) -> Result<Vec<Execution>, ClientError>;

    async fn get_execution(&self, execution_id: &str) -> Result<Execution, ClientError>;

    async fn create_execution(
        &self,
        request: &CreateExecutionRequest,
    ) -> Result<CreatedExecution, ClientError>;

    async fn send_message(&self, execution_id: &str, content: &str)
        -> Result<CommandAck, ClientError>;

    async fn approve_execution(&self, execution_id: &str) -> Result<CommandAck, ClientError>;

    async fn cancel_execution(&self, execution_id: &str) -> Result<CommandAck, ClientError>;

    async fn run_pipeline(&self) -> Result<CommandAck, ClientError>;

    async fn run_phase(
        &self,
        phase: &str,
        params: &HashMap<String, String>,
    ) -> Result<CommandAck, ClientError>;

    async fn issues(&self) -> Result<IssuesOverview, ClientError>;

    async fn metrics(&self) -> Result<MetricsSummary, ClientError>;

    async fn integration_health(&self) -> Result<Vec<IntegrationHealth>, ClientError>;
}

#[derive(Clone)]
pub struct HttpApi {
    config: ClientConfig,
    client: Client,
}

impl HttpApi {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );
        let client = Client::builder()
            .timeout(config.request_timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| ClientError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        self.config.endpoint(segments)
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, ClientError> {
        let body = self.request_text(request).await?;
        serde_json::from_str(&body).map_err(|err| ClientError::Decode(err.to_string()))
    }

    /// The server encodes an empty list as `null`.
    async fn request_list<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<Vec<T>, ClientError> {
        let list: Option<Vec<T>> = self.request_json(request).await?;
        Ok(list.unwrap_or_default())
    }

    async fn request_text(&self, request: RequestBuilder) -> Result<String, ClientError> {
        let response = request
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ClientError::Transport(format!("response read failed: {err}")))?;
        if !status.is_success() {
            debug!("api_status_error: status={} body_len={}", status.as_u16(), body.len());
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl SdlcApi for HttpApi {
    async fn status(&self) -> Result<StatusSummary, ClientError> {
        let url = self.url(&["status"])?;
        self.request_json(self.client.get(url)).await
    }

    async fn list_runs(&self) -> Result<Vec<Run>, ClientError> {
        let url = self.url(&["runs"])?;
        self.request_list(self.client.get(url)).await
    }

    async fn select_run(&self, run_id: &str) -> Result<CommandAck, ClientError> {
        let url = self.url(&["runs", "select"])?;
        let body = SelectRunRequest {
            run_id: run_id.to_string(),
        };
        self.request_json(self.client.post(url).json(&body)).await
    }

    async fn list_executions(&self, run_id: Option<&str>) -> Result<Vec<Execution>, ClientError> {
        let mut url = self.url(&["executions"])?;
        if let Some(run_id) = run_id {
            url.query_pairs_mut().append_pair("run_id", run_id);
        }
        self.request_list(self.client.get(url)).await
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Execution, ClientError> {
        let url = self.url(&["executions", execution_id])?;
        self.request_json(self.client.get(url)).await
    }

    async fn create_execution(
        &self,
        request: &CreateExecutionRequest,
    ) -> Result<CreatedExecution, ClientError> {
        let url = self.url(&["executions"])?;
        self.request_json(self.client.post(url).json(request)).await
    }

    async fn send_message(
        &self,
        execution_id: &str,
        content: &str,
    ) -> Result<CommandAck, ClientError> {
        let url = self.url(&["executions", execution_id, "message"])?;
        let body = MessageRequest {
            content: content.to_string(),
        };
        self.request_json(self.client.post(url).json(&body)).await
    }

    async fn approve_execution(&self, execution_id: &str) -> Result<CommandAck, ClientError> {
        let url = self.url(&["executions", execution_id, "approve"])?;
        self.request_json(self.client.post(url)).await
    }

    async fn cancel_execution(&self, execution_id: &str) -> Result<CommandAck, ClientError> {
        let url = self.url(&["executions", execution_id, "cancel"])?;
        self.request_json(self.client.post(url)).await
    }

    async fn run_pipeline(&self) -> Result<CommandAck, ClientError> {
        let url = self.url(&["run"])?;
        self.request_json(self.client.post(url)).await
    }

    async fn run_phase(
        &self,
        phase: &str,
        params: &HashMap<String, String>,
    ) -> Result<CommandAck, ClientError> {
        let url = self.url(&["phases", phase, "run"])?;
        let body = RunPhaseRequest {
            params: params.clone(),
        };
        self.request_json(self.client.post(url).json(&body)).await
    }

    async fn issues(&self) -> Result<IssuesOverview, ClientError> {
        let url = self.url(&["issues"])?;
        self.request_json(self.client.get(url)).await
    }

    async fn metrics(&self) -> Result<MetricsSummary, ClientError> {
        let url = self.url(&["metrics"])?;
        self.request_json(self.client.get(url)).await
    }

    async fn integration_health(&self) -> Result<Vec<IntegrationHealth>, ClientError> {
        let url = self.url(&["health", "integrations"])?;
        self.request_list(self.client.get(url)).await
    }
}
