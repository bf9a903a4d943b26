//! HttpBackend — submits workflows to the Backend API over HTTP(S).
//!
//! POST {base_url}/workflow?runner={runner}&operation=execute_workflow
//! Headers:
//!   Authorization: UserKey {api_key}
//!   Accept: text/event-stream
//!   x-vercel-ai-data-stream: v1

use futures::StreamExt;
use reqwest::{StatusCode, Url};

use super::backend::{ByteStream, WorkflowBackend};
use super::config::ClientConfig;
use crate::error::TransportError;
use crate::workflow::schema::WorkflowExecutionRequest;

const MAX_ERROR_BODY: usize = 1000;

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        // No overall timeout: a healthy stream may stay open for hours.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| TransportError::Request(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn execute_url(&self, runner: &str) -> Result<Url, TransportError> {
        Url::parse_with_params(
            &format!("{}/workflow", self.base_url),
            &[("runner", runner), ("operation", "execute_workflow")],
        )
        .map_err(|e| TransportError::Request(format!("Invalid base URL '{}': {}", self.base_url, e)))
    }
}

impl WorkflowBackend for HttpBackend {
    async fn execute(
        &self,
        request: &WorkflowExecutionRequest,
        runner: &str,
    ) -> Result<ByteStream, TransportError> {
        let url = self.execute_url(runner)?;
        let mut body = request.clone();
        body.runner = Some(runner.to_string());

        tracing::debug!("[HttpBackend] POST {} ({} steps)", url, body.steps.len());

        let mut builder = self
            .client
            .post(url)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .header("x-vercel-ai-data-stream", "v1")
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("UserKey {}", key));
        }

        let response = builder.send().await.map_err(TransportError::from_reqwest)?;

        let status = response.status();
        if status != StatusCode::OK {
            let text = response.text().await.unwrap_or_default();
            let body: String = text.chars().take(MAX_ERROR_BODY).collect();
            tracing::warn!("[HttpBackend] Workflow request rejected with {}", status);
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from_reqwest))
            .boxed())
    }
}
