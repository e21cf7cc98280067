//! Synchronous fallback path to the generation service.
//!
//! Used when the persistent channel is down. One blocking request carries the
//! same input as a channel generation and returns the full result at once.

use crate::models::{GenerationResult, Message, ProjectId};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// The request body of the fallback endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FallbackRequest {
    pub project_id: ProjectId,
    pub message: String,
    pub conversation_history: Vec<Message>,
}

/// The response body of the fallback endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FallbackResponse {
    pub result: GenerationResult,
}

#[derive(Deserialize)]
struct FallbackErrorBody {
    #[serde(alias = "message")]
    error: String,
}

/// A client able to run one generation without the persistent channel.
#[async_trait]
pub trait FallbackClient: Send + Sync {
    /// Runs a generation to completion and returns its result.
    async fn generate(&self, request: FallbackRequest) -> Result<GenerationResult>;
}

/// An implementation of `FallbackClient` over the service's HTTP endpoint.
pub struct HttpFallbackClient {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpFallbackClient {
    /// Creates a new fallback client.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - Full URL of the generation endpoint.
    /// * `token` - Optional bearer token.
    /// * `timeout` - Upper bound for the whole request, generation included.
    pub fn new(endpoint: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token,
        })
    }
}

#[async_trait]
impl FallbackClient for HttpFallbackClient {
    async fn generate(&self, request: FallbackRequest) -> Result<GenerationResult> {
        debug!(project_id = %request.project_id, endpoint = %self.endpoint, "Sending fallback generation request");

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .send()
            .await
            .context("Fallback generation request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<FallbackErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or(body);
            return Err(anyhow!("{} ({})", message.trim(), status));
        }

        let body: FallbackResponse = response
            .json()
            .await
            .context("Fallback response did not match the expected shape")?;
        Ok(body.result)
    }
}

/// A deterministic `FallbackClient` for development and tests.
///
/// Replies to every request with a canned response that echoes the prompt,
/// or fails every request with a fixed message.
pub struct MockFallbackClient {
    failure: Option<String>,
}

impl MockFallbackClient {
    pub fn succeeding() -> Self {
        Self { failure: None }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
        }
    }
}

#[async_trait]
impl FallbackClient for MockFallbackClient {
    async fn generate(&self, request: FallbackRequest) -> Result<GenerationResult> {
        if let Some(message) = &self.failure {
            return Err(anyhow!(message.clone()));
        }
        Ok(GenerationResult {
            conversational_response: format!("Generated: {}", request.message),
            generated_artifact: None,
            tokens_used: request.message.split_whitespace().count() as u64,
            response_time_ms: 0,
            conversation_id: Some(format!("fallback-{}", request.project_id)),
        })
    }
}
