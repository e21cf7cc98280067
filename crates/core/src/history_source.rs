//! Conversation History Retrieval
//!
//! The history cache is seeded from an external collaborator when a project
//! is opened. This module defines that contract and its implementations.

use crate::models::Message;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

/// Defines the contract for any service that can return a project's past turns.
///
/// This abstraction lets the client swap between the HTTP history endpoint,
/// an empty source for projects without persistence, and mocks in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Fetches the stored conversation turns for a project, oldest first.
    async fn fetch_history(&self, project_id: &str) -> Result<Vec<Message>>;
}

/// A `HistorySource` backed by the service's REST history endpoint.
///
/// Issues `GET {base_url}/projects/{project_id}/messages` and expects a JSON
/// array of messages.
pub struct HttpHistorySource {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpHistorySource {
    /// Creates a new history source.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Root of the history API, without a trailing slash.
    /// * `token` - Optional bearer token sent with every request.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn messages_url(&self, project_id: &str) -> String {
        format!("{}/projects/{}/messages", self.base_url, project_id)
    }
}

#[async_trait]
impl HistorySource for HttpHistorySource {
    async fn fetch_history(&self, project_id: &str) -> Result<Vec<Message>> {
        let url = self.messages_url(project_id);
        debug!(%url, "Fetching conversation history");

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let messages = request
            .send()
            .await
            .with_context(|| format!("History request to {url} failed"))?
            .error_for_status()
            .context("History service returned an error status")?
            .json::<Vec<Message>>()
            .await
            .context("History response was not a list of messages")?;
        Ok(messages)
    }
}

/// A `HistorySource` for projects with no stored history.
pub struct EmptyHistorySource;

#[async_trait]
impl HistorySource for EmptyHistorySource {
    async fn fetch_history(&self, _project_id: &str) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }
}
