//! Conversation History Cache
//!
//! Keeps the ordered conversation turns of every open project. The cache is
//! append-only: turns are never edited or reordered once recorded. It is
//! seeded from a [`HistorySource`] when a project is opened and appended to
//! locally as generations complete; durable persistence happens elsewhere.

use crate::history_source::HistorySource;
use crate::models::{Message, MessageRole, ProjectId};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

/// A transportable copy of the in-memory history.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistorySnapshot {
    pub exported_at: DateTime<Utc>,
    pub projects: BTreeMap<ProjectId, Vec<Message>>,
}

impl HistorySnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Default)]
pub struct HistoryCache {
    turns: Mutex<HashMap<ProjectId, Vec<Message>>>,
}

impl HistoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a project with previously stored turns.
    ///
    /// Returns `false` and leaves the cache untouched if the project already
    /// has turns, so local appends are never overwritten by a slower fetch.
    pub fn seed(&self, project_id: &str, messages: Vec<Message>) -> bool {
        let mut turns = self.lock();
        let entry = turns.entry(project_id.to_string()).or_default();
        if !entry.is_empty() {
            return false;
        }
        *entry = messages;
        true
    }

    /// Fetches a project's history from `source` and seeds the cache with it.
    ///
    /// Returns the number of turns cached for the project afterwards.
    pub async fn load(&self, source: &dyn HistorySource, project_id: &str) -> Result<usize> {
        let messages = source.fetch_history(project_id).await?;
        let fetched = messages.len();
        let seeded = self.seed(project_id, messages);
        info!(project_id, fetched, seeded, "Conversation history loaded");
        Ok(self.len(project_id))
    }

    pub fn append(&self, project_id: &str, message: Message) {
        self.lock()
            .entry(project_id.to_string())
            .or_default()
            .push(message);
    }

    pub fn messages(&self, project_id: &str) -> Vec<Message> {
        self.lock().get(project_id).cloned().unwrap_or_default()
    }

    pub fn len(&self, project_id: &str) -> usize {
        self.lock().get(project_id).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, project_id: &str) -> bool {
        self.len(project_id) == 0
    }

    /// The most recent user turn and the turns that preceded it.
    pub fn last_user_turn(&self, project_id: &str) -> Option<(Message, Vec<Message>)> {
        let turns = self.lock();
        let history = turns.get(project_id)?;
        let index = history.iter().rposition(|m| m.role == MessageRole::User)?;
        Some((history[index].clone(), history[..index].to_vec()))
    }

    pub fn export_history(&self) -> HistorySnapshot {
        let projects = self
            .lock()
            .iter()
            .map(|(project, messages)| (project.clone(), messages.clone()))
            .collect();
        HistorySnapshot {
            exported_at: Utc::now(),
            projects,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ProjectId, Vec<Message>>> {
        self.turns.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
