//! Generation Session Lifecycle
//!
//! A project has at most one non-terminal generation session at a time. Its
//! lifecycle is `Idle -> Started -> Progress* -> Complete | Error | Cancelled`.
//! Inbound events may be duplicated, reordered or arrive after the session has
//! ended; every transition therefore reports whether it was applied or
//! ignored instead of failing.

use crate::models::{GenerationResult, ProjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const UPDATE_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    Idle,
    Started,
    Progress,
    Complete,
    Error,
    Cancelled,
}

impl GenerationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GenerationState::Complete | GenerationState::Error | GenerationState::Cancelled
        )
    }

    /// `Started` or `Progress`: the service is still working on it.
    pub fn is_active(self) -> bool {
        matches!(self, GenerationState::Started | GenerationState::Progress)
    }
}

/// Result of feeding one event into a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Ignored(&'static str),
}

impl Transition {
    pub fn is_applied(self) -> bool {
        matches!(self, Transition::Applied)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("a generation is already in progress for project {0}")]
    AlreadyActive(ProjectId),
}

/// The lifecycle of one generation request for a project.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSession {
    pub project_id: ProjectId,
    /// Client-generated id sent with the request; inbound events carrying a
    /// different id belong to an older session.
    pub generation_id: Uuid,
    pub state: GenerationState,
    /// Percent complete, never decreases.
    pub progress: u8,
    pub stage: Option<String>,
    pub prompt: String,
    pub result: Option<GenerationResult>,
    pub error: Option<String>,
    /// Set when the channel dropped while the session was active.
    pub stalled: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationSession {
    /// Creates a freshly dispatched session in the `Started` state.
    pub fn new(project_id: impl Into<ProjectId>, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            project_id: project_id.into(),
            generation_id: Uuid::new_v4(),
            state: GenerationState::Started,
            progress: 0,
            stage: None,
            prompt: prompt.into(),
            result: None,
            error: None,
            stalled: false,
            started_at: now,
            updated_at: now,
        }
    }

    /// The snapshot published when a project's session is cleared.
    pub fn idle(project_id: impl Into<ProjectId>) -> Self {
        Self {
            state: GenerationState::Idle,
            ..Self::new(project_id, String::new())
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Handles the service's `generation_started` confirmation.
    pub fn acknowledge(&mut self) -> Transition {
        match self.state {
            GenerationState::Started => {
                self.touch();
                Transition::Applied
            }
            GenerationState::Progress => Transition::Ignored("already progressing"),
            _ => Transition::Ignored("session is not active"),
        }
    }

    pub fn apply_progress(&mut self, percent: u8, stage: impl Into<String>) -> Transition {
        if !self.state.is_active() {
            return Transition::Ignored("session is not active");
        }
        if self.stalled {
            return Transition::Ignored("session is stalled");
        }
        let percent = percent.min(100);
        if percent < self.progress {
            return Transition::Ignored("stale progress");
        }
        self.progress = percent;
        self.stage = Some(stage.into());
        self.state = GenerationState::Progress;
        self.touch();
        Transition::Applied
    }

    pub fn complete(&mut self, result: GenerationResult) -> Transition {
        if !self.state.is_active() {
            return Transition::Ignored("session is not active");
        }
        self.state = GenerationState::Complete;
        self.progress = 100;
        self.result = Some(result);
        self.stalled = false;
        self.touch();
        Transition::Applied
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Transition {
        if !self.state.is_active() {
            return Transition::Ignored("session is not active");
        }
        self.state = GenerationState::Error;
        self.error = Some(message.into());
        self.stalled = false;
        self.touch();
        Transition::Applied
    }

    pub fn cancel(&mut self) -> Transition {
        if !self.state.is_active() {
            return Transition::Ignored("session is not active");
        }
        self.state = GenerationState::Cancelled;
        self.stalled = false;
        self.touch();
        Transition::Applied
    }

    pub fn stall(&mut self) -> Transition {
        if !self.state.is_active() || self.stalled {
            return Transition::Ignored("nothing to stall");
        }
        self.stalled = true;
        self.touch();
        Transition::Applied
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// All generation sessions of the client, one per project.
///
/// Every applied change is published on a broadcast channel so UI layers can
/// follow sessions without polling.
pub struct SessionTable {
    sessions: Mutex<HashMap<ProjectId, GenerationSession>>,
    updates: broadcast::Sender<GenerationSession>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            sessions: Mutex::new(HashMap::new()),
            updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GenerationSession> {
        self.updates.subscribe()
    }

    pub fn get(&self, project_id: &str) -> Option<GenerationSession> {
        self.lock().get(project_id).cloned()
    }

    pub fn state(&self, project_id: &str) -> GenerationState {
        self.lock()
            .get(project_id)
            .map(|s| s.state)
            .unwrap_or(GenerationState::Idle)
    }

    /// Installs a newly dispatched session.
    ///
    /// Fails if the project already has an active session, unless that
    /// session is stalled and `replace_stalled` is set.
    pub fn begin(
        &self,
        session: GenerationSession,
        replace_stalled: bool,
    ) -> Result<GenerationSession, SessionError> {
        {
            let mut sessions = self.lock();
            if let Some(current) = sessions.get(&session.project_id) {
                let replaceable = replace_stalled && current.stalled;
                if current.state.is_active() && !replaceable {
                    return Err(SessionError::AlreadyActive(session.project_id.clone()));
                }
            }
            sessions.insert(session.project_id.clone(), session.clone());
        }
        self.publish(session.clone());
        Ok(session)
    }

    /// Applies `f` to the project's session.
    ///
    /// When `generation_id` is given it must match the current session,
    /// otherwise the event is treated as belonging to an older session.
    pub fn apply<F>(&self, project_id: &str, generation_id: Option<Uuid>, f: F) -> Transition
    where
        F: FnOnce(&mut GenerationSession) -> Transition,
    {
        let snapshot = {
            let mut sessions = self.lock();
            let Some(session) = sessions.get_mut(project_id) else {
                return Transition::Ignored("no session for project");
            };
            if generation_id.is_some_and(|id| id != session.generation_id) {
                return Transition::Ignored("generation id mismatch");
            }
            let transition = f(session);
            if !transition.is_applied() {
                debug!(project_id, ?transition, "Generation event ignored");
                return transition;
            }
            session.clone()
        };
        self.publish(snapshot);
        Transition::Applied
    }

    /// Marks every active session as stalled and returns their projects.
    pub fn stall_active(&self) -> Vec<ProjectId> {
        let stalled: Vec<GenerationSession> = {
            let mut sessions = self.lock();
            sessions
                .values_mut()
                .filter_map(|s| s.stall().is_applied().then(|| s.clone()))
                .collect()
        };
        let projects = stalled.iter().map(|s| s.project_id.clone()).collect();
        for session in stalled {
            self.publish(session);
        }
        projects
    }

    pub fn active_projects(&self) -> Vec<ProjectId> {
        self.lock()
            .values()
            .filter(|s| s.state.is_active())
            .map(|s| s.project_id.clone())
            .collect()
    }

    /// Resets the project to `Idle`, returning the session that was removed.
    pub fn clear(&self, project_id: &str) -> Option<GenerationSession> {
        let removed = self.lock().remove(project_id);
        if removed.is_some() {
            self.publish(GenerationSession::idle(project_id));
        }
        removed
    }

    fn publish(&self, session: GenerationSession) {
        // No receivers is fine; nobody is watching yet.
        let _ = self.updates.send(session);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ProjectId, GenerationSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
