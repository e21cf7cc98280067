//! Drives per-project generations over the channel or the fallback path.
//!
//! A generation request goes through these steps:
//! 1.  A new `Started` session is installed for the project. A project with a
//!     session still in flight is rejected.
//! 2.  The user turn is appended to the conversation history.
//! 3.  If the channel is connected, `generate_website` is sent and the outcome
//!     arrives later as `generation_*` events. Otherwise the fallback client is
//!     awaited and its result applied directly, with no progress in between.
//! 4.  On completion the assistant turn is appended to the history.

use crate::error::ClientError;
use crate::ws::Correlator;
use crate::ws::protocol::{
    Envelope, GenerateRequest, GenerationComplete, GenerationFailed, GenerationProgress,
    GenerationStarted, ProjectRef, events,
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use sitegen_core::fallback::{FallbackClient, FallbackRequest};
use sitegen_core::history::HistoryCache;
use sitegen_core::models::{Message, ProjectId};
use sitegen_core::session::{GenerationSession, GenerationState, SessionTable, Transition};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

struct Inner {
    correlator: Correlator,
    sessions: SessionTable,
    history: Arc<HistoryCache>,
    fallback: Arc<dyn FallbackClient>,
}

#[derive(Clone)]
pub struct GenerationService {
    inner: Arc<Inner>,
}

impl GenerationService {
    pub fn new(
        correlator: Correlator,
        history: Arc<HistoryCache>,
        fallback: Arc<dyn FallbackClient>,
    ) -> Self {
        let service = Self {
            inner: Arc::new(Inner {
                correlator,
                sessions: SessionTable::new(),
                history,
                fallback,
            }),
        };
        service.route_inbound();
        service
    }

    /// Starts a generation for `project_id` with `history` as prior context.
    ///
    /// On the channel path this returns as soon as the request is dispatched;
    /// on the fallback path it returns once the generation has finished.
    #[instrument(skip_all, fields(project_id = %project_id))]
    pub async fn start_generation(
        &self,
        project_id: &str,
        prompt: &str,
        history: Vec<Message>,
    ) -> Result<GenerationSession, ClientError> {
        if project_id.trim().is_empty() {
            return Err(ClientError::Validation("project id is required".to_string()));
        }
        if prompt.trim().is_empty() {
            return Err(ClientError::Validation("prompt must not be empty".to_string()));
        }
        self.dispatch(project_id, prompt, history, false, true).await
    }

    /// Resubmits the project's most recent user turn as a new generation.
    ///
    /// The turns before it are sent as context and no duplicate user turn is
    /// recorded. A session stalled by a disconnect may be replaced.
    #[instrument(skip_all, fields(project_id = %project_id))]
    pub async fn retry_last(&self, project_id: &str) -> Result<GenerationSession, ClientError> {
        let (last, context) = self
            .inner
            .history
            .last_user_turn(project_id)
            .ok_or_else(|| ClientError::Validation("no user message to retry".to_string()))?;
        info!("Retrying the last user message.");
        self.dispatch(project_id, &last.content, context, true, false)
            .await
    }

    /// Asks the service to cancel the project's active generation.
    ///
    /// Returns `false` if there was nothing to cancel.
    pub async fn cancel_generation(&self, project_id: &str) -> Result<bool, ClientError> {
        let Some(session) = self.active_session(project_id) else {
            debug!(project_id, "No active generation to cancel.");
            return Ok(false);
        };
        let payload = json!({
            "projectId": project_id,
            "generationId": session.generation_id,
        });
        self.inner
            .correlator
            .emit(events::CANCEL_GENERATION, payload)
            .await?;

        let transition =
            self.inner
                .sessions
                .apply(project_id, Some(session.generation_id), |s| s.cancel());
        info!(project_id, cancelled = transition.is_applied(), "Cancel acknowledged.");
        Ok(transition.is_applied())
    }

    /// The service's own view of the project's generation.
    pub async fn generation_status(&self, project_id: &str) -> Result<Value, ClientError> {
        let payload = ProjectRef {
            project_id: project_id.to_string(),
        };
        self.inner
            .correlator
            .emit_with(events::GET_GENERATION_STATUS, &payload)
            .await
    }

    /// Resets the project to `Idle`.
    pub fn clear(&self, project_id: &str) -> Option<GenerationSession> {
        self.inner.sessions.clear(project_id)
    }

    pub fn session(&self, project_id: &str) -> Option<GenerationSession> {
        self.inner.sessions.get(project_id)
    }

    pub fn state(&self, project_id: &str) -> GenerationState {
        self.inner.sessions.state(project_id)
    }

    /// Every applied session change, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<GenerationSession> {
        self.inner.sessions.subscribe()
    }

    pub fn history(&self) -> &HistoryCache {
        &self.inner.history
    }

    fn active_session(&self, project_id: &str) -> Option<GenerationSession> {
        self.inner
            .sessions
            .get(project_id)
            .filter(|s| s.state.is_active())
    }

    async fn dispatch(
        &self,
        project_id: &str,
        prompt: &str,
        history: Vec<Message>,
        replace_stalled: bool,
        record_user_turn: bool,
    ) -> Result<GenerationSession, ClientError> {
        let session = self
            .inner
            .sessions
            .begin(GenerationSession::new(project_id, prompt), replace_stalled)?;
        if record_user_turn {
            self.inner.history.append(project_id, Message::user(prompt));
        }

        if self.inner.correlator.connection().is_connected() {
            match self.dispatch_channel(&session, history.clone()).await {
                Ok(()) => return Ok(session),
                Err(e) => warn!(error = %e, "Channel send failed; using the fallback path."),
            }
        }
        self.dispatch_fallback(session, history).await
    }

    /// Sends `generate_website`, leaving the outcome to inbound events.
    ///
    /// Returns once the request is on the wire; only the acknowledgment is
    /// awaited in the background.
    async fn dispatch_channel(
        &self,
        session: &GenerationSession,
        history: Vec<Message>,
    ) -> Result<(), ClientError> {
        let request = GenerateRequest {
            project_id: session.project_id.clone(),
            generation_id: session.generation_id,
            message: session.prompt.clone(),
            conversation_history: history,
        };
        let pending = self
            .inner
            .correlator
            .request_with(events::GENERATE_WEBSITE, &request)
            .await?;
        info!(generation_id = %request.generation_id, "Dispatched generation over the channel.");

        let inner = Arc::clone(&self.inner);
        let project_id = request.project_id;
        let generation_id = Some(request.generation_id);
        let span = info_span!("generate", project_id = %project_id);
        tokio::spawn(
            async move {
                match pending.reply().await {
                    Ok(_) => debug!("Generation request accepted."),
                    Err(ClientError::Server { message, .. }) => {
                        warn!(%message, "Generation request rejected.");
                        inner
                            .sessions
                            .apply(&project_id, generation_id, |s| s.fail(message));
                    }
                    Err(ClientError::Transport(reason)) => {
                        warn!(%reason, "Channel dropped before the request was acknowledged.");
                        inner.sessions.apply(&project_id, generation_id, |s| s.stall());
                    }
                    Err(e) => warn!(error = %e, "No acknowledgment; waiting for outcome events."),
                }
            }
            .instrument(span),
        );
        Ok(())
    }

    async fn dispatch_fallback(
        &self,
        session: GenerationSession,
        history: Vec<Message>,
    ) -> Result<GenerationSession, ClientError> {
        let project_id = session.project_id.clone();
        let generation_id = Some(session.generation_id);
        info!("Channel unavailable; using the fallback path.");

        let request = FallbackRequest {
            project_id: project_id.clone(),
            message: session.prompt.clone(),
            conversation_history: history,
        };
        match self.inner.fallback.generate(request).await {
            Ok(result) => {
                let transition = self
                    .inner
                    .sessions
                    .apply(&project_id, generation_id, |s| s.complete(result.clone()));
                if transition.is_applied() {
                    self.inner
                        .history
                        .append(&project_id, Message::assistant(&result));
                }
                Ok(self.inner.sessions.get(&project_id).unwrap_or(session))
            }
            Err(e) => {
                let message = format!("{e:#}");
                warn!(error = %message, "Fallback generation failed.");
                self.inner
                    .sessions
                    .apply(&project_id, generation_id, |s| s.fail(message.clone()));
                Err(ClientError::Generation(message))
            }
        }
    }

    /// Routes inbound generation events onto the session table.
    fn route_inbound(&self) {
        self.on::<GenerationStarted, _>(events::GENERATION_STARTED, |inner, event| {
            inner
                .sessions
                .apply(&event.project_id, event.generation_id, |s| s.acknowledge());
        });

        self.on::<GenerationProgress, _>(events::GENERATION_PROGRESS, |inner, event| {
            let percent = event.percent();
            inner.sessions.apply(&event.project_id, event.generation_id, |s| {
                s.apply_progress(percent, event.stage.clone())
            });
        });

        self.on::<GenerationComplete, _>(events::GENERATION_COMPLETE, |inner, event| {
            let transition = inner.sessions.apply(&event.project_id, event.generation_id, |s| {
                s.complete(event.result.clone())
            });
            if transition == Transition::Applied {
                inner
                    .history
                    .append(&event.project_id, Message::assistant(&event.result));
                info!(project_id = %event.project_id, "Generation complete.");
            }
        });

        self.on::<GenerationFailed, _>(events::GENERATION_ERROR, |inner, event| {
            let transition = inner.sessions.apply(&event.project_id, event.generation_id, |s| {
                s.fail(event.error.clone())
            });
            if transition.is_applied() {
                warn!(project_id = %event.project_id, error = %event.error, "Generation failed.");
            }
        });

        let inner = Arc::downgrade(&self.inner);
        self.inner
            .correlator
            .connection()
            .subscribe(events::DISCONNECT, move |_| {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let stalled: Vec<ProjectId> = inner.sessions.stall_active();
                if !stalled.is_empty() {
                    warn!(?stalled, "Generations stalled by disconnect.");
                }
            });
    }

    /// Subscribes `apply` to decoded `event` payloads. The handler lives in
    /// the connection's registry, so it only holds the service weakly.
    fn on<T, F>(&self, event: &str, apply: F)
    where
        T: DeserializeOwned + 'static,
        F: Fn(&Inner, T) + Send + Sync + 'static,
    {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.correlator.connection().subscribe(event, move |frame| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if let Some(payload) = decode::<T>(frame) {
                apply(&inner, payload);
            }
        });
    }
}

fn decode<T: DeserializeOwned>(frame: &Envelope) -> Option<T> {
    let payload = frame.payload::<T>();
    if payload.is_none() {
        warn!(event = %frame.event, "Ignoring malformed generation event.");
    }
    payload
}
