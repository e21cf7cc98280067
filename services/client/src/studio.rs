//! Studio Session
//!
//! This module defines `StudioSession`, the composition root of the client.
//! It is constructed explicitly by the application, owns the single channel
//! and wires every component around it. Its lifetime follows the user's:
//! `login` opens the channel and `logout` tears it down.

use crate::config::Config;
use crate::error::ClientError;
use crate::generation::GenerationService;
use crate::rooms::RoomBroadcaster;
use crate::ws::transport::Connector;
use crate::ws::{ConnectionManager, Correlator, Identity};
use sitegen_core::fallback::FallbackClient;
use sitegen_core::history::{HistoryCache, HistorySnapshot};
use sitegen_core::history_source::HistorySource;
use sitegen_core::session::GenerationSession;
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Clone)]
pub struct StudioSession {
    pub config: Arc<Config>,
    connection: ConnectionManager,
    rooms: RoomBroadcaster,
    generation: GenerationService,
    history: Arc<HistoryCache>,
    history_source: Arc<dyn HistorySource>,
}

impl StudioSession {
    pub fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        fallback: Arc<dyn FallbackClient>,
        history_source: Arc<dyn HistorySource>,
    ) -> Self {
        let connection = ConnectionManager::new(config.connection(), connector);
        let correlator = Correlator::new(connection.clone(), config.request_timeout);
        let history = Arc::new(HistoryCache::new());
        let rooms = RoomBroadcaster::new(correlator.clone());
        let generation = GenerationService::new(correlator, Arc::clone(&history), fallback);

        Self {
            config: Arc::new(config),
            connection,
            rooms,
            generation,
            history,
            history_source,
        }
    }

    /// Opens the channel as `identity`.
    ///
    /// A failed login leaves the session usable: generations take the
    /// fallback path while the channel keeps retrying in the background.
    #[instrument(skip_all, fields(user_id = %identity.user_id))]
    pub async fn login(&self, identity: Identity) -> Result<(), ClientError> {
        self.connection.connect(identity).await?;
        info!("Logged in.");
        Ok(())
    }

    /// Leaves every room and closes the channel.
    pub async fn logout(&self) {
        self.rooms.forget_all();
        self.connection.disconnect().await;
        info!("Logged out.");
    }

    /// Seeds the project's history and joins its room.
    ///
    /// Returns the number of cached turns. A failing history source is
    /// logged and the project opens with whatever is already cached.
    #[instrument(skip(self))]
    pub async fn open_project(&self, project_id: &str) -> Result<usize, ClientError> {
        if let Err(e) = self
            .history
            .load(self.history_source.as_ref(), project_id)
            .await
        {
            warn!(error = ?e, "Could not load conversation history.");
        }
        self.rooms.join_room(project_id).await?;
        Ok(self.history.len(project_id))
    }

    pub async fn close_project(&self, project_id: &str) -> Result<(), ClientError> {
        self.rooms.leave_room(project_id).await
    }

    /// Starts a generation with the project's cached history as context.
    pub async fn generate(
        &self,
        project_id: &str,
        prompt: &str,
    ) -> Result<GenerationSession, ClientError> {
        let context = self.history.messages(project_id);
        self.generation
            .start_generation(project_id, prompt, context)
            .await
    }

    pub fn export_history(&self) -> HistorySnapshot {
        self.history.export_history()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn rooms(&self) -> &RoomBroadcaster {
        &self.rooms
    }

    pub fn generation(&self) -> &GenerationService {
        &self.generation
    }

    pub fn history(&self) -> &HistoryCache {
        &self.history
    }
}
