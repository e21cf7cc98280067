//! Project rooms and presence.
//!
//! The broadcaster keeps the set of rooms the client has joined and replays
//! `join_room` for each of them after every (re)connection. Member presence is
//! transient: it is rebuilt from room events and dropped on disconnect.

use crate::error::ClientError;
use crate::ws::protocol::{CursorPosition, Envelope, ProjectRef, RoomEvent, events};
use crate::ws::registry::SubscriptionId;
use crate::ws::{Correlator, lock};
use serde::Serialize;
use serde_json::Value;
use sitegen_core::models::ProjectId;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// What is known about one member of a room.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Presence {
    pub typing: bool,
    pub cursor: Option<CursorPosition>,
}

#[derive(Default)]
struct Rooms {
    active: HashSet<ProjectId>,
    members: HashMap<ProjectId, HashMap<String, Presence>>,
}

impl Rooms {
    /// The presence entry of `user_id`, if the room is active.
    fn member(&mut self, project_id: &str, user_id: &str) -> Option<&mut Presence> {
        if !self.active.contains(project_id) || user_id.is_empty() {
            return None;
        }
        Some(
            self.members
                .entry(project_id.to_string())
                .or_default()
                .entry(user_id.to_string())
                .or_default(),
        )
    }
}

#[derive(Clone)]
pub struct RoomBroadcaster {
    correlator: Correlator,
    rooms: Arc<Mutex<Rooms>>,
}

impl RoomBroadcaster {
    pub fn new(correlator: Correlator) -> Self {
        let broadcaster = Self {
            correlator,
            rooms: Arc::new(Mutex::new(Rooms::default())),
        };
        broadcaster.track_connection();
        broadcaster.track_members();
        broadcaster
    }

    /// Joins a project room. Joining a room twice is a no-op.
    ///
    /// While disconnected the room is only recorded; it is joined on the
    /// next successful connection.
    pub async fn join_room(&self, project_id: &str) -> Result<(), ClientError> {
        validate(project_id)?;
        if !lock(&self.rooms).active.insert(project_id.to_string()) {
            debug!(project_id, "Room already joined.");
            return Ok(());
        }
        if !self.correlator.connection().is_connected() {
            info!(project_id, "Room recorded; it will be joined once connected.");
            return Ok(());
        }

        self.emit_join(project_id).await
    }

    /// Leaves a project room. Leaving a room that is not joined is a no-op.
    pub async fn leave_room(&self, project_id: &str) -> Result<(), ClientError> {
        validate(project_id)?;
        let was_active = {
            let mut rooms = lock(&self.rooms);
            rooms.members.remove(project_id);
            rooms.active.remove(project_id)
        };
        if !was_active || !self.correlator.connection().is_connected() {
            return Ok(());
        }
        let payload = ProjectRef {
            project_id: project_id.to_string(),
        };
        self.correlator
            .emit_with(events::LEAVE_ROOM, &payload)
            .await
            .map(|_| ())
    }

    /// Forgets every room without telling the service, for use at logout.
    pub fn forget_all(&self) {
        let mut rooms = lock(&self.rooms);
        rooms.active.clear();
        rooms.members.clear();
    }

    pub fn is_active(&self, project_id: &str) -> bool {
        lock(&self.rooms).active.contains(project_id)
    }

    /// Joined rooms, sorted.
    pub fn active_rooms(&self) -> Vec<ProjectId> {
        let mut rooms: Vec<ProjectId> = lock(&self.rooms).active.iter().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Known members of a room and their presence, keyed by user id.
    pub fn members(&self, project_id: &str) -> BTreeMap<String, Presence> {
        lock(&self.rooms)
            .members
            .get(project_id)
            .map(|m| m.iter().map(|(u, p)| (u.clone(), p.clone())).collect())
            .unwrap_or_default()
    }

    pub async fn broadcast_typing(&self, project_id: &str, is_typing: bool) {
        let Some(mut event) = self.room_event(project_id) else {
            return;
        };
        event.is_typing = Some(is_typing);
        self.broadcast(events::TYPING, event).await;
    }

    pub async fn broadcast_cursor(&self, project_id: &str, position: CursorPosition) {
        let Some(mut event) = self.room_event(project_id) else {
            return;
        };
        event.position = Some(position);
        self.broadcast(events::CURSOR_POSITION, event).await;
    }

    pub async fn broadcast_code_change(&self, project_id: &str, changes: Value) {
        let Some(mut event) = self.room_event(project_id) else {
            return;
        };
        event.changes = Some(changes);
        self.broadcast(events::CODE_CHANGES, event).await;
    }

    pub fn on_typing<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&RoomEvent) + Send + Sync + 'static,
    {
        self.listen(events::TYPING, handler)
    }

    pub fn on_cursor<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&RoomEvent) + Send + Sync + 'static,
    {
        self.listen(events::CURSOR_POSITION, handler)
    }

    pub fn on_code_change<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&RoomEvent) + Send + Sync + 'static,
    {
        self.listen(events::CODE_CHANGES, handler)
    }

    pub fn on_user_joined<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&RoomEvent) + Send + Sync + 'static,
    {
        self.listen(events::USER_JOINED, handler)
    }

    pub fn on_user_left<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&RoomEvent) + Send + Sync + 'static,
    {
        self.listen(events::USER_LEFT, handler)
    }

    /// Registers `handler` for room events of active rooms only.
    fn listen<F>(&self, event: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&RoomEvent) + Send + Sync + 'static,
    {
        let rooms = Arc::clone(&self.rooms);
        self.correlator.connection().subscribe(event, move |frame| {
            let Some(room_event) = frame.payload::<RoomEvent>() else {
                return;
            };
            if lock(&rooms).active.contains(&room_event.project_id) {
                handler(&room_event);
            }
        })
    }

    /// Presence is ephemeral: nothing is sent or buffered while disconnected.
    fn room_event(&self, project_id: &str) -> Option<RoomEvent> {
        let connection = self.correlator.connection();
        if !connection.is_connected() {
            debug!(project_id, "Dropping presence update while disconnected.");
            return None;
        }
        let user_id = connection.identity().map(|i| i.user_id).unwrap_or_default();
        Some(RoomEvent::new(project_id, user_id))
    }

    async fn broadcast(&self, event: &str, payload: RoomEvent) {
        let data = match serde_json::to_value(&payload) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, event, "Failed to encode room event.");
                return;
            }
        };
        if let Err(e) = self.correlator.connection().send(event, data).await {
            debug!(error = %e, event, "Presence update dropped.");
        }
    }

    /// Sends `join_room`. A room the service rejects is dropped from the
    /// active set; timeouts keep it for the next rejoin.
    async fn emit_join(&self, project_id: &str) -> Result<(), ClientError> {
        let payload = ProjectRef {
            project_id: project_id.to_string(),
        };
        match self.correlator.emit_with(events::JOIN_ROOM, &payload).await {
            Ok(_) => Ok(()),
            Err(e @ ClientError::Server { .. }) => {
                let mut rooms = lock(&self.rooms);
                rooms.active.remove(project_id);
                rooms.members.remove(project_id);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Replays joins after every connection and forgets members on disconnect.
    fn track_connection(&self) {
        let connection = self.correlator.connection();

        // The registry belongs to the connection, so hold it weakly.
        let correlator = self.correlator.downgrade();
        let rooms = Arc::clone(&self.rooms);
        connection.subscribe(events::CONNECT, move |_| {
            let Some(correlator) = correlator.upgrade() else {
                return;
            };
            let broadcaster = RoomBroadcaster {
                correlator,
                rooms: Arc::clone(&rooms),
            };
            let pending = broadcaster.active_rooms();
            if pending.is_empty() {
                return;
            }
            tokio::spawn(async move {
                info!(count = pending.len(), "Rejoining rooms.");
                for project_id in pending {
                    if let Err(e) = broadcaster.emit_join(&project_id).await {
                        warn!(project_id = %project_id, error = %e, "Failed to rejoin room.");
                    }
                }
            });
        });

        let rooms = Arc::clone(&self.rooms);
        connection.subscribe(events::DISCONNECT, move |_| {
            lock(&rooms).members.clear();
        });
    }

    fn track_members(&self) {
        let connection = self.correlator.connection();

        let rooms = Arc::clone(&self.rooms);
        connection.subscribe(events::USER_JOINED, move |frame| {
            if let Some(event) = frame.payload::<RoomEvent>() {
                lock(&rooms).member(&event.project_id, &event.user_id);
            }
        });

        let rooms = Arc::clone(&self.rooms);
        connection.subscribe(events::USER_LEFT, move |frame| {
            let Some(event) = frame.payload::<RoomEvent>() else {
                return;
            };
            if let Some(members) = lock(&rooms).members.get_mut(&event.project_id) {
                members.remove(&event.user_id);
            }
        });

        let rooms = Arc::clone(&self.rooms);
        connection.subscribe(events::TYPING, move |frame| {
            update_presence(&rooms, frame, |presence, event| {
                presence.typing = event.is_typing.unwrap_or(false);
            });
        });

        let rooms = Arc::clone(&self.rooms);
        connection.subscribe(events::CURSOR_POSITION, move |frame| {
            update_presence(&rooms, frame, |presence, event| {
                if event.position.is_some() {
                    presence.cursor = event.position;
                }
            });
        });
    }
}

fn update_presence<F>(rooms: &Mutex<Rooms>, frame: &Envelope, update: F)
where
    F: FnOnce(&mut Presence, &RoomEvent),
{
    let Some(event) = frame.payload::<RoomEvent>() else {
        return;
    };
    if let Some(presence) = lock(rooms).member(&event.project_id, &event.user_id) {
        update(presence, &event);
    }
}

fn validate(project_id: &str) -> Result<(), ClientError> {
    if project_id.trim().is_empty() {
        return Err(ClientError::Validation("project id is required".to_string()));
    }
    Ok(())
}
