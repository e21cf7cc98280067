//! Manages the connection lifecycle of the generation channel.
//!
//! `connect` opens a link and performs the `auth` handshake. Once the service
//! answers with `connect`, a supervisor task owns the link: it forwards
//! inbound frames to the durable [`EventRegistry`], sends heartbeats, and on an
//! unexpected drop re-establishes the link with exponential backoff. Local
//! lifecycle events (`connect`, `disconnect`, `reconnect_failed`) go through the
//! same registry as server events.

use super::backoff::Backoff;
use super::lock;
use super::protocol::{AuthPayload, Envelope, ErrorPayload, events};
use super::registry::{EventRegistry, SubscriptionId};
use super::transport::{Connector, Link};
use crate::error::ClientError;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Who the channel authenticates as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub token: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    /// Upper bound on opening a link plus the `auth` handshake.
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Unanswered pings tolerated before the link is treated as dead.
    pub max_missed_heartbeats: u32,
    pub backoff: Backoff,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            max_missed_heartbeats: 3,
            backoff: Backoff::new(Duration::from_secs(1), 5),
        }
    }
}

/// How a supervised link ended.
enum LinkEnd {
    Closed,
    Lost(String),
}

struct Supervisor {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    registry: EventRegistry,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::Sender<Envelope>>>,
    identity: Mutex<Option<Identity>>,
    supervisor: Mutex<Option<Supervisor>>,
    /// Bumped by `disconnect` so an in-flight `connect` knows it was cancelled.
    epoch: AtomicU64,
    attempts: AtomicU32,
    links_established: AtomicU64,
    next_request_id: AtomicU64,
    last_pong: Mutex<Option<Instant>>,
    gave_up: AtomicBool,
}

/// A cloneable handle to the single logical channel.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

/// A handle that does not keep the manager alive, for handlers stored in
/// its own registry.
#[derive(Clone)]
pub struct WeakConnectionManager {
    inner: Weak<Inner>,
}

impl WeakConnectionManager {
    pub fn upgrade(&self) -> Option<ConnectionManager> {
        self.inner.upgrade().map(|inner| ConnectionManager { inner })
    }
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                registry: EventRegistry::new(),
                state,
                outbound: Mutex::new(None),
                identity: Mutex::new(None),
                supervisor: Mutex::new(None),
                epoch: AtomicU64::new(0),
                attempts: AtomicU32::new(0),
                links_established: AtomicU64::new(0),
                next_request_id: AtomicU64::new(1),
                last_pong: Mutex::new(None),
                gave_up: AtomicBool::new(false),
            }),
        }
    }

    /// Opens the channel and authenticates as `identity`.
    ///
    /// Returns once the service has accepted the handshake. Calling this while
    /// already connected is a no-op; calling it while another attempt is in
    /// flight fails without disturbing that attempt. A pending backoff cycle is
    /// abandoned in favour of an immediate attempt.
    ///
    /// A failed attempt is reported to the caller, and the manager then keeps
    /// retrying in the background with the same backoff as after a dropped link.
    #[instrument(skip_all, fields(user_id = %identity.user_id))]
    pub async fn connect(&self, identity: Identity) -> Result<(), ClientError> {
        if self.state() == ConnectionState::Reconnecting {
            self.abandon_supervisor().await;
        }

        let mut current = ConnectionState::Disconnected;
        let claimed = self.inner.state.send_if_modified(|state| {
            current = *state;
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return match current {
                ConnectionState::Connected => Ok(()),
                _ => Err(ClientError::Connection(
                    "a connection attempt is already in progress".to_string(),
                )),
            };
        }

        // A supervisor left over from an abandoned reconnect cycle.
        self.stop_supervisor().await;

        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        *lock(&self.inner.identity) = Some(identity.clone());
        self.inner.gave_up.store(false, Ordering::SeqCst);
        self.inner.attempts.store(0, Ordering::SeqCst);
        info!("Connecting to {}", self.inner.config.url);

        let link = match self.inner.establish(&identity).await {
            Ok(link) => link,
            Err(e) => {
                warn!(error = %e, "Connection failed.");
                if self.inner.epoch.load(Ordering::SeqCst) == epoch {
                    if self.inner.config.backoff.max_attempts > 0 {
                        self.inner.state.send_replace(ConnectionState::Reconnecting);
                        self.spawn_supervisor(None);
                    } else {
                        self.inner.state.send_replace(ConnectionState::Disconnected);
                    }
                }
                return Err(e);
            }
        };
        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            info!("Disconnect requested while connecting; dropping the new link.");
            return Err(ClientError::Connection(
                "connection cancelled by disconnect".to_string(),
            ));
        }

        self.inner.activate(&link.outbound, false);
        self.spawn_supervisor(Some(link));
        Ok(())
    }

    /// Closes the channel on purpose. No reconnection follows. Idempotent.
    pub async fn disconnect(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        *lock(&self.inner.identity) = None;
        self.stop_supervisor().await;

        *lock(&self.inner.outbound) = None;
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.inner.gave_up.store(false, Ordering::SeqCst);
        let previous = self.inner.state.send_replace(ConnectionState::Disconnected);
        if previous == ConnectionState::Connected {
            info!("Channel closed by client.");
            self.inner.dispatch_local(events::DISCONNECT, json!({ "reason": "client" }));
        }
    }

    /// Reconnects immediately with the last identity, skipping any remaining
    /// backoff. This is the only way back once automatic reconnection gave up.
    pub async fn force_reconnect(&self) -> Result<(), ClientError> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        let identity = lock(&self.inner.identity)
            .clone()
            .ok_or_else(|| ClientError::Connection("no identity to reconnect with".to_string()))?;

        info!("Manual reconnect requested.");
        self.abandon_supervisor().await;
        self.connect(identity).await
    }

    /// Sends a one-way frame. Fails immediately when the channel is down.
    pub async fn send(&self, event: &str, data: Value) -> Result<(), ClientError> {
        self.send_frame(Envelope::new(event, data)).await
    }

    pub(crate) async fn send_frame(&self, frame: Envelope) -> Result<(), ClientError> {
        let outbound = lock(&self.inner.outbound)
            .clone()
            .ok_or_else(ClientError::not_connected)?;
        outbound
            .send(frame)
            .await
            .map_err(|_| ClientError::Transport("link closed while sending".to_string()))
    }

    pub fn subscribe<F>(&self, event: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner.registry.subscribe(event, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.registry.unsubscribe(id)
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.inner.registry
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The reconnect attempt in progress, or `0` while connected.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// How many links have been accepted since this manager was created.
    pub fn links_established(&self) -> u64 {
        self.inner.links_established.load(Ordering::SeqCst)
    }

    pub fn last_pong(&self) -> Option<Instant> {
        *lock(&self.inner.last_pong)
    }

    /// `true` once automatic reconnection has given up.
    pub fn needs_manual_reconnect(&self) -> bool {
        self.inner.gave_up.load(Ordering::SeqCst)
    }

    pub fn identity(&self) -> Option<Identity> {
        lock(&self.inner.identity).clone()
    }

    pub fn downgrade(&self) -> WeakConnectionManager {
        WeakConnectionManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.inner.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// `link` is `None` when the first link still has to be established.
    fn spawn_supervisor(&self, link: Option<Link>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let span = info_span!("channel", url = %self.inner.config.url);
        let task = tokio::spawn(supervise(inner, link, shutdown_rx).instrument(span));
        *lock(&self.inner.supervisor) = Some(Supervisor { shutdown, task });
    }

    /// Signals the supervisor to stop and waits for it to finish.
    async fn stop_supervisor(&self) {
        let supervisor = lock(&self.inner.supervisor).take();
        if let Some(Supervisor { shutdown, task }) = supervisor {
            let _ = shutdown.send(true);
            if let Err(e) = task.await {
                error!(error = ?e, "Channel supervisor terminated abnormally.");
            }
        }
    }

    /// Stops a supervisor and returns the manager to `Disconnected`, keeping
    /// the identity for the next attempt.
    async fn abandon_supervisor(&self) {
        self.stop_supervisor().await;
        *lock(&self.inner.outbound) = None;
        let mut previous = ConnectionState::Disconnected;
        self.inner.state.send_if_modified(|state| {
            previous = *state;
            if matches!(
                *state,
                ConnectionState::Reconnecting | ConnectionState::Connected
            ) {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        if previous == ConnectionState::Connected {
            self.inner
                .dispatch_local(events::DISCONNECT, json!({ "reason": "client" }));
        }
    }
}

/// Owns the link until the client closes it or reconnection gives up.
async fn supervise(inner: Arc<Inner>, first: Option<Link>, mut shutdown: watch::Receiver<bool>) {
    let mut link = match first {
        Some(link) => link,
        None => match inner.reconnect(&mut shutdown).await {
            Some(link) => {
                inner.activate(&link.outbound, false);
                link
            }
            None => return,
        },
    };
    loop {
        let reason = match inner.run_link(link, &mut shutdown).await {
            LinkEnd::Closed => return,
            LinkEnd::Lost(reason) => reason,
        };
        warn!(%reason, "Channel lost.");
        let next_state = if inner.config.backoff.max_attempts > 0 {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Disconnected
        };
        inner.state.send_replace(next_state);
        inner.dispatch_local(events::DISCONNECT, json!({ "reason": reason }));

        match inner.reconnect(&mut shutdown).await {
            Some(next) => {
                inner.activate(&next.outbound, true);
                link = next;
            }
            None => return,
        }
    }
}

impl Inner {
    async fn establish(&self, identity: &Identity) -> Result<Link, ClientError> {
        let timeout = self.config.connect_timeout;
        tokio::time::timeout(timeout, self.handshake(identity))
            .await
            .map_err(|_| ClientError::Connection(format!("handshake timed out after {timeout:?}")))?
    }

    async fn handshake(&self, identity: &Identity) -> Result<Link, ClientError> {
        let mut link = self.connector.open(&self.config.url).await?;
        let auth = AuthPayload {
            user_id: identity.user_id.clone(),
            token: identity.token.clone(),
        };
        let data = serde_json::to_value(&auth).map_err(|e| ClientError::Connection(e.to_string()))?;
        link.outbound
            .send(Envelope::new(events::AUTH, data))
            .await
            .map_err(|_| ClientError::Connection("link closed before handshake".to_string()))?;

        loop {
            let Some(frame) = link.inbound.recv().await else {
                return Err(ClientError::Connection("link closed during handshake".to_string()));
            };
            match frame.event.as_str() {
                events::CONNECT => return Ok(link),
                events::AUTH_ERROR => {
                    let reason = error_message(&frame);
                    return Err(ClientError::Connection(format!("authentication rejected: {reason}")));
                }
                events::ERROR => return Err(ClientError::Connection(error_message(&frame))),
                other => debug!(event = other, "Ignoring frame received before handshake."),
            }
        }
    }

    /// Publishes a freshly accepted link.
    fn activate(&self, outbound: &mpsc::Sender<Envelope>, reconnected: bool) {
        *lock(&self.outbound) = Some(outbound.clone());
        self.attempts.store(0, Ordering::SeqCst);
        self.gave_up.store(false, Ordering::SeqCst);
        self.links_established.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Connected);
        info!(reconnected, "Channel connected.");
        self.dispatch_local(events::CONNECT, json!({ "reconnected": reconnected }));
    }

    async fn run_link(&self, link: Link, shutdown: &mut watch::Receiver<bool>) -> LinkEnd {
        let Link {
            outbound,
            mut inbound,
        } = link;
        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut missed: u32 = 0;

        let end = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break LinkEnd::Closed;
                    }
                }
                _ = heartbeat.tick() => {
                    if missed >= self.config.max_missed_heartbeats {
                        break LinkEnd::Lost(format!("{missed} heartbeats went unanswered"));
                    }
                    missed += 1;
                    if outbound.send(Envelope::new(events::PING, Value::Null)).await.is_err() {
                        break LinkEnd::Lost("link closed".to_string());
                    }
                }
                frame = inbound.recv() => match frame {
                    None => break LinkEnd::Lost("transport closed".to_string()),
                    Some(frame) => {
                        if frame.event == events::PONG {
                            missed = 0;
                            *lock(&self.last_pong) = Some(Instant::now());
                        }
                        self.registry.dispatch(&frame);
                    }
                },
            }
        };

        *lock(&self.outbound) = None;
        end
    }

    /// Retries with backoff. `None` when shut down or out of attempts.
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Link> {
        let identity = lock(&self.identity).clone()?;
        let backoff = self.config.backoff;

        for attempt in 1..=backoff.max_attempts {
            let delay = backoff.delay_for(attempt)?;
            self.attempts.store(attempt, Ordering::SeqCst);
            self.state.send_replace(ConnectionState::Reconnecting);
            info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect.");

            tokio::select! {
                _ = shutdown.changed() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            tokio::select! {
                _ = shutdown.changed() => return None,
                result = self.establish(&identity) => match result {
                    Ok(link) => return Some(link),
                    Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed."),
                },
            }
        }

        self.gave_up.store(true, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Disconnected);
        error!(
            attempts = backoff.max_attempts,
            "Giving up on reconnecting; waiting for a manual reconnect."
        );
        self.dispatch_local(
            events::RECONNECT_FAILED,
            json!({ "attempts": backoff.max_attempts }),
        );
        None
    }

    fn dispatch_local(&self, event: &str, data: Value) {
        self.registry.dispatch(&Envelope::new(event, data));
    }
}

fn error_message(frame: &Envelope) -> String {
    frame
        .payload::<ErrorPayload>()
        .map(|p| p.message)
        .filter(|m| !m.is_empty())
        .or_else(|| frame.error.clone())
        .unwrap_or_else(|| "handshake rejected".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::transport::{MemoryConnector, MemoryServer, ServerLink};

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            backoff: Backoff::new(Duration::from_secs(1), 2),
            ..ConnectionConfig::new("memory://studio")
        }
    }

    /// Accepts one link and answers its `auth` frame with `reply`.
    async fn accept_with(server: &mut MemoryServer, reply: Envelope) -> ServerLink {
        let mut link = server.accept().await.unwrap();
        let auth = link.from_client.recv().await.unwrap();
        assert_eq!(auth.event, events::AUTH);
        link.to_client.send(reply).await.unwrap();
        link
    }

    #[tokio::test]
    async fn test_connect_sends_auth_and_reports_connected() {
        let (connector, mut server) = MemoryConnector::pair();
        let manager = ConnectionManager::new(config(), Arc::new(connector));

        let server_task = tokio::spawn(async move {
            let mut link = server.accept().await.unwrap();
            let auth = link.from_client.recv().await.unwrap();
            let payload: AuthPayload = auth.payload().unwrap();
            link.to_client
                .send(Envelope::new(events::CONNECT, Value::Null))
                .await
                .unwrap();
            (payload, link)
        });

        manager
            .connect(Identity::new("u1").with_token("t0k"))
            .await
            .unwrap();
        let (payload, _link) = server_task.await.unwrap();

        assert_eq!(payload.user_id, "u1");
        assert_eq!(payload.token.as_deref(), Some("t0k"));
        assert!(manager.is_connected());
        assert_eq!(manager.links_established(), 1);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_auth_error_fails_connect() {
        let (connector, mut server) = MemoryConnector::pair();
        let manager = ConnectionManager::new(config(), Arc::new(connector));

        tokio::spawn(async move {
            let _link = accept_with(
                &mut server,
                Envelope::new(events::AUTH_ERROR, json!({ "message": "bad token" })),
            )
            .await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let err = manager.connect(Identity::new("u1")).await.unwrap_err();
        assert_eq!(
            err,
            ClientError::Connection("authentication rejected: bad token".to_string())
        );
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_refused_connect_without_retries_leaves_disconnected() {
        let (connector, _server) = MemoryConnector::pair();
        connector.set_refuse_all(true);
        let config = ConnectionConfig {
            backoff: Backoff::new(Duration::from_secs(1), 0),
            ..config()
        };
        let manager = ConnectionManager::new(config, Arc::new(connector));

        assert!(manager.connect(Identity::new("u1")).await.is_err());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.needs_manual_reconnect());
        assert_eq!(manager.identity(), Some(Identity::new("u1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connect_keeps_retrying_until_cap() {
        let (connector, _server) = MemoryConnector::pair();
        connector.set_refuse_all(true);
        let connector = Arc::new(connector);
        let manager = ConnectionManager::new(config(), connector.clone());
        let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();
        manager.subscribe(events::RECONNECT_FAILED, move |frame| {
            let _ = failed_tx.send(frame.data["attempts"].clone());
        });

        assert!(manager.connect(Identity::new("u1")).await.is_err());
        assert_eq!(manager.state(), ConnectionState::Reconnecting);

        assert_eq!(failed_rx.recv().await.unwrap(), json!(2));
        assert_eq!(connector.attempts().len(), 3);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.needs_manual_reconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_retries_after_failed_connect() {
        let (connector, _server) = MemoryConnector::pair();
        connector.set_refuse_all(true);
        let connector = Arc::new(connector);
        let manager = ConnectionManager::new(config(), connector.clone());

        assert!(manager.connect(Identity::new("u1")).await.is_err());
        manager.disconnect().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.identity().is_none());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails_fast() {
        let (connector, _server) = MemoryConnector::pair();
        let manager = ConnectionManager::new(config(), Arc::new(connector));
        assert_eq!(
            manager.send(events::TYPING, Value::Null).await,
            Err(ClientError::not_connected())
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_dispatches_once() {
        let (connector, mut server) = MemoryConnector::pair();
        let manager = ConnectionManager::new(config(), Arc::new(connector));
        let count = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&count);
        manager.subscribe(events::DISCONNECT, move |frame| {
            assert_eq!(frame.data["reason"], "client");
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let server_task = tokio::spawn(async move {
            accept_with(&mut server, Envelope::new(events::CONNECT, Value::Null)).await
        });
        manager.connect(Identity::new("u1")).await.unwrap();
        let _link = server_task.await.unwrap();

        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.identity().is_none());
    }

    #[tokio::test]
    async fn test_inbound_frames_reach_handlers() {
        let (connector, mut server) = MemoryConnector::pair();
        let manager = ConnectionManager::new(config(), Arc::new(connector));
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.subscribe(events::USER_JOINED, move |frame| {
            let _ = tx.send(frame.data.clone());
        });

        let server_task = tokio::spawn(async move {
            accept_with(&mut server, Envelope::new(events::CONNECT, Value::Null)).await
        });
        manager.connect(Identity::new("u1")).await.unwrap();
        let link = server_task.await.unwrap();

        link.to_client
            .send(Envelope::new(events::USER_JOINED, json!({ "userId": "u2" })))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), json!({ "userId": "u2" }));
        manager.disconnect().await;
    }
}
