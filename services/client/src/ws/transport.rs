//! Physical links to the generation service.
//!
//! The connection manager only sees a [`Link`]: a pair of channels carrying
//! decoded [`Envelope`]s. How the link is opened is up to the [`Connector`]:
//! a WebSocket for the real service, or an in-process pair for embedding and
//! tests.

use super::lock;
use super::protocol::Envelope;
use crate::error::ClientError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, info, warn};

const LINK_BUFFER: usize = 128;

/// One open link. Dropping `outbound` closes it from the client side; the
/// link is gone once `inbound` yields `None`.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::Sender<Envelope>,
    pub inbound: mpsc::Receiver<Envelope>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<Link, ClientError>;
}

/// Opens links over a WebSocket using `tokio-tungstenite`.
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str) -> Result<Link, ClientError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| ClientError::Connection(format!("failed to open {url}: {e}")))?;
        info!(%url, "WebSocket opened.");
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<Envelope>(LINK_BUFFER);

        // Pump frames between the socket and the link until either side closes.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => match outgoing {
                        Some(envelope) => {
                            let text = match serde_json::to_string(&envelope) {
                                Ok(text) => text,
                                Err(e) => {
                                    warn!(error = %e, event = %envelope.event, "Dropping unserializable frame");
                                    continue;
                                }
                            };
                            if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                                warn!(error = %e, "WebSocket send failed");
                                break;
                            }
                        }
                        None => {
                            let _ = ws_tx.close().await;
                            break;
                        }
                    },
                    incoming = ws_rx.next() => match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<Envelope>(&text) {
                                Ok(envelope) => {
                                    if in_tx.send(envelope).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!(error = %e, "Ignoring malformed frame"),
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "WebSocket receive failed");
                            break;
                        }
                    },
                }
            }
            debug!("WebSocket pump finished.");
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// The service side of an in-process link.
#[derive(Debug)]
pub struct ServerLink {
    /// Frames sent by the client.
    pub from_client: mpsc::Receiver<Envelope>,
    /// Frames delivered to the client.
    pub to_client: mpsc::Sender<Envelope>,
}

/// Accepts the links opened through a [`MemoryConnector`].
pub struct MemoryServer {
    accepted: mpsc::UnboundedReceiver<ServerLink>,
}

impl MemoryServer {
    /// Waits for the next link. `None` once the connector is dropped.
    pub async fn accept(&mut self) -> Option<ServerLink> {
        self.accepted.recv().await
    }
}

/// An in-process [`Connector`]. Links are plain channel pairs handed to the
/// paired [`MemoryServer`]; connection attempts can be refused on demand.
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<ServerLink>,
    refuse_all: AtomicBool,
    refuse_next: AtomicU32,
    attempts: Mutex<Vec<Instant>>,
}

impl MemoryConnector {
    pub fn pair() -> (Self, MemoryServer) {
        let (accept_tx, accepted) = mpsc::unbounded_channel();
        let connector = Self {
            accept_tx,
            refuse_all: AtomicBool::new(false),
            refuse_next: AtomicU32::new(0),
            attempts: Mutex::new(Vec::new()),
        };
        (connector, MemoryServer { accepted })
    }

    /// Refuses every attempt until switched off again.
    pub fn set_refuse_all(&self, refuse: bool) {
        self.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Refuses the next `count` attempts.
    pub fn refuse_next(&self, count: u32) {
        self.refuse_next.store(count, Ordering::SeqCst);
    }

    /// When each connection attempt was made, refused or not.
    pub fn attempts(&self) -> Vec<Instant> {
        lock(&self.attempts).clone()
    }

    fn should_refuse(&self) -> bool {
        if self.refuse_all.load(Ordering::SeqCst) {
            return true;
        }
        self.refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, url: &str) -> Result<Link, ClientError> {
        lock(&self.attempts).push(Instant::now());
        if self.should_refuse() {
            return Err(ClientError::Connection(format!("{url} refused the connection")));
        }

        let (client_tx, server_rx) = mpsc::channel(LINK_BUFFER);
        let (server_tx, client_rx) = mpsc::channel(LINK_BUFFER);
        self.accept_tx
            .send(ServerLink {
                from_client: server_rx,
                to_client: server_tx,
            })
            .map_err(|_| ClientError::Connection(format!("{url} is not listening")))?;

        Ok(Link {
            outbound: client_tx,
            inbound: client_rx,
        })
    }
}
