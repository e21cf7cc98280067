//! Awaitable calls over a one-way channel.
//!
//! Each call carries a fresh request id; the service answers with an `ack`
//! frame echoing it. A call resolves exactly once: with the reply, with the
//! service's explicit error, with a timeout, or with a transport error when
//! the channel drops while it is outstanding.

use super::connection::{ConnectionManager, WeakConnectionManager};
use super::lock;
use super::protocol::{Envelope, events};
use crate::error::ClientError;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

type Reply = Result<Value, ClientError>;

struct PendingCall {
    event: String,
    reply: oneshot::Sender<Reply>,
}

type Pending = Arc<Mutex<HashMap<u64, PendingCall>>>;

#[derive(Clone)]
pub struct Correlator {
    connection: ConnectionManager,
    pending: Pending,
    timeout: Duration,
}

impl Correlator {
    pub fn new(connection: ConnectionManager, timeout: Duration) -> Self {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let acks = Arc::clone(&pending);
        connection.subscribe(events::ACK, move |frame| resolve(&acks, frame));
        let dropped = Arc::clone(&pending);
        connection.subscribe(events::DISCONNECT, move |_| fail_all(&dropped));

        Self {
            connection,
            pending,
            timeout,
        }
    }

    /// Sends `event` and waits for its reply.
    ///
    /// Rejects immediately when the channel is down; nothing is queued.
    pub async fn emit(&self, event: &str, data: Value) -> Result<Value, ClientError> {
        self.request(event, data).await?.reply().await
    }

    /// Puts `event` on the wire and returns the reply still to be awaited.
    ///
    /// When this returns `Ok` the frame has been handed to the link, so
    /// anything sent afterwards reaches the service after it.
    pub async fn request(&self, event: &str, data: Value) -> Result<PendingReply, ClientError> {
        if !self.connection.is_connected() {
            return Err(ClientError::not_connected());
        }

        let request_id = self.connection.next_request_id();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(
            request_id,
            PendingCall {
                event: event.to_string(),
                reply: tx,
            },
        );

        if let Err(e) = self
            .connection
            .send_frame(Envelope::request(event, request_id, data))
            .await
        {
            lock(&self.pending).remove(&request_id);
            return Err(e);
        }
        debug!(event, request_id, "Awaiting reply.");

        Ok(PendingReply {
            event: event.to_string(),
            request_id,
            rx,
            pending: Arc::clone(&self.pending),
            timeout: self.timeout,
        })
    }

    /// Like [`Correlator::emit`], serializing `payload` first.
    pub async fn emit_with<T: Serialize>(
        &self,
        event: &str,
        payload: &T,
    ) -> Result<Value, ClientError> {
        let data =
            serde_json::to_value(payload).map_err(|e| ClientError::Validation(e.to_string()))?;
        self.emit(event, data).await
    }

    /// Like [`Correlator::request`], serializing `payload` first.
    pub async fn request_with<T: Serialize>(
        &self,
        event: &str,
        payload: &T,
    ) -> Result<PendingReply, ClientError> {
        let data =
            serde_json::to_value(payload).map_err(|e| ClientError::Validation(e.to_string()))?;
        self.request(event, data).await
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub(crate) fn downgrade(&self) -> WeakCorrelator {
        WeakCorrelator {
            connection: self.connection.downgrade(),
            pending: Arc::clone(&self.pending),
            timeout: self.timeout,
        }
    }
}

/// A correlator that does not keep its connection alive.
#[derive(Clone)]
pub(crate) struct WeakCorrelator {
    connection: WeakConnectionManager,
    pending: Pending,
    timeout: Duration,
}

impl WeakCorrelator {
    pub(crate) fn upgrade(&self) -> Option<Correlator> {
        Some(Correlator {
            connection: self.connection.upgrade()?,
            pending: Arc::clone(&self.pending),
            timeout: self.timeout,
        })
    }
}

/// A request already sent, waiting for its `ack`.
pub struct PendingReply {
    event: String,
    request_id: u64,
    rx: oneshot::Receiver<Reply>,
    pending: Pending,
    timeout: Duration,
}

impl PendingReply {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Waits for the reply, giving up after the correlator's timeout.
    pub async fn reply(self) -> Result<Value, ClientError> {
        let Self {
            event,
            request_id,
            rx,
            pending,
            timeout,
        } = self;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ClientError::Transport(format!(
                "`{event}` was dropped before a reply arrived"
            ))),
            Err(_) => {
                lock(&pending).remove(&request_id);
                warn!(event = %event, request_id, "No reply within {timeout:?}.");
                Err(ClientError::Timeout { event, after: timeout })
            }
        }
    }
}

fn resolve(pending: &Pending, frame: &Envelope) {
    let Some(request_id) = frame.request_id else {
        warn!("Ignoring ack without a request id.");
        return;
    };
    let Some(call) = lock(pending).remove(&request_id) else {
        debug!(request_id, "Ignoring ack for an unknown or expired request.");
        return;
    };
    let reply = match &frame.error {
        Some(message) => Err(ClientError::Server {
            event: call.event,
            message: message.clone(),
        }),
        None => Ok(frame.data.clone()),
    };
    let _ = call.reply.send(reply);
}

fn fail_all(pending: &Pending) {
    let calls: Vec<PendingCall> = lock(pending).drain().map(|(_, call)| call).collect();
    if !calls.is_empty() {
        warn!(count = calls.len(), "Failing outstanding calls after disconnect.");
    }
    for call in calls {
        let _ = call.reply.send(Err(ClientError::Transport(format!(
            "channel dropped while `{}` was outstanding",
            call.event
        ))));
    }
}
