//! A scripted generation service for integration tests.

#![allow(dead_code)]

use serde_json::{Value, json};
use sitegen_client::config::Config;
use sitegen_client::studio::StudioSession;
use sitegen_client::ws::protocol::{Envelope, events};
use sitegen_client::ws::transport::{MemoryConnector, MemoryServer, ServerLink};
use sitegen_client::ws::{ConnectionState, Identity};
use sitegen_core::fallback::{FallbackClient, MockFallbackClient};
use sitegen_core::history_source::EmptyHistorySource;
use sitegen_core::session::GenerationSession;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

pub const PROJECT: &str = "p1";

/// Fast reconnects so real-time tests finish quickly.
pub fn config() -> Config {
    Config {
        server_url: "ws://studio.test/socket".to_string(),
        reconnect_base_delay: Duration::from_millis(10),
        ..Config::default()
    }
}

pub struct Harness {
    pub studio: StudioSession,
    pub connector: Arc<MemoryConnector>,
    pub server: MemoryServer,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        Self::with_fallback(config, MockFallbackClient::failing("fallback not expected"))
    }

    pub fn with_fallback(config: Config, fallback: impl FallbackClient + 'static) -> Self {
        let (connector, server) = MemoryConnector::pair();
        let connector = Arc::new(connector);
        let studio = StudioSession::new(
            config,
            connector.clone(),
            Arc::new(fallback),
            Arc::new(EmptyHistorySource),
        );
        Self {
            studio,
            connector,
            server,
        }
    }

    /// Logs in as `u1` and returns the service side of the link.
    pub async fn login(&mut self) -> ServerLink {
        let (result, link) = tokio::join!(
            self.studio.login(Identity::new("u1")),
            accept(&mut self.server)
        );
        result.expect("login failed");
        link
    }
}

/// Accepts the next link and completes its handshake.
pub async fn accept(server: &mut MemoryServer) -> ServerLink {
    let mut link = server.accept().await.expect("connector dropped");
    let auth = link.from_client.recv().await.expect("no auth frame");
    assert_eq!(auth.event, events::AUTH);
    push(&link, events::CONNECT, Value::Null).await;
    link
}

/// Waits for the next frame named `event`, answering pings on the way.
pub async fn expect(link: &mut ServerLink, event: &str) -> Envelope {
    loop {
        let frame = link
            .from_client
            .recv()
            .await
            .unwrap_or_else(|| panic!("link closed while waiting for `{event}`"));
        if frame.event == event {
            return frame;
        }
        if frame.event == events::PING {
            push(link, events::PONG, Value::Null).await;
        }
    }
}

pub async fn push(link: &ServerLink, event: &str, data: Value) {
    link.to_client
        .send(Envelope::new(event, data))
        .await
        .expect("client side of the link is gone");
}

pub async fn ack(link: &ServerLink, request: &Envelope, data: Value) {
    let id = request.request_id.expect("request without id");
    link.to_client
        .send(Envelope::ack(id, data))
        .await
        .expect("client side of the link is gone");
}

pub fn result_payload(project_id: &str, generation_id: Value, text: &str) -> Value {
    json!({
        "projectId": project_id,
        "generationId": generation_id,
        "result": {
            "conversationalResponse": text,
            "generatedArtifact": { "html": "<h1>Hello</h1>" },
            "tokensUsed": 812,
            "responseTimeMs": 5400,
            "conversationId": "c-1",
        }
    })
}

/// Collects session updates for `project_id` until one is terminal.
pub async fn settle(
    updates: &mut broadcast::Receiver<GenerationSession>,
    project_id: &str,
) -> Vec<GenerationSession> {
    let mut seen = Vec::new();
    loop {
        let session = updates.recv().await.expect("session updates closed");
        if session.project_id != project_id {
            continue;
        }
        let done = session.is_terminal();
        seen.push(session);
        if done {
            return seen;
        }
    }
}

pub async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, state: ConnectionState) {
    rx.wait_for(|s| *s == state)
        .await
        .expect("connection manager dropped");
}

/// Bounds a real-time test step.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("test step timed out")
}
