//! Broker hooks
//!
//! The broker front-end calls a [`BrokerPlugin`] for every session event.
//! [`BumperPlugin`] routes them to the authenticator, the connection tracker
//! and the proxy bridge.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use tracing::debug;

use super::auth::{AuthOutcome, Authenticator};
use super::proxy::ProxyBridge;
use super::topic::{MessageRole, ParsedTopic};
use super::tracker::ConnectionTracker;

const MESSAGES: &str = "bumper::messages";

/// Credentials presented in one CONNECT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "client_id={} username={} password={}",
            self.client_id.as_deref().unwrap_or("<none>"),
            self.username.as_deref().unwrap_or("<none>"),
            if self.password.is_some() { "<set>" } else { "<none>" }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[async_trait]
pub trait BrokerPlugin: Send + Sync {
    async fn authenticate(&self, session: &mut Session) -> AuthOutcome;
    async fn on_client_connected(&self, client_id: &str, session: &Session);
    async fn on_client_disconnected(&self, client_id: &str, session: &Session);
    async fn on_client_subscribed(&self, client_id: &str, filter: &str, qos: QoS);
    async fn on_message_received(&self, client_id: &str, message: &BrokerMessage);
    async fn on_broker_shutdown(&self);
}

pub struct BumperPlugin {
    authenticator: Authenticator,
    tracker: ConnectionTracker,
    bridge: Arc<ProxyBridge>,
}

impl BumperPlugin {
    pub fn new(
        authenticator: Authenticator,
        tracker: ConnectionTracker,
        bridge: Arc<ProxyBridge>,
    ) -> Self {
        Self {
            authenticator,
            tracker,
            bridge,
        }
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }
}

#[async_trait]
impl BrokerPlugin for BumperPlugin {
    async fn authenticate(&self, session: &mut Session) -> AuthOutcome {
        self.authenticator.authenticate(session).await
    }

    async fn on_client_connected(&self, client_id: &str, _session: &Session) {
        self.tracker.on_connected(client_id).await;
    }

    async fn on_client_disconnected(&self, client_id: &str, _session: &Session) {
        self.tracker.on_disconnected(client_id).await;
    }

    async fn on_client_subscribed(&self, client_id: &str, filter: &str, qos: QoS) {
        self.tracker.on_subscribed(client_id, filter, qos).await;
    }

    async fn on_message_received(&self, client_id: &str, message: &BrokerMessage) {
        match ParsedTopic::parse(&message.topic) {
            Ok(topic) => log_message(topic.role(), &message.topic, &message.payload),
            Err(e) => {
                debug!(target: "bumper::proxy", "Received message with invalid topic: {}", e);
                return;
            }
        }
        let outcome = self.bridge.on_broker_message_received(message, client_id).await;
        debug!(target: "bumper::proxy", "Message from {} :: {:?}", client_id, outcome);
    }

    async fn on_broker_shutdown(&self) {
        self.tracker.tasks().shutdown().await;
        self.bridge.shutdown().await;
    }
}

fn log_message(role: MessageRole, topic: &str, payload: &[u8]) {
    debug!(
        target: MESSAGES,
        "{} :: Topic: {} :: Message: {}",
        role.label(),
        topic,
        String::from_utf8_lossy(payload)
    );
}
