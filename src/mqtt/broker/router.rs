//! Session registry and publish fan-out

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rumqttc::QoS;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::mqtt::plugin::BrokerMessage;

const BROKER: &str = "bumper::broker";

/// Instructions delivered to a connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Publish(BrokerMessage),
    /// Another connection took over this client id
    Kick,
    Shutdown,
}

struct SessionEntry {
    conn_id: u64,
    username: Option<String>,
    connected_at: DateTime<Utc>,
    tx: mpsc::Sender<Outbound>,
    subscriptions: HashMap<String, QoS>,
}

/// Public view of one connected session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub client_id: String,
    pub username: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub subscriptions: Vec<String>,
}

#[derive(Default)]
pub struct Router {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    next_conn: AtomicU64,
}

impl Router {
    pub fn next_connection_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a live session. An existing session with the same client id
    /// is told to close.
    pub async fn register(
        &self,
        conn_id: u64,
        client_id: &str,
        username: Option<String>,
        tx: mpsc::Sender<Outbound>,
    ) {
        let entry = SessionEntry {
            conn_id,
            username,
            connected_at: Utc::now(),
            tx,
            subscriptions: HashMap::new(),
        };
        let previous = self
            .sessions
            .write()
            .await
            .insert(client_id.to_string(), entry);
        if let Some(previous) = previous {
            info!(target: BROKER, "Client {} reconnected, closing previous session", client_id);
            let _ = previous.tx.try_send(Outbound::Kick);
        }
    }

    /// Removes the session if `conn_id` still owns `client_id`.
    pub async fn unregister(&self, conn_id: u64, client_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(client_id) {
            Some(entry) if entry.conn_id == conn_id => {
                sessions.remove(client_id);
                true
            }
            _ => false,
        }
    }

    pub async fn subscribe(&self, client_id: &str, filter: &str, qos: QoS) {
        if let Some(entry) = self.sessions.write().await.get_mut(client_id) {
            entry.subscriptions.insert(filter.to_string(), qos);
        }
    }

    pub async fn unsubscribe(&self, client_id: &str, filter: &str) {
        if let Some(entry) = self.sessions.write().await.get_mut(client_id) {
            entry.subscriptions.remove(filter);
        }
    }

    /// Delivers `message` to every session with a matching filter, once per
    /// session at the highest matching QoS capped by the publish QoS.
    pub async fn route(&self, message: &BrokerMessage) -> usize {
        let sessions = self.sessions.read().await;
        let mut delivered = 0;
        for (client_id, entry) in sessions.iter() {
            let granted = entry
                .subscriptions
                .iter()
                .filter(|(filter, _)| topic_matches(filter, &message.topic))
                .map(|(_, qos)| *qos)
                .max_by_key(|qos| *qos as u8);
            let Some(granted) = granted else {
                continue;
            };
            let qos = if (granted as u8) < (message.qos as u8) {
                granted
            } else {
                message.qos
            };
            let outbound = BrokerMessage {
                qos,
                retain: false,
                ..message.clone()
            };
            match entry.tx.try_send(Outbound::Publish(outbound)) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(target: BROKER, "Dropping message for {}: {}", client_id, e),
            }
        }
        debug!(target: BROKER, "Routed {} to {} session(s)", message.topic, delivered);
        delivered
    }

    pub async fn disconnect_all(&self) {
        for entry in self.sessions.read().await.values() {
            let _ = entry.tx.try_send(Outbound::Shutdown);
        }
    }

    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(client_id, entry)| {
                let mut subscriptions: Vec<String> = entry.subscriptions.keys().cloned().collect();
                subscriptions.sort();
                SessionSnapshot {
                    client_id: client_id.clone(),
                    username: entry.username.clone(),
                    connected_at: entry.connected_at,
                    subscriptions,
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        snapshots
    }
}

/// MQTT 3.1.1 topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
