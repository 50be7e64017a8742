//! Connection tracker
//!
//! Reflects broker connect, disconnect and subscribe events into the
//! persisted connection flags. Bots get a timezone sync command shortly after
//! they connect.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local, Offset, TimeZone};
use rumqttc::QoS;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::helper_bot::{CommandChannel, MqttCommand};
use super::identity::{ClientIdentity, ClientKind, UserRealms, HELPER_BOT_CLIENT_ID};
use super::proxy::ProxyBridge;
use crate::db::{BotRecord, Repository};

const PROXY: &str = "bumper::proxy";

/// Background tasks owned by the broker plugin, aborted on shutdown.
#[derive(Default)]
pub struct TaskSet {
    tasks: Mutex<JoinSet<()>>,
}

impl TaskSet {
    pub fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        tasks.spawn(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for every task spawned so far to finish.
    pub async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        while tasks.join_next().await.is_some() {}
    }

    /// Aborts every running task and waits for the aborts to land.
    pub async fn shutdown(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        if !tasks.is_empty() {
            debug!("Aborting {} background task(s)", tasks.len());
        }
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

/// Builds the `setTimeZone` command for `bot` at local time `now`.
pub fn timezone_command<Tz: TimeZone>(bot: &BotRecord, now: DateTime<Tz>) -> MqttCommand {
    let offset_minutes = now.offset().fix().local_minus_utc() / 60;
    let timestamp_s = now.timestamp();
    let timestamp_ms = timestamp_s * 1000;
    let task_id = timestamp_s * 1_000_000;

    MqttCommand {
        cmd_name: "setTimeZone".to_string(),
        to_id: bot.did.clone(),
        to_type: bot.class_id.clone(),
        to_res: bot.resource.clone(),
        payload: json!({
            "header": {
                "pri": 2,
                "ts": timestamp_ms.to_string(),
                "tzm": offset_minutes,
                "ver": "0.0.22",
            },
            "body": {
                "data": {
                    "tzm": offset_minutes,
                    "bdTaskID": task_id.to_string(),
                },
            },
        }),
        payload_type: "j".to_string(),
        request_id: None,
        version: "1".to_string(),
    }
}

pub struct ConnectionTracker {
    repository: Arc<dyn Repository>,
    bridge: Arc<ProxyBridge>,
    commands: Arc<dyn CommandChannel>,
    realms: UserRealms,
    sync_timezone: bool,
    tasks: TaskSet,
}

impl ConnectionTracker {
    pub fn new(
        repository: Arc<dyn Repository>,
        bridge: Arc<ProxyBridge>,
        commands: Arc<dyn CommandChannel>,
        realms: UserRealms,
        sync_timezone: bool,
    ) -> Self {
        Self {
            repository,
            bridge,
            commands,
            realms,
            sync_timezone,
            tasks: TaskSet::default(),
        }
    }

    pub fn tasks(&self) -> &TaskSet {
        &self.tasks
    }

    pub async fn on_connected(&self, client_id: &str) {
        self.set_connected(client_id, true).await;
    }

    pub async fn on_disconnected(&self, client_id: &str) {
        if self.bridge.is_enabled() && self.bridge.detach(client_id).await {
            info!(target: PROXY, "MQTT Proxy Mode :: Shadow client removed :: Client: {}", client_id);
        }
        self.set_connected(client_id, false).await;
    }

    pub async fn on_subscribed(&self, client_id: &str, filter: &str, qos: QoS) {
        debug!(
            "MQTT Broker :: New MQTT Topic Subscription :: Client: {} :: Topic: {}",
            client_id, filter
        );
        if !self.bridge.is_enabled() {
            return;
        }
        match self.bridge.subscribe(client_id, filter, qos).await {
            Ok(true) => {}
            Ok(false) if client_id != HELPER_BOT_CLIENT_ID => {
                let is_bot = ClientIdentity::parse(client_id, &self.realms)
                    .map(|id| id.is_bot())
                    .unwrap_or(false);
                if is_bot {
                    warn!(
                        target: PROXY,
                        "MQTT Proxy Mode :: No proxy client found! :: Client: {} :: Topic: {}",
                        client_id,
                        filter
                    );
                }
            }
            Ok(false) => {}
            Err(e) => error!(
                target: PROXY,
                "MQTT Proxy Mode :: Subscription mirror failed :: Client: {} :: {}",
                client_id,
                e
            ),
        }
    }

    async fn set_connected(&self, client_id: &str, connected: bool) {
        if client_id == HELPER_BOT_CLIENT_ID {
            return;
        }
        let identity = match ClientIdentity::parse(client_id, &self.realms) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Failed to connect client :: {}", e);
                return;
            }
        };

        let result = match identity.kind {
            ClientKind::Bot => self.repository.set_bot_mqtt(&identity.did, connected).await,
            ClientKind::User => {
                self.repository
                    .set_client_mqtt(&identity.did, connected)
                    .await
            }
        };

        match result {
            Ok(true) => {
                debug!(
                    "{} {} mqtt connection: {}",
                    identity.kind, identity.did, connected
                );
                if connected && identity.is_bot() {
                    self.schedule_timezone_sync(identity.did);
                }
            }
            Ok(false) => debug!("No {} record for {}", identity.kind, identity.did),
            Err(e) => error!("Failed to update connection state of {}: {}", client_id, e),
        }
    }

    fn schedule_timezone_sync(&self, did: String) {
        if !self.sync_timezone {
            return;
        }
        let repository = self.repository.clone();
        let commands = self.commands.clone();
        self.tasks.spawn(async move {
            sync_timezone(repository, commands, &did).await;
        });
    }
}

async fn sync_timezone(repository: Arc<dyn Repository>, commands: Arc<dyn CommandChannel>, did: &str) {
    if !commands.is_available() {
        debug!("Helperbot not running, skipping timezone sync for {}", did);
        return;
    }
    let bot = match repository.get_bot(did).await {
        Ok(Some(bot)) => bot,
        Ok(None) => return,
        Err(e) => {
            error!("Failed to set timezone on bot {}: {}", did, e);
            return;
        }
    };

    let command = timezone_command(&bot, Local::now());
    info!(
        "Syncing timezone for bot {}: tzm={} :: ts={}",
        bot.did, command.payload["header"]["tzm"], command.payload["header"]["ts"]
    );
    if let Err(e) = commands.send_command(command).await {
        error!("Failed to set timezone on bot {}: {}", bot.did, e);
    }
}
