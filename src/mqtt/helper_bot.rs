//! Internal MQTT client used to issue commands to bots
//!
//! The helper bot connects to the local broker as `helperbot@bumper/helper`,
//! publishes p2p requests and waits for the bot's answer on the matching
//! response topic. It also delivers messages relayed from the vendor cloud.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::MqttError;
use super::identity::HELPER_BOT_CLIENT_ID;
use super::proxy::LocalPublisher;
use super::tls;
use super::topic::{ParsedTopic, HELPER_BOT_MARKER};

const MESSAGES: &str = "bumper::messages";

/// Subscription that catches every answer addressed to the helper bot.
pub const RESPONSE_FILTER: &str = "iot/p2p/+/+/+/+/helperbot/bumper/helper/+/+/+";

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

const REQUEST_ID_LEN: usize = 12;

/// A command addressed to one bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttCommand {
    pub cmd_name: String,
    pub to_id: String,
    pub to_type: String,
    pub to_res: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "default_payload_type")]
    pub payload_type: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_payload_type() -> String {
    "j".to_string()
}

fn default_version() -> String {
    "1".to_string()
}

impl MqttCommand {
    pub fn request_topic(&self, request_id: &str) -> String {
        format!(
            "iot/p2p/{}/helperbot/bumper/helper/{}/{}/{}/q/{}/{}",
            self.cmd_name, self.to_id, self.to_type, self.to_res, request_id, self.payload_type
        )
    }

    fn payload_bytes(&self) -> Bytes {
        match &self.payload {
            Value::String(s) => Bytes::from(s.clone()),
            other => Bytes::from(other.to_string()),
        }
    }
}

/// Outbound command dispatch to bots.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// False while no helper bot is connected.
    fn is_available(&self) -> bool;

    async fn send_command(&self, command: MqttCommand) -> Result<Value, MqttError>;
}

pub fn success_response(request_id: &str, payload: &[u8], payload_type: &str) -> Value {
    let text = String::from_utf8_lossy(payload);
    let resp = serde_json::from_str::<Value>(&text).unwrap_or_else(|_| Value::String(text.to_string()));
    json!({
        "id": request_id,
        "ret": "ok",
        "resp": resp,
        "payloadType": payload_type,
    })
}

pub fn timeout_response(request_id: &str) -> Value {
    json!({
        "id": request_id,
        "ret": "fail",
        "errno": 500,
        "debug": "wait for response timed out",
    })
}

/// Requests waiting for their response, keyed by request id.
#[derive(Debug, Clone, Default)]
pub struct PendingRequests {
    waiting: Arc<Mutex<HashMap<String, oneshot::Sender<Bytes>>>>,
}

impl PendingRequests {
    pub fn register(&self, request_id: &str) -> oneshot::Receiver<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id.to_string(), tx);
        rx
    }

    pub fn forget(&self, request_id: &str) {
        self.waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id);
    }

    /// Hands a response to its waiter. Returns whether anyone was waiting.
    pub fn resolve(&self, topic: &str, payload: Bytes) -> bool {
        let Ok(parsed) = ParsedTopic::parse(topic) else {
            return false;
        };
        if parsed.receiver() != HELPER_BOT_MARKER {
            return false;
        }
        let Ok(request_id) = parsed.correlation_id() else {
            return false;
        };
        let waiter = self
            .waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id);
        match waiter {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.waiting.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Short random request id; bots echo it back in the response topic.
fn next_request_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(REQUEST_ID_LEN);
    id
}

pub struct HelperBot {
    client: AsyncClient,
    pending: PendingRequests,
    cancel: CancellationToken,
    timeout: Duration,
}

impl HelperBot {
    /// Connects to the local broker and starts the response pump.
    pub async fn connect(
        host: &str,
        port: u16,
        use_tls: bool,
        timeout: Duration,
    ) -> Result<Self, MqttError> {
        let mut options = MqttOptions::new(HELPER_BOT_CLIENT_ID, host, port);
        options.set_keep_alive(Duration::from_secs(60));
        if use_tls {
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(Arc::new(
                tls::insecure_client_config(),
            ))));
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let code = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack.code),
                    Ok(_) => continue,
                    Err(e) => return Err(MqttError::Upstream(e.to_string())),
                }
            }
        })
        .await
        .map_err(|_| MqttError::Timeout("helper bot CONNACK".to_string()))??;
        if code != ConnectReturnCode::Success {
            return Err(MqttError::Protocol(format!("helper bot refused: {:?}", code)));
        }

        client.subscribe(RESPONSE_FILTER, QoS::AtMostOnce).await?;

        let pending = PendingRequests::default();
        let cancel = CancellationToken::new();
        let pump_pending = pending.clone();
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            debug!(
                                target: MESSAGES,
                                "Received Response :: Topic: {} :: Message: {}",
                                publish.topic,
                                String::from_utf8_lossy(&publish.payload)
                            );
                            if !pump_pending.resolve(&publish.topic, publish.payload) {
                                debug!(target: MESSAGES, "No waiting request for {}", publish.topic);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Helperbot connection error: {}", e);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
            debug!("Helperbot event loop stopped");
        });

        info!("Helperbot connected to {}:{}", host, port);
        Ok(Self {
            client,
            pending,
            cancel,
            timeout,
        })
    }

    pub async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), MqttError> {
        self.client.publish(topic, qos, false, payload).await?;
        Ok(())
    }

    pub async fn send_command(&self, command: MqttCommand) -> Result<Value, MqttError> {
        let request_id = command.request_id.clone().unwrap_or_else(next_request_id);
        let topic = command.request_topic(&request_id);
        let rx = self.pending.register(&request_id);

        debug!(
            target: MESSAGES,
            "Send Command :: Topic: {} :: Message: {}",
            topic,
            command.payload
        );
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtMostOnce, false, command.payload_bytes())
            .await
        {
            self.pending.forget(&request_id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(payload)) => Ok(success_response(&request_id, &payload, &command.payload_type)),
            Ok(Err(_)) => Err(MqttError::Channel(format!(
                "response channel for {} closed",
                request_id
            ))),
            Err(_) => {
                self.pending.forget(&request_id);
                warn!("Timeout waiting for response to {} ({})", command.cmd_name, request_id);
                Ok(timeout_response(&request_id))
            }
        }
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("Helperbot disconnect: {}", e);
        }
        self.cancel.cancel();
        info!("Helperbot disconnected");
    }
}

/// Replaceable slot for the running helper bot.
#[derive(Default)]
pub struct HelperBotHandle {
    current: RwLock<Option<Arc<HelperBot>>>,
}

impl HelperBotHandle {
    pub fn set(&self, bot: Option<Arc<HelperBot>>) -> Option<Arc<HelperBot>> {
        let mut slot = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *slot, bot)
    }

    pub fn current(&self) -> Option<Arc<HelperBot>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl CommandChannel for HelperBotHandle {
    fn is_available(&self) -> bool {
        self.current().is_some()
    }

    async fn send_command(&self, command: MqttCommand) -> Result<Value, MqttError> {
        let bot = self
            .current()
            .ok_or_else(|| MqttError::Channel("helper bot is not running".to_string()))?;
        bot.send_command(command).await
    }
}

#[async_trait]
impl LocalPublisher for HelperBotHandle {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), MqttError> {
        let bot = self
            .current()
            .ok_or_else(|| MqttError::Channel("helper bot is not running".to_string()))?;
        bot.publish(topic, payload, qos).await
    }
}
