//! # Proxy Bridge
//!
//! Mirrors bot traffic to the vendor's real MQTT broker. Every authenticated
//! bot gets one shadow client upstream, created at authentication time and
//! dropped on disconnect.
//!
//! ## Topic Correlation
//!
//! ```text
//! vendor ──q──► translate_upstream_topic ──► local bot
//!               seg[3] := proxyhelper
//!               mapper[seg[10]] = original sender
//!
//! local bot ──p──► on_broker_message_received ──► vendor
//!                  seg[6] := mapper.take(seg[10])
//! ```
//!
//! Correlation is best effort: a response whose request id is no longer in
//! the mapper is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport,
};
use tokio::net::lookup_host;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::MqttError;
use super::plugin::BrokerMessage;
use super::tls;
use super::topic::{ParsedTopic, PROXY_HELPER_MARKER, RECEIVER_SEGMENT, SENDER_SEGMENT};

const PROXY: &str = "bumper::proxy";

/// Delivery into the local broker.
#[async_trait]
pub trait LocalPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), MqttError>;
}

/// A live shadow connection to the vendor broker.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), MqttError>;
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), MqttError>;
    async fn disconnect(&self) -> Result<(), MqttError>;
}

/// Credentials a bot presented at CONNECT, replayed upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamLogin {
    pub client_id: String,
    pub username: String,
    pub password: String,
}

#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(
        &self,
        login: UpstreamLogin,
        mapper: RequestMapper,
        local: Arc<dyn LocalPublisher>,
    ) -> Result<Box<dyn Upstream>, MqttError>;
}

/// Request id → original requester, owned by one proxy client.
///
/// Last write wins: a request id reused while still in flight replaces the
/// earlier entry.
#[derive(Debug, Clone, Default)]
pub struct RequestMapper {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl RequestMapper {
    pub fn insert(&self, request_id: &str, requester: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = entries.insert(request_id.to_string(), requester.to_string()) {
            warn!(
                target: PROXY,
                "Request id {} reused while in flight, replacing requester {} with {}",
                request_id,
                previous,
                requester
            );
        }
    }

    pub fn take(&self, request_id: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rewrites a vendor request so the local bot answers to the proxy helper.
///
/// Non request topics pass through unchanged.
pub fn translate_upstream_topic(topic: &str, mapper: &RequestMapper) -> String {
    let Ok(parsed) = ParsedTopic::parse(topic) else {
        return topic.to_string();
    };
    if !parsed.is_p2p() || parsed.segment(9) != Some("q") {
        return topic.to_string();
    }
    let Ok(request_id) = parsed.correlation_id() else {
        return topic.to_string();
    };

    mapper.insert(request_id, parsed.sender());
    match parsed.with_segment(SENDER_SEGMENT, PROXY_HELPER_MARKER) {
        Ok(rewritten) => rewritten.to_string(),
        Err(_) => topic.to_string(),
    }
}

pub struct ProxyClient {
    upstream: Box<dyn Upstream>,
    mapper: RequestMapper,
}

impl ProxyClient {
    pub fn new(upstream: Box<dyn Upstream>, mapper: RequestMapper) -> Self {
        Self { upstream, mapper }
    }
}

/// Result of offering one broker message to the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    Disabled,
    NoProxyClient,
    InvalidTopic,
    /// Sent by the proxy helper, not echoed back upstream
    Suppressed,
    /// Response whose request id is not in the mapper
    MapperMiss(String),
    Forwarded(String),
    Failed(String),
}

pub struct ProxyBridge {
    enabled: bool,
    connector: Arc<dyn UpstreamConnector>,
    local: Arc<dyn LocalPublisher>,
    clients: RwLock<HashMap<String, Arc<ProxyClient>>>,
}

impl ProxyBridge {
    pub fn new(
        enabled: bool,
        connector: Arc<dyn UpstreamConnector>,
        local: Arc<dyn LocalPublisher>,
    ) -> Self {
        Self {
            enabled,
            connector,
            local,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn has_client(&self, client_id: &str) -> bool {
        self.clients.read().await.contains_key(client_id)
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Opens a fresh shadow client for `login.client_id`, replacing any
    /// previous one.
    pub async fn attach(&self, login: UpstreamLogin) -> Result<(), MqttError> {
        let client_id = login.client_id.clone();
        self.detach(&client_id).await;

        let mapper = RequestMapper::default();
        let upstream = self
            .connector
            .connect(login, mapper.clone(), self.local.clone())
            .await?;

        info!(target: PROXY, "MQTT Proxy Mode :: Shadow client connected :: Client: {}", client_id);
        self.clients
            .write()
            .await
            .insert(client_id, Arc::new(ProxyClient::new(upstream, mapper)));
        Ok(())
    }

    /// Disconnects and forgets the shadow client. Returns whether one existed.
    pub async fn detach(&self, client_id: &str) -> bool {
        let Some(client) = self.clients.write().await.remove(client_id) else {
            return false;
        };
        if let Err(e) = client.upstream.disconnect().await {
            warn!(target: PROXY, "MQTT Proxy Mode :: Disconnect failed :: Client: {} :: {}", client_id, e);
        }
        if !client.mapper.is_empty() {
            debug!(
                target: PROXY,
                "Dropping {} unanswered request(s) for {}",
                client.mapper.len(),
                client_id
            );
        }
        true
    }

    /// Mirrors a local subscription upstream. `Ok(false)` when the client has
    /// no shadow connection.
    pub async fn subscribe(&self, client_id: &str, filter: &str, qos: QoS) -> Result<bool, MqttError> {
        let Some(client) = self.clients.read().await.get(client_id).cloned() else {
            return Ok(false);
        };
        client.upstream.subscribe(filter, qos).await?;
        info!(
            target: PROXY,
            "MQTT Proxy Mode :: New MQTT Topic Subscription :: Client: {} :: Topic: {}",
            client_id,
            filter
        );
        Ok(true)
    }

    pub async fn on_broker_message_received(
        &self,
        message: &BrokerMessage,
        client_id: &str,
    ) -> ForwardOutcome {
        if !self.enabled {
            return ForwardOutcome::Disabled;
        }
        let Some(client) = self.clients.read().await.get(client_id).cloned() else {
            return ForwardOutcome::NoProxyClient;
        };
        let Ok(topic) = ParsedTopic::parse(&message.topic) else {
            return ForwardOutcome::InvalidTopic;
        };

        if topic.sender() == PROXY_HELPER_MARKER {
            return ForwardOutcome::Suppressed;
        }

        let data = String::from_utf8_lossy(&message.payload);
        let target_topic = if topic.receiver() == PROXY_HELPER_MARKER {
            let request_id = match topic.correlation_id() {
                Ok(id) => id.to_string(),
                Err(e) => {
                    warn!(target: PROXY, "Proxy response without request id :: {}", e);
                    return ForwardOutcome::InvalidTopic;
                }
            };
            let Some(requester) = client.mapper.take(&request_id) else {
                warn!(
                    target: PROXY,
                    "Request mapper is missing entry, probably request took to long... Client_id: {} :: Request_id: {}",
                    client_id,
                    request_id
                );
                return ForwardOutcome::MapperMiss(request_id);
            };
            let rewritten = match topic.with_segment(RECEIVER_SEGMENT, &requester) {
                Ok(t) => t.to_string(),
                Err(_) => return ForwardOutcome::InvalidTopic,
            };
            info!(
                target: PROXY,
                "Bot Message Converted Topic From {} TO {} with message: {}",
                message.topic,
                rewritten,
                data
            );
            rewritten
        } else {
            info!(target: PROXY, "Bot Message From {} with message: {}", message.topic, data);
            message.topic.clone()
        };

        match client
            .upstream
            .publish(&target_topic, message.payload.clone(), message.qos)
            .await
        {
            Ok(()) => ForwardOutcome::Forwarded(target_topic),
            Err(e) => {
                error!(target: PROXY, "Forwarding to Ecovacs :: Exception :: {}", e);
                ForwardOutcome::Failed(e.to_string())
            }
        }
    }

    /// Disconnects every shadow client.
    pub async fn shutdown(&self) {
        let clients: Vec<String> = self.clients.read().await.keys().cloned().collect();
        for client_id in clients {
            self.detach(&client_id).await;
        }
    }
}

/// Filters mirrored to one shadow connection.
///
/// rumqttc reconnects with a clean session, so they are subscribed again on
/// every new CONNACK.
#[derive(Debug, Clone, Default)]
struct MirroredFilters {
    filters: Arc<Mutex<HashMap<String, QoS>>>,
}

impl MirroredFilters {
    fn record(&self, filter: &str, qos: QoS) {
        self.filters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(filter.to_string(), qos);
    }

    fn snapshot(&self) -> Vec<(String, QoS)> {
        let mut filters: Vec<(String, QoS)> = self
            .filters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(filter, qos)| (filter.clone(), *qos))
            .collect();
        filters.sort_by(|a, b| a.0.cmp(&b.0));
        filters
    }

    /// Queues a SUBSCRIBE for every recorded filter without waiting on the
    /// event loop. Returns how many were queued.
    fn restore(&self, client: &AsyncClient) -> usize {
        let mut restored = 0;
        for (filter, qos) in self.snapshot() {
            match client.try_subscribe(filter.as_str(), qos) {
                Ok(()) => restored += 1,
                Err(e) => warn!(target: PROXY, "Cannot restore subscription {}: {}", filter, e),
            }
        }
        restored
    }
}

/// Opens shadow connections with rumqttc over TLS.
pub struct RumqttConnector {
    domain: String,
    port: u16,
    keep_alive: Duration,
    connect_timeout: Duration,
}

impl RumqttConnector {
    pub fn new(domain: &str, port: u16) -> Self {
        Self {
            domain: domain.to_string(),
            port,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl UpstreamConnector for RumqttConnector {
    async fn connect(
        &self,
        login: UpstreamLogin,
        mapper: RequestMapper,
        local: Arc<dyn LocalPublisher>,
    ) -> Result<Box<dyn Upstream>, MqttError> {
        let addr = lookup_host((self.domain.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| MqttError::Upstream(format!("cannot resolve {}", self.domain)))?;
        info!(
            target: PROXY,
            "MQTT Proxy Mode :: Using server {} for client {}",
            addr,
            login.client_id
        );

        let mut options = MqttOptions::new(login.client_id.clone(), addr.ip().to_string(), addr.port());
        options
            .set_credentials(login.username, login.password)
            .set_keep_alive(self.keep_alive)
            .set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(Arc::new(
                tls::insecure_client_config(),
            ))));

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let connack = tokio::time::timeout(self.connect_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack.code),
                    Ok(_) => continue,
                    Err(e) => return Err(MqttError::Upstream(e.to_string())),
                }
            }
        })
        .await
        .map_err(|_| MqttError::Timeout(format!("upstream CONNACK for {}", login.client_id)))??;

        if connack != ConnectReturnCode::Success {
            return Err(MqttError::Upstream(format!(
                "upstream refused {}: {:?}",
                login.client_id, connack
            )));
        }

        let cancel = CancellationToken::new();
        let filters = MirroredFilters::default();
        let pump_cancel = cancel.clone();
        let pump_client = client.clone();
        let pump_filters = filters.clone();
        let client_id = login.client_id;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            let restored = pump_filters.restore(&pump_client);
                            info!(
                                target: PROXY,
                                "Upstream for {} reconnected, restored {} subscription(s)",
                                client_id,
                                restored
                            );
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let topic = translate_upstream_topic(&publish.topic, &mapper);
                            debug!(
                                target: PROXY,
                                "Upstream message for {} :: {} -> {}",
                                client_id,
                                publish.topic,
                                topic
                            );
                            if let Err(e) = local.publish(&topic, publish.payload, publish.qos).await {
                                warn!(target: PROXY, "Local delivery of {} failed: {}", topic, e);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(target: PROXY, "Upstream connection for {} failed: {}", client_id, e);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
            debug!(target: PROXY, "Upstream event loop for {} stopped", client_id);
        });

        Ok(Box::new(RumqttUpstream {
            client,
            filters,
            cancel,
        }))
    }
}

struct RumqttUpstream {
    client: AsyncClient,
    filters: MirroredFilters,
    cancel: CancellationToken,
}

#[async_trait]
impl Upstream for RumqttUpstream {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), MqttError> {
        self.client.publish(topic, qos, false, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), MqttError> {
        self.filters.record(filter, qos);
        self.client.subscribe(filter, qos).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        let result = self.client.disconnect().await;
        self.cancel.cancel();
        result.map_err(MqttError::from)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Default)]
    pub(crate) struct RecordingUpstream {
        pub published: Arc<Mutex<Vec<(String, Bytes, QoS)>>>,
        pub subscribed: Arc<Mutex<Vec<String>>>,
        pub disconnects: Arc<Mutex<usize>>,
        pub fail_publish: bool,
    }

    #[async_trait]
    impl Upstream for RecordingUpstream {
        async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), MqttError> {
            if self.fail_publish {
                return Err(MqttError::Upstream("broken pipe".to_string()));
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload, qos));
            Ok(())
        }

        async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<(), MqttError> {
            self.subscribed.lock().unwrap().push(filter.to_string());
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), MqttError> {
            *self.disconnects.lock().unwrap() += 1;
            Ok(())
        }
    }

    /// Connector handing out recording upstreams that share one log.
    #[derive(Default)]
    pub(crate) struct FakeConnector {
        pub published: Arc<Mutex<Vec<(String, Bytes, QoS)>>>,
        pub subscribed: Arc<Mutex<Vec<String>>>,
        pub disconnects: Arc<Mutex<usize>>,
        pub logins: Arc<Mutex<Vec<UpstreamLogin>>>,
        pub mappers: Arc<Mutex<Vec<RequestMapper>>>,
        pub refuse: bool,
        pub fail_publish: bool,
    }

    #[async_trait]
    impl UpstreamConnector for FakeConnector {
        async fn connect(
            &self,
            login: UpstreamLogin,
            mapper: RequestMapper,
            _local: Arc<dyn LocalPublisher>,
        ) -> Result<Box<dyn Upstream>, MqttError> {
            if self.refuse {
                return Err(MqttError::Upstream("connection refused".to_string()));
            }
            self.logins.lock().unwrap().push(login);
            self.mappers.lock().unwrap().push(mapper);
            Ok(Box::new(RecordingUpstream {
                published: self.published.clone(),
                subscribed: self.subscribed.clone(),
                disconnects: self.disconnects.clone(),
                fail_publish: self.fail_publish,
            }))
        }
    }

    #[derive(Default)]
    pub(crate) struct NullPublisher;

    #[async_trait]
    impl LocalPublisher for NullPublisher {
        async fn publish(&self, _topic: &str, _payload: Bytes, _qos: QoS) -> Result<(), MqttError> {
            Ok(())
        }
    }

    fn login(client_id: &str) -> UpstreamLogin {
        UpstreamLogin {
            client_id: client_id.to_string(),
            username: "sn1".to_string(),
            password: "secret".to_string(),
        }
    }

    fn message(topic: &str) -> BrokerMessage {
        BrokerMessage {
            topic: topic.to_string(),
            payload: Bytes::from_static(b"{\"ret\":\"ok\"}"),
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }

    async fn bridge_with(connector: Arc<FakeConnector>) -> ProxyBridge {
        let bridge = ProxyBridge::new(true, connector, Arc::new(NullPublisher));
        bridge.attach(login("did1@ls1ok3/res1")).await.unwrap();
        bridge
    }

    const VENDOR_REQUEST: &str =
        "iot/p2p/getBattery/fuid_user1/ecouser.net/app1/did1/ls1ok3/res1/q/r42/j";
    const BOT_RESPONSE: &str =
        "iot/p2p/getBattery/did1/ls1ok3/res1/proxyhelper/ecouser.net/app1/p/r42/j";

    #[test]
    fn vendor_requests_are_rewritten_and_recorded() {
        let mapper = RequestMapper::default();
        let local = translate_upstream_topic(VENDOR_REQUEST, &mapper);
        assert_eq!(
            local,
            "iot/p2p/getBattery/proxyhelper/ecouser.net/app1/did1/ls1ok3/res1/q/r42/j"
        );
        assert_eq!(mapper.take("r42").as_deref(), Some("fuid_user1"));
    }

    #[test]
    fn non_request_topics_pass_through() {
        let mapper = RequestMapper::default();
        let broadcast = "iot/atr/onBattery/did1/ls1ok3/res1/j";
        assert_eq!(translate_upstream_topic(broadcast, &mapper), broadcast);
        assert_eq!(translate_upstream_topic("short/topic", &mapper), "short/topic");
        assert!(mapper.is_empty());
    }

    #[test]
    fn reused_request_id_is_last_write_wins() {
        let mapper = RequestMapper::default();
        mapper.insert("r1", "first");
        mapper.insert("r1", "second");
        assert_eq!(mapper.take("r1").as_deref(), Some("second"));
        assert_eq!(mapper.take("r1"), None);
    }

    #[tokio::test]
    async fn response_is_rewritten_with_single_use_mapper_entry() {
        let connector = Arc::new(FakeConnector::default());
        let bridge = bridge_with(connector.clone()).await;
        let mapper = connector.mappers.lock().unwrap()[0].clone();
        translate_upstream_topic(VENDOR_REQUEST, &mapper);

        let outcome = bridge
            .on_broker_message_received(&message(BOT_RESPONSE), "did1@ls1ok3/res1")
            .await;
        let expected = "iot/p2p/getBattery/did1/ls1ok3/res1/fuid_user1/ecouser.net/app1/p/r42/j";
        assert_eq!(outcome, ForwardOutcome::Forwarded(expected.to_string()));
        assert!(mapper.is_empty());

        let published = connector.published.lock().unwrap().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, expected);
        assert_eq!(published[0].2, QoS::AtLeastOnce);

        let again = bridge
            .on_broker_message_received(&message(BOT_RESPONSE), "did1@ls1ok3/res1")
            .await;
        assert_eq!(again, ForwardOutcome::MapperMiss("r42".to_string()));
    }

    #[tokio::test]
    async fn proxy_helper_messages_are_not_echoed() {
        let connector = Arc::new(FakeConnector::default());
        let bridge = bridge_with(connector.clone()).await;
        let from_helper = "iot/p2p/getBattery/proxyhelper/ecouser.net/app1/did1/ls1ok3/res1/q/r1/j";
        let outcome = bridge
            .on_broker_message_received(&message(from_helper), "did1@ls1ok3/res1")
            .await;
        assert_eq!(outcome, ForwardOutcome::Suppressed);
        assert!(connector.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn plain_bot_messages_are_forwarded_unchanged() {
        let connector = Arc::new(FakeConnector::default());
        let bridge = bridge_with(connector.clone()).await;
        let broadcast = "iot/atr/onBattery/did1/ls1ok3/res1/j";
        let outcome = bridge
            .on_broker_message_received(&message(broadcast), "did1@ls1ok3/res1")
            .await;
        assert_eq!(outcome, ForwardOutcome::Forwarded(broadcast.to_string()));
    }

    #[tokio::test]
    async fn unknown_clients_and_disabled_bridge_do_nothing() {
        let connector = Arc::new(FakeConnector::default());
        let bridge = bridge_with(connector.clone()).await;
        let outcome = bridge
            .on_broker_message_received(&message(BOT_RESPONSE), "other@ls1ok3/res1")
            .await;
        assert_eq!(outcome, ForwardOutcome::NoProxyClient);

        let disabled = ProxyBridge::new(false, connector, Arc::new(NullPublisher));
        let outcome = disabled
            .on_broker_message_received(&message(BOT_RESPONSE), "did1@ls1ok3/res1")
            .await;
        assert_eq!(outcome, ForwardOutcome::Disabled);
    }

    #[tokio::test]
    async fn upstream_publish_failure_is_contained() {
        let connector = Arc::new(FakeConnector {
            fail_publish: true,
            ..Default::default()
        });
        let bridge = bridge_with(connector).await;
        let outcome = bridge
            .on_broker_message_received(
                &message("iot/atr/onBattery/did1/ls1ok3/res1/j"),
                "did1@ls1ok3/res1",
            )
            .await;
        assert!(matches!(outcome, ForwardOutcome::Failed(_)));
        assert!(bridge.has_client("did1@ls1ok3/res1").await);
    }

    #[tokio::test]
    async fn reattach_replaces_the_shadow_client() {
        let connector = Arc::new(FakeConnector::default());
        let bridge = bridge_with(connector.clone()).await;
        bridge.attach(login("did1@ls1ok3/res1")).await.unwrap();

        assert_eq!(bridge.client_count().await, 1);
        assert_eq!(*connector.disconnects.lock().unwrap(), 1);
        assert_eq!(connector.logins.lock().unwrap().len(), 2);

        assert!(bridge.detach("did1@ls1ok3/res1").await);
        assert!(!bridge.detach("did1@ls1ok3/res1").await);
        assert_eq!(*connector.disconnects.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn mirrored_filters_are_restored_after_reconnect() {
        let filters = MirroredFilters::default();
        filters.record("iot/atr/#", QoS::AtMostOnce);
        filters.record("iot/p2p/+/+/+/+/did1/ls1ok3/res1/q/+/+", QoS::AtMostOnce);
        filters.record("iot/atr/#", QoS::AtLeastOnce);
        assert_eq!(
            filters.snapshot(),
            vec![
                ("iot/atr/#".to_string(), QoS::AtLeastOnce),
                ("iot/p2p/+/+/+/+/did1/ls1ok3/res1/q/+/+".to_string(), QoS::AtMostOnce),
            ]
        );

        // Requests queue on the client even while the event loop is idle.
        let (client, _eventloop) =
            AsyncClient::new(MqttOptions::new("did1@ls1ok3/res1", "127.0.0.1", 8883), 8);
        assert_eq!(filters.restore(&client), 2);
        assert_eq!(MirroredFilters::default().restore(&client), 0);
    }

    #[tokio::test]
    async fn subscriptions_are_mirrored_only_for_known_clients() {
        let connector = Arc::new(FakeConnector::default());
        let bridge = bridge_with(connector.clone()).await;
        assert!(bridge
            .subscribe("did1@ls1ok3/res1", "iot/atr/#", QoS::AtMostOnce)
            .await
            .unwrap());
        assert!(!bridge
            .subscribe("user1@ecouser.net/app", "iot/atr/#", QoS::AtMostOnce)
            .await
            .unwrap());
        assert_eq!(connector.subscribed.lock().unwrap().as_slice(), ["iot/atr/#"]);
    }
}
