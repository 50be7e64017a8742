//! Per-client MQTT 3.1.1 connection driven as a statum state machine
//!
//! ```text
//! AwaitingConnect ──handshake──► Established ──run──► Closed ──finish
//!        │                                               ▲
//!        └────────────── rejected / bad CONNECT ─────────┘ (dropped)
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use mqttbytes::v4::{
    self, ConnAck, ConnectReturnCode, Packet, PingResp, PubAck, PubComp, PubRec, PubRel, Publish,
    SubAck, SubscribeReasonCode, UnsubAck,
};
use statum::{machine, state};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::router::{Outbound, Router};
use crate::mqtt::error::MqttError;
use crate::mqtt::plugin::{BrokerMessage, BrokerPlugin, Session};

const BROKER: &str = "bumper::broker";

pub const MAX_PACKET_SIZE: usize = 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_CAPACITY: usize = 256;

/// Byte stream a connection runs over, plain TCP or TLS.
pub trait BrokerIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BrokerIo for T {}

pub fn to_client_qos(qos: mqttbytes::QoS) -> rumqttc::QoS {
    match qos {
        mqttbytes::QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        mqttbytes::QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        mqttbytes::QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

pub fn to_wire_qos(qos: rumqttc::QoS) -> mqttbytes::QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => mqttbytes::QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => mqttbytes::QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => mqttbytes::QoS::ExactlyOnce,
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum ConnectionState {
    AwaitingConnect, // socket accepted, no CONNECT yet
    Established,     // CONNACK sent, session registered
    Closed,          // socket done, session still to be released
}

#[machine]
pub struct ClientConnection<S: ConnectionState> {
    conn_id: u64,
    peer: SocketAddr,
    io: Box<dyn BrokerIo>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    plugin: Arc<dyn BrokerPlugin>,
    router: Arc<Router>,
    session: Session,
    client_id: String,
    keep_alive: Option<Duration>,
    outbound: Option<mpsc::Receiver<Outbound>>,
    next_pkid: u16,
    incoming_qos2: HashSet<u16>,
}

impl<S: ConnectionState> ClientConnection<S> {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Reads until one full packet is buffered.
    async fn read_packet(&mut self) -> Result<Packet, MqttError> {
        loop {
            match v4::read(&mut self.read_buf, MAX_PACKET_SIZE) {
                Ok(packet) => return Ok(packet),
                Err(mqttbytes::Error::InsufficientBytes(_)) => {}
                Err(e) => return Err(MqttError::Protocol(format!("{:?}", e))),
            }
            if self.io.read_buf(&mut self.read_buf).await? == 0 {
                return Err(MqttError::Protocol("connection closed by peer".to_string()));
            }
        }
    }

    async fn flush(&mut self) -> Result<(), MqttError> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        self.io.write_all(&self.write_buf).await?;
        self.io.flush().await?;
        self.write_buf.clear();
        Ok(())
    }
}

impl ClientConnection<AwaitingConnect> {
    pub fn accept(
        conn_id: u64,
        peer: SocketAddr,
        io: Box<dyn BrokerIo>,
        plugin: Arc<dyn BrokerPlugin>,
        router: Arc<Router>,
    ) -> Self {
        debug!(target: BROKER, "Accepted connection {} from {}", conn_id, peer);
        Self::new(
            conn_id,
            peer,
            io,
            BytesMut::with_capacity(4096),
            BytesMut::with_capacity(4096),
            plugin,
            router,
            Session::default(),
            String::new(),
            None,
            None,
            1,
            HashSet::new(),
        )
    }

    /// Reads CONNECT, authenticates and answers with CONNACK.
    pub async fn handshake(mut self) -> Result<ClientConnection<Established>, MqttError> {
        let packet = tokio::time::timeout(CONNECT_TIMEOUT, self.read_packet())
            .await
            .map_err(|_| MqttError::Timeout(format!("CONNECT from {}", self.peer)))??;
        let Packet::Connect(connect) = packet else {
            return Err(MqttError::Protocol(format!(
                "first packet from {} was not CONNECT",
                self.peer
            )));
        };

        let mut session = Session {
            client_id: (!connect.client_id.is_empty()).then(|| connect.client_id.clone()),
            username: connect.login.as_ref().map(|l| l.username.clone()),
            password: connect
                .login
                .as_ref()
                .map(|l| l.password.clone())
                .filter(|p| !p.is_empty()),
        };

        let outcome = self.plugin.authenticate(&mut session).await;
        if !outcome.is_accepted() {
            ConnAck::new(ConnectReturnCode::NotAuthorized, false)
                .write(&mut self.write_buf)
                .map_err(|e| MqttError::Protocol(format!("{:?}", e)))?;
            self.flush().await?;
            return Err(MqttError::Protocol(format!(
                "authentication rejected for {}",
                session
            )));
        }

        let client_id = session
            .client_id
            .clone()
            .unwrap_or_else(|| format!("anonymous-{}", self.conn_id));
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        self.router
            .register(self.conn_id, &client_id, session.username.clone(), tx)
            .await;

        if let Err(e) = self.send_connack().await {
            // The session and any shadow client opened during authentication
            // belong to this connection until released here.
            if self.router.unregister(self.conn_id, &client_id).await {
                warn!(target: BROKER, "Client {} lost before CONNACK: {}", client_id, e);
                self.plugin.on_client_disconnected(&client_id, &session).await;
            }
            return Err(e);
        }

        info!(target: BROKER, "Client {} connected from {}", client_id, self.peer);
        self.plugin.on_client_connected(&client_id, &session).await;

        self.keep_alive = (connect.keep_alive > 0)
            .then(|| Duration::from_millis(u64::from(connect.keep_alive) * 1500));
        self.session = session;
        self.client_id = client_id;
        self.outbound = Some(rx);
        Ok(self.transition())
    }

    async fn send_connack(&mut self) -> Result<(), MqttError> {
        ConnAck::new(ConnectReturnCode::Success, false)
            .write(&mut self.write_buf)
            .map_err(|e| MqttError::Protocol(format!("{:?}", e)))?;
        self.flush().await
    }
}

impl ClientConnection<Established> {
    /// Serves the session until the client leaves, is taken over or the
    /// broker shuts down.
    pub async fn run(mut self, cancel: CancellationToken) -> ClientConnection<Closed> {
        let Some(mut outbound) = self.outbound.take() else {
            return self.transition();
        };

        let mut deadline = self.keep_alive.map(|k| Instant::now() + k);
        loop {
            match self.drain_packets().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(target: BROKER, "Client {} protocol error: {}", self.client_id, e);
                    break;
                }
            }

            let keep_alive = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(target: BROKER, "Closing {} for broker shutdown", self.client_id);
                    break;
                }
                _ = keep_alive => {
                    info!(target: BROKER, "Client {} keep alive expired", self.client_id);
                    break;
                }
                read = self.io.read_buf(&mut self.read_buf) => match read {
                    Ok(0) => {
                        debug!(target: BROKER, "Client {} closed the connection", self.client_id);
                        break;
                    }
                    Ok(_) => deadline = self.keep_alive.map(|k| Instant::now() + k),
                    Err(e) => {
                        debug!(target: BROKER, "Client {} read failed: {}", self.client_id, e);
                        break;
                    }
                },
                command = outbound.recv() => match command {
                    Some(Outbound::Publish(message)) => {
                        if let Err(e) = self.deliver(message).await {
                            debug!(target: BROKER, "Delivery to {} failed: {}", self.client_id, e);
                            break;
                        }
                    }
                    Some(Outbound::Kick) => {
                        info!(target: BROKER, "Client {} taken over by a new connection", self.client_id);
                        break;
                    }
                    Some(Outbound::Shutdown) | None => break,
                },
            }
        }
        self.transition()
    }

    /// Handles every complete packet in the read buffer. `Ok(false)` after a
    /// DISCONNECT.
    async fn drain_packets(&mut self) -> Result<bool, MqttError> {
        loop {
            let packet = match v4::read(&mut self.read_buf, MAX_PACKET_SIZE) {
                Ok(packet) => packet,
                Err(mqttbytes::Error::InsufficientBytes(_)) => break,
                Err(e) => return Err(MqttError::Protocol(format!("{:?}", e))),
            };
            if !self.handle(packet).await? {
                self.flush().await?;
                return Ok(false);
            }
        }
        self.flush().await?;
        Ok(true)
    }

    async fn handle(&mut self, packet: Packet) -> Result<bool, MqttError> {
        let wire = |e: mqttbytes::Error| MqttError::Protocol(format!("{:?}", e));
        match packet {
            Packet::Publish(publish) => {
                let pkid = publish.pkid;
                let qos = publish.qos;
                let duplicate = qos == mqttbytes::QoS::ExactlyOnce && !self.incoming_qos2.insert(pkid);
                if !duplicate {
                    let message = BrokerMessage {
                        topic: publish.topic,
                        payload: publish.payload,
                        qos: to_client_qos(qos),
                        retain: publish.retain,
                    };
                    self.router.route(&message).await;
                    self.plugin.on_message_received(&self.client_id, &message).await;
                }
                match qos {
                    mqttbytes::QoS::AtMostOnce => {}
                    mqttbytes::QoS::AtLeastOnce => {
                        PubAck::new(pkid).write(&mut self.write_buf).map_err(wire)?;
                    }
                    mqttbytes::QoS::ExactlyOnce => {
                        PubRec::new(pkid).write(&mut self.write_buf).map_err(wire)?;
                    }
                }
            }
            Packet::PubRel(rel) => {
                self.incoming_qos2.remove(&rel.pkid);
                PubComp::new(rel.pkid).write(&mut self.write_buf).map_err(wire)?;
            }
            Packet::PubRec(rec) => {
                PubRel::new(rec.pkid).write(&mut self.write_buf).map_err(wire)?;
            }
            Packet::PubAck(_) | Packet::PubComp(_) => {}
            Packet::Subscribe(subscribe) => {
                let mut codes = Vec::with_capacity(subscribe.filters.len());
                for filter in &subscribe.filters {
                    self.router
                        .subscribe(&self.client_id, &filter.path, to_client_qos(filter.qos))
                        .await;
                    codes.push(SubscribeReasonCode::Success(filter.qos));
                }
                SubAck::new(subscribe.pkid, codes)
                    .write(&mut self.write_buf)
                    .map_err(wire)?;
                self.flush().await?;
                for filter in &subscribe.filters {
                    self.plugin
                        .on_client_subscribed(&self.client_id, &filter.path, to_client_qos(filter.qos))
                        .await;
                }
            }
            Packet::Unsubscribe(unsubscribe) => {
                for topic in &unsubscribe.topics {
                    self.router.unsubscribe(&self.client_id, topic).await;
                }
                UnsubAck::new(unsubscribe.pkid)
                    .write(&mut self.write_buf)
                    .map_err(wire)?;
            }
            Packet::PingReq => {
                PingResp.write(&mut self.write_buf).map_err(wire)?;
            }
            Packet::Disconnect => {
                debug!(target: BROKER, "Client {} sent DISCONNECT", self.client_id);
                return Ok(false);
            }
            Packet::Connect(_) => {
                return Err(MqttError::Protocol("second CONNECT on one connection".to_string()));
            }
            other => debug!(target: BROKER, "Ignoring {:?} from {}", other, self.client_id),
        }
        Ok(true)
    }

    async fn deliver(&mut self, message: BrokerMessage) -> Result<(), MqttError> {
        let mut publish = Publish::new(message.topic, to_wire_qos(message.qos), message.payload.to_vec());
        if publish.qos != mqttbytes::QoS::AtMostOnce {
            publish.pkid = self.next_pkid;
            self.next_pkid = self.next_pkid.checked_add(1).unwrap_or(1);
        }
        publish
            .write(&mut self.write_buf)
            .map_err(|e| MqttError::Protocol(format!("{:?}", e)))?;
        self.flush().await
    }
}

impl ClientConnection<Closed> {
    /// Releases the session and reports the disconnect, unless a newer
    /// connection already owns the client id.
    pub async fn finish(mut self) {
        let _ = self.io.shutdown().await;
        if self.router.unregister(self.conn_id, &self.client_id).await {
            info!(target: BROKER, "Client {} disconnected", self.client_id);
            self.plugin
                .on_client_disconnected(&self.client_id, &self.session)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::auth::{AuthOutcome, Principal, RejectReason};
    use async_trait::async_trait;
    use mqttbytes::v4::{Connect, PingReq, Subscribe};
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    #[derive(Default)]
    struct ScriptedPlugin {
        reject: bool,
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BrokerPlugin for ScriptedPlugin {
        async fn authenticate(&self, _session: &mut Session) -> AuthOutcome {
            if self.reject {
                AuthOutcome::Rejected {
                    reason: RejectReason::MissingClientId,
                }
            } else {
                AuthOutcome::Accepted(Principal::HelperBot)
            }
        }
        async fn on_client_connected(&self, client_id: &str, _session: &Session) {
            self.events.lock().unwrap().push(format!("connected {}", client_id));
        }
        async fn on_client_disconnected(&self, client_id: &str, _session: &Session) {
            self.events.lock().unwrap().push(format!("disconnected {}", client_id));
        }
        async fn on_client_subscribed(&self, client_id: &str, filter: &str, _qos: rumqttc::QoS) {
            self.events
                .lock()
                .unwrap()
                .push(format!("subscribed {} {}", client_id, filter));
        }
        async fn on_message_received(&self, client_id: &str, message: &BrokerMessage) {
            self.events
                .lock()
                .unwrap()
                .push(format!("message {} {}", client_id, message.topic));
        }
        async fn on_broker_shutdown(&self) {}
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    async fn send(client: &mut DuplexStream, write: impl FnOnce(&mut BytesMut)) {
        let mut buf = BytesMut::new();
        write(&mut buf);
        client.write_all(&buf).await.unwrap();
    }

    async fn receive(client: &mut DuplexStream, buf: &mut BytesMut) -> Packet {
        loop {
            match v4::read(buf, MAX_PACKET_SIZE) {
                Ok(packet) => return packet,
                Err(mqttbytes::Error::InsufficientBytes(_)) => {}
                Err(e) => panic!("bad packet: {:?}", e),
            }
            assert!(client.read_buf(buf).await.unwrap() > 0);
        }
    }

    #[test]
    fn qos_conversion_is_symmetric() {
        for qos in [
            rumqttc::QoS::AtMostOnce,
            rumqttc::QoS::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce,
        ] {
            assert_eq!(to_client_qos(to_wire_qos(qos)), qos);
        }
    }

    #[tokio::test]
    async fn rejected_connect_gets_not_authorized() {
        let (mut client, server) = tokio::io::duplex(4096);
        let plugin = Arc::new(ScriptedPlugin {
            reject: true,
            ..Default::default()
        });
        let conn = ClientConnection::accept(1, peer(), Box::new(server), plugin, Arc::new(Router::default()));

        send(&mut client, |b| {
            Connect::new("nodelimiter").write(b).unwrap();
        })
        .await;
        assert!(conn.handshake().await.is_err());

        let mut buf = BytesMut::new();
        match receive(&mut client, &mut buf).await {
            Packet::ConnAck(ack) => assert_eq!(ack.code, ConnectReturnCode::NotAuthorized),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn client_gone_before_connack_releases_session() {
        let (mut client, server) = tokio::io::duplex(4096);
        let plugin = Arc::new(ScriptedPlugin::default());
        let router = Arc::new(Router::default());
        let conn = ClientConnection::accept(3, peer(), Box::new(server), plugin.clone(), router.clone());

        send(&mut client, |b| {
            Connect::new("did1@ls1ok3/res1").write(b).unwrap();
        })
        .await;
        drop(client);

        assert!(conn.handshake().await.is_err());
        assert!(router.sessions().await.is_empty());
        assert_eq!(
            plugin.events.lock().unwrap().clone(),
            vec!["disconnected did1@ls1ok3/res1".to_string()]
        );
    }

    #[tokio::test]
    async fn shadow_client_is_dropped_when_connack_fails() {
        use crate::db::MemoryStore;
        use crate::mqtt::auth::{AuthSettings, Authenticator, CredentialTable};
        use crate::mqtt::helper_bot::HelperBotHandle;
        use crate::mqtt::identity::UserRealms;
        use crate::mqtt::plugin::BumperPlugin;
        use crate::mqtt::proxy::tests::{FakeConnector, NullPublisher};
        use crate::mqtt::proxy::ProxyBridge;
        use crate::mqtt::tracker::ConnectionTracker;

        let store = Arc::new(MemoryStore::in_memory());
        let realms = UserRealms::new(["ecouser.net"]);
        let connector = Arc::new(FakeConnector::default());
        let bridge = Arc::new(ProxyBridge::new(true, connector.clone(), Arc::new(NullPublisher)));
        let authenticator = Authenticator::new(
            AuthSettings {
                allow_anonymous: false,
                use_auth: false,
                realms: realms.clone(),
            },
            CredentialTable::default(),
            store.clone(),
            bridge.clone(),
        );
        let tracker = ConnectionTracker::new(
            store,
            bridge.clone(),
            Arc::new(HelperBotHandle::default()),
            realms,
            false,
        );
        let plugin = Arc::new(BumperPlugin::new(authenticator, tracker, bridge.clone()));
        let router = Arc::new(Router::default());

        let (mut client, server) = tokio::io::duplex(4096);
        let conn = ClientConnection::accept(4, peer(), Box::new(server), plugin, router.clone());
        send(&mut client, |b| {
            let mut connect = Connect::new("did1@ls1ok3/res1");
            connect.set_login("sn1", "token");
            connect.write(b).unwrap();
        })
        .await;
        drop(client);

        assert!(conn.handshake().await.is_err());
        assert_eq!(connector.logins.lock().unwrap().len(), 1);
        assert!(router.sessions().await.is_empty());
        assert!(!bridge.has_client("did1@ls1ok3/res1").await);
        assert_eq!(*connector.disconnects.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn session_runs_until_disconnect() {
        let (mut client, server) = tokio::io::duplex(4096);
        let plugin = Arc::new(ScriptedPlugin::default());
        let router = Arc::new(Router::default());
        let conn = ClientConnection::accept(7, peer(), Box::new(server), plugin.clone(), router.clone());

        send(&mut client, |b| {
            Connect::new("did1@ls1ok3/res1").write(b).unwrap();
        })
        .await;
        let established = conn.handshake().await.unwrap();
        assert_eq!(established.client_id(), "did1@ls1ok3/res1");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(async move { established.run(cancel).await.finish().await });

        let mut buf = BytesMut::new();
        assert!(matches!(receive(&mut client, &mut buf).await, Packet::ConnAck(_)));

        send(&mut client, |b| {
            let mut sub = Subscribe::new("iot/atr/#", mqttbytes::QoS::AtMostOnce);
            sub.pkid = 1;
            sub.write(b).unwrap();
        })
        .await;
        assert!(matches!(receive(&mut client, &mut buf).await, Packet::SubAck(_)));

        send(&mut client, |b| {
            let mut publish = Publish::new(
                "iot/atr/onBattery/did1/ls1ok3/res1/j",
                mqttbytes::QoS::AtLeastOnce,
                b"{}".to_vec(),
            );
            publish.pkid = 5;
            publish.write(b).unwrap();
        })
        .await;

        let mut saw_ack = false;
        let mut saw_echo = false;
        while !(saw_ack && saw_echo) {
            match receive(&mut client, &mut buf).await {
                Packet::PubAck(ack) => {
                    assert_eq!(ack.pkid, 5);
                    saw_ack = true;
                }
                Packet::Publish(p) => {
                    assert_eq!(p.qos, mqttbytes::QoS::AtMostOnce);
                    saw_echo = true;
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        send(&mut client, |b| {
            PingReq.write(b).unwrap();
        })
        .await;
        assert!(matches!(receive(&mut client, &mut buf).await, Packet::PingResp));

        send(&mut client, |b| {
            mqttbytes::v4::Disconnect.write(b).unwrap();
        })
        .await;
        task.await.unwrap();

        let events = plugin.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "connected did1@ls1ok3/res1".to_string(),
                "subscribed did1@ls1ok3/res1 iot/atr/#".to_string(),
                "message did1@ls1ok3/res1 iot/atr/onBattery/did1/ls1ok3/res1/j".to_string(),
                "disconnected did1@ls1ok3/res1".to_string(),
            ]
        );
        assert!(router.sessions().await.is_empty());
    }
}
