//! Application context
//!
//! Wires settings, repository, broker, helper bot and proxy bridge together
//! and owns the service restart operations used by the HTTP façade.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Settings;
use crate::db::{MemoryStore, Repository};
use crate::mqtt::auth::{AuthSettings, Authenticator, CredentialTable};
use crate::mqtt::error::MqttError;
use crate::mqtt::helper_bot::{HelperBot, HelperBotHandle};
use crate::mqtt::identity::UserRealms;
use crate::mqtt::plugin::BumperPlugin;
use crate::mqtt::proxy::{ProxyBridge, RumqttConnector, UpstreamConnector};
use crate::mqtt::server::{BrokerState, MqttServer, TlsFiles, DEFAULT_STATE_WAIT};
use crate::mqtt::tracker::ConnectionTracker;

pub struct AppContext {
    pub settings: Settings,
    pub repository: Arc<dyn Repository>,
    pub helper_bot: Arc<HelperBotHandle>,
    pub bridge: Arc<ProxyBridge>,
    pub mqtt_server: Arc<MqttServer>,
}

impl AppContext {
    /// Opens the store snapshot in the data directory and builds every
    /// component with the rumqttc upstream connector.
    pub async fn build(settings: Settings) -> Result<Self, MqttError> {
        let store = MemoryStore::open(settings.store_file()).await?;
        let connector = Arc::new(RumqttConnector::new(
            &settings.proxy.domain,
            settings.proxy.port,
        ));
        Ok(Self::with_parts(settings, Arc::new(store), connector))
    }

    pub fn with_parts(
        settings: Settings,
        repository: Arc<dyn Repository>,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Self {
        let realms = UserRealms::new(settings.mqtt.user_realms.iter().cloned());
        let helper_bot = Arc::new(HelperBotHandle::default());
        let bridge = Arc::new(ProxyBridge::new(
            settings.proxy.enabled,
            connector,
            helper_bot.clone(),
        ));

        let password_file = settings.password_file();
        let authenticator = Authenticator::new(
            AuthSettings {
                allow_anonymous: settings.mqtt.allow_anonymous,
                use_auth: settings.mqtt.use_auth,
                realms: realms.clone(),
            },
            CredentialTable::load(Some(password_file.as_path())),
            repository.clone(),
            bridge.clone(),
        );
        let tracker = ConnectionTracker::new(
            repository.clone(),
            bridge.clone(),
            helper_bot.clone(),
            realms,
            settings.mqtt.sync_timezone,
        );
        let plugin = Arc::new(BumperPlugin::new(authenticator, tracker, bridge.clone()));
        let mqtt_server = Arc::new(MqttServer::new(
            settings.mqtt.bindings.clone(),
            TlsFiles {
                cert: settings.cert_file(),
                key: settings.key_file(),
            },
            plugin,
        ));

        Self {
            settings,
            repository,
            helper_bot,
            bridge,
            mqtt_server,
        }
    }

    /// First bound broker address, with wildcard hosts mapped to loopback.
    async fn helper_endpoint(&self) -> Option<(SocketAddr, bool)> {
        let bound = self.mqtt_server.bound_addrs().await;
        let first = bound.first()?;
        let mut addr = first.addr;
        if addr.ip().is_unspecified() {
            let loopback = match addr {
                SocketAddr::V4(_) => std::net::Ipv4Addr::LOCALHOST.into(),
                SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
            };
            addr.set_ip(loopback);
        }
        Some((addr, first.use_ssl))
    }

    pub async fn start_helper_bot(&self) -> Result<(), MqttError> {
        let Some((addr, use_tls)) = self.helper_endpoint().await else {
            return Err(MqttError::Channel(
                "MQTT server is not running, cannot start helper bot".to_string(),
            ));
        };
        let bot = HelperBot::connect(
            &addr.ip().to_string(),
            addr.port(),
            use_tls,
            self.settings.command_timeout(),
        )
        .await?;
        if let Some(old) = self.helper_bot.set(Some(Arc::new(bot))) {
            old.disconnect().await;
        }
        Ok(())
    }

    pub async fn restart_helper_bot(&self) -> Result<(), MqttError> {
        info!("Restarting Helperbot");
        if let Some(old) = self.helper_bot.set(None) {
            old.disconnect().await;
        }
        self.start_helper_bot().await
    }

    pub async fn restart_mqtt_server(&self) -> Result<(), MqttError> {
        info!("Restarting MQTT Server");
        self.mqtt_server.shutdown().await?;
        let state = self
            .mqtt_server
            .wait_for_state_change(BrokerState::Stopped, DEFAULT_STATE_WAIT, false)
            .await;
        if state != BrokerState::Stopped {
            warn!("MQTT Server did not stop before restart, current state: {}", state);
        }
        self.mqtt_server.start().await?;
        self.mqtt_server
            .wait_for_state_change(BrokerState::Started, DEFAULT_STATE_WAIT, false)
            .await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        if let Some(bot) = self.helper_bot.set(None) {
            bot.disconnect().await;
        }
        if let Err(e) = self.mqtt_server.shutdown().await {
            warn!("MQTT Server shutdown failed: {}", e);
        }
    }
}
