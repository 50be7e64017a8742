//! # Broker Lifecycle Manager
//!
//! Owns start, shutdown and bounded state waits of the embedded broker.
//!
//! ```text
//! stopped ──start──► starting ──► started ──shutdown──► stopping ──► stopped
//! ```
//!
//! The state lives in a `watch` channel, so every transition wakes all
//! waiters. A wait that runs out of time only logs a warning; callers look at
//! the returned state instead of assuming success.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::broker::{Listener, Router, SessionSnapshot};
use super::error::MqttError;
use super::plugin::BrokerPlugin;
use super::tls;
use crate::config::BindingConfig;

const BROKER: &str = "bumper::broker";

pub const DEFAULT_STATE_WAIT: Duration = Duration::from_secs(3);
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            BrokerState::Stopped => "stopped",
            BrokerState::Starting => "starting",
            BrokerState::Started => "started",
            BrokerState::Stopping => "stopping",
        };
        write!(f, "{}", name)
    }
}

/// Certificate and key used by TLS bindings.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// A bound listener address and whether it speaks TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundAddr {
    pub addr: SocketAddr,
    pub use_ssl: bool,
}

struct RunningBroker {
    router: Arc<Router>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    addrs: Vec<BoundAddr>,
}

pub struct MqttServer {
    bindings: Vec<BindingConfig>,
    tls: TlsFiles,
    plugin: Arc<dyn BrokerPlugin>,
    state: watch::Sender<BrokerState>,
    running: Mutex<Option<RunningBroker>>,
}

impl MqttServer {
    pub fn new(bindings: Vec<BindingConfig>, tls: TlsFiles, plugin: Arc<dyn BrokerPlugin>) -> Self {
        let (state, _) = watch::channel(BrokerState::Stopped);
        Self {
            bindings,
            tls,
            plugin,
            state,
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> BrokerState {
        *self.state.borrow()
    }

    fn set_state(&self, state: BrokerState) {
        debug!(target: BROKER, "Broker state :: {}", state);
        self.state.send_replace(state);
    }

    /// Moves `from` → `to` atomically. False when the state was not `from`.
    fn transition(&self, from: BrokerState, to: BrokerState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(target: BROKER, "Broker state :: {} -> {}", from, to);
        }
        changed
    }

    pub async fn start(&self) -> Result<(), MqttError> {
        match self.state() {
            BrokerState::Starting | BrokerState::Started => {
                info!("MQTT Server is already running. Stop it first for a clean restart!");
                return Ok(());
            }
            BrokerState::Stopping => {
                warn!("MQTT Server is stopping. Waiting for it to stop before restarting...");
                let state = self
                    .wait_for_state_change(BrokerState::Stopping, DEFAULT_STATE_WAIT, true)
                    .await;
                if state != BrokerState::Stopped {
                    warn!("MQTT Server did not stop, current state: {}", state);
                    return Ok(());
                }
            }
            BrokerState::Stopped => {}
        }

        if !self.transition(BrokerState::Stopped, BrokerState::Starting) {
            info!("MQTT Server is already running. Stop it first for a clean restart!");
            return Ok(());
        }

        match self.launch().await {
            Ok(running) => {
                *self.running.lock().await = Some(running);
                self.set_state(BrokerState::Started);
                Ok(())
            }
            Err(e) => {
                self.set_state(BrokerState::Stopped);
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<RunningBroker, MqttError> {
        let acceptor = if self.bindings.iter().any(|b| b.use_ssl) {
            Some(tls::load_acceptor(&self.tls.cert, &self.tls.key)?)
        } else {
            None
        };

        let router = Arc::new(Router::default());
        let mut listeners = Vec::with_capacity(self.bindings.len());
        let mut addrs = Vec::with_capacity(self.bindings.len());
        for binding in &self.bindings {
            info!("Starting MQTT Server at {}:{}", binding.host, binding.port);
            let socket = TcpListener::bind((binding.host.as_str(), binding.port)).await?;
            addrs.push(BoundAddr {
                addr: socket.local_addr()?,
                use_ssl: binding.use_ssl,
            });
            let tls = if binding.use_ssl { acceptor.clone() } else { None };
            listeners.push(Listener::new(socket, tls, self.plugin.clone(), router.clone()));
        }

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        for listener in listeners {
            tasks.spawn(listener.serve(cancel.clone(), tasks.clone()));
        }

        Ok(RunningBroker {
            router,
            cancel,
            tasks,
            addrs,
        })
    }

    pub async fn shutdown(&self) -> Result<(), MqttError> {
        let state = self.state();
        match state {
            BrokerState::Started => {
                info!("Shutting down MQTT server...");
                self.teardown().await;
            }
            BrokerState::Starting => {
                warn!("MQTT server is in '{}' state. Waiting for it to stabilize...", state);
                let state = self
                    .wait_for_state_change(BrokerState::Starting, DEFAULT_STATE_WAIT, true)
                    .await;
                if state == BrokerState::Started {
                    self.teardown().await;
                }
            }
            BrokerState::Stopping => {
                warn!("MQTT server is in '{}' state. Waiting for it to stabilize...", state);
                self.wait_for_state_change(BrokerState::Stopping, DEFAULT_STATE_WAIT, true)
                    .await;
            }
            BrokerState::Stopped => {
                warn!(
                    "MQTT server is not in a valid state for shutdown. Current state: {}",
                    state
                );
            }
        }
        Ok(())
    }

    async fn teardown(&self) {
        if !self.transition(BrokerState::Started, BrokerState::Stopping) {
            return;
        }
        if let Some(running) = self.running.lock().await.take() {
            running.router.disconnect_all().await;
            running.cancel.cancel();
            running.tasks.close();
            if tokio::time::timeout(SESSION_DRAIN_TIMEOUT, running.tasks.wait())
                .await
                .is_err()
            {
                warn!(target: BROKER, "Sessions did not close within {:?}", SESSION_DRAIN_TIMEOUT);
            }
        }
        self.plugin.on_broker_shutdown().await;
        info!(target: BROKER, "Broker closed");
        self.set_state(BrokerState::Stopped);
    }

    /// Waits until the state equals `desired` (or differs from it when
    /// `reverse`), at most `max_wait`. Returns the state seen last.
    pub async fn wait_for_state_change(
        &self,
        desired: BrokerState,
        max_wait: Duration,
        reverse: bool,
    ) -> BrokerState {
        let mut rx = self.state.subscribe();
        let reached = |state: &BrokerState| (*state == desired) != reverse;

        let state = match tokio::time::timeout(max_wait, rx.wait_for(reached)).await {
            Ok(Ok(state)) => {
                let state = *state;
                debug!(
                    "Reached state :: '{}' {} '{}'",
                    state,
                    if reverse { "!=" } else { "==" },
                    desired
                );
                state
            }
            Ok(Err(_)) => self.state(),
            Err(_) => {
                let current = self.state();
                warn!(
                    "Timeout waiting for MQTT server to reach state '{}' :: Current state: '{}'",
                    desired, current
                );
                current
            }
        };
        state
    }

    /// Sessions connected right now; empty while stopped.
    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        match self.running.lock().await.as_ref() {
            Some(running) => running.router.sessions().await,
            None => Vec::new(),
        }
    }

    pub async fn bound_addrs(&self) -> Vec<BoundAddr> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.addrs.clone())
            .unwrap_or_default()
    }
}
