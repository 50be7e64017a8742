//! Accept loop for one TCP or TLS binding

use std::net::SocketAddr;
use std::sync::Arc;

use rumqttc::tokio_rustls::TlsAcceptor;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use super::connection::{BrokerIo, ClientConnection};
use super::router::Router;
use crate::mqtt::plugin::BrokerPlugin;

const BROKER: &str = "bumper::broker";

pub struct Listener {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    plugin: Arc<dyn BrokerPlugin>,
    router: Arc<Router>,
}

impl Listener {
    pub fn new(
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        plugin: Arc<dyn BrokerPlugin>,
        router: Arc<Router>,
    ) -> Self {
        Self {
            listener,
            tls,
            plugin,
            router,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `cancel` fires. Each connection runs on
    /// `tracker` so shutdown can wait for every session to be released.
    pub async fn serve(self, cancel: CancellationToken, tracker: TaskTracker) {
        let addr = self
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        info!(
            target: BROKER,
            "Listening on {} ({})",
            addr,
            if self.tls.is_some() { "tls" } else { "tcp" }
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn_id = self.router.next_connection_id();
                        tracker.spawn(handle_connection(
                            conn_id,
                            stream,
                            peer,
                            self.tls.clone(),
                            self.plugin.clone(),
                            self.router.clone(),
                            cancel.clone(),
                        ));
                    }
                    Err(e) => error!(target: BROKER, "Accept on {} failed: {}", addr, e),
                },
            }
        }
        debug!(target: BROKER, "Listener {} stopped", addr);
    }
}

async fn handle_connection(
    conn_id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    plugin: Arc<dyn BrokerPlugin>,
    router: Arc<Router>,
    cancel: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let io: Box<dyn BrokerIo> = match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => Box::new(tls_stream),
            Err(e) => {
                debug!(target: BROKER, "TLS handshake with {} failed: {}", peer, e);
                return;
            }
        },
        None => Box::new(stream),
    };

    let connection = ClientConnection::accept(conn_id, peer, io, plugin, router);
    let established = tokio::select! {
        _ = cancel.cancelled() => return,
        result = connection.handshake() => match result {
            Ok(established) => established,
            Err(e) => {
                info!(target: BROKER, "Connection from {} refused: {}", peer, e);
                return;
            }
        },
    };

    established.run(cancel).await.finish().await;
}
