//! Embedded MQTT 3.1.1 broker
//!
//! Listeners accept TCP or TLS sockets, each socket becomes a
//! [`connection::ClientConnection`] and publishes fan out through the
//! [`router::Router`]. Session events are reported to a
//! [`BrokerPlugin`](crate::mqtt::plugin::BrokerPlugin).
//!
//! Retained messages and persistent sessions are not kept.

pub mod connection;
pub mod listener;
pub mod router;

pub use listener::Listener;
pub use router::{Router, SessionSnapshot};
