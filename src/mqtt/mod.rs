//! # MQTT Core
//!
//! Everything between a robot or app opening a socket and its messages
//! reaching the vendor cloud.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── broker/       - Embedded MQTT 3.1.1 broker (listeners, connections, router)
//! ├── server.rs     - Broker lifecycle: start, shutdown, state waits
//! ├── plugin.rs     - Broker hooks wired to the components below
//! ├── auth.rs       - Session authenticator (helper bot, password file, auth codes)
//! ├── tracker.rs    - Connection flags and timezone sync
//! ├── proxy.rs      - Shadow connections to the vendor broker
//! ├── helper_bot.rs - Internal command client on the local broker
//! ├── identity.rs   - `did@class/resource` client ids
//! ├── topic.rs      - Vendor topic segments
//! ├── tls.rs        - Server and client rustls configs
//! └── error.rs      - `MqttError`, `TopicError`
//! ```
//!
//! ## Log Targets
//! - `bumper::broker` transport and lifecycle
//! - `bumper::proxy` shadow connections and forwarded traffic
//! - `bumper::messages` message payload traces

pub mod auth;
pub mod broker;
pub mod error;
pub mod helper_bot;
pub mod identity;
pub mod plugin;
pub mod proxy;
pub mod server;
pub mod tls;
pub mod topic;
pub mod tracker;
