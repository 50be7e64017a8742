//! # Persistence Module
//!
//! Document records for bots, app clients and auth tokens, plus the
//! [`Repository`] seam the MQTT core talks to.
//!
//! ## Key Abstractions
//! - **Keyed upserts**: every write is keyed by identity (`did` for bots,
//!   `userid` for clients), so reconnects update a record instead of
//!   duplicating it
//! - **Point lookups only**: no operation spans more than one entity
//! - **Type-safe serialization**: records are serde structs persisted as TOML
//!   by [`memory_store::MemoryStore`]
//!
//! ## Error Handling Strategy
//! Storage failures surface as [`RepositoryError`]. Callers in the MQTT core
//! log them and keep the broker running.

pub mod memory_store;

pub use memory_store::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Company tag stored on bots that authenticate over MQTT.
pub const BOT_COMPANY: &str = "eco-ng";

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Failed to access store file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize store: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to parse store file: {0}")]
    Deserialize(#[from] toml::de::Error),
}

/// A robot known to the backend.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BotRecord {
    /// Device identifier
    pub did: String,
    /// Serial number / MQTT username the bot authenticated with
    pub name: String,
    /// User assigned nickname, never touched by MQTT upserts
    pub nick: Option<String>,
    /// Device class id from the client id
    pub class_id: String,
    /// Resource label of the last connection
    pub resource: String,
    pub company: String,
    pub mqtt_connection: bool,
    pub xmpp_connection: bool,
}

impl BotRecord {
    pub fn new(name: &str, did: &str, class_id: &str, resource: &str, company: &str) -> Self {
        Self {
            did: did.to_string(),
            name: name.to_string(),
            nick: None,
            class_id: class_id.to_string(),
            resource: resource.to_string(),
            company: company.to_string(),
            mqtt_connection: false,
            xmpp_connection: false,
        }
    }
}

/// An app client (user session) known to the backend.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientRecord {
    pub userid: String,
    pub name: String,
    pub realm: String,
    pub resource: String,
    pub mqtt_connection: bool,
    pub xmpp_connection: bool,
}

impl ClientRecord {
    pub fn new(name: &str, userid: &str, realm: &str, resource: &str) -> Self {
        Self {
            userid: userid.to_string(),
            name: name.to_string(),
            realm: realm.to_string(),
            resource: resource.to_string(),
            mqtt_connection: false,
            xmpp_connection: false,
        }
    }
}

/// Login token with its short lived authorization code.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct TokenRecord {
    pub userid: String,
    pub token: String,
    pub authcode: Option<String>,
    pub expiration: DateTime<Utc>,
}

impl TokenRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiration
    }
}

/// Persistence operations consumed by the MQTT core and the HTTP façade.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_bot(&self, did: &str) -> Result<Option<BotRecord>, RepositoryError>;

    /// Inserts the bot or updates name, class, resource and company of an
    /// existing record. Connection flags and nick are preserved.
    async fn upsert_bot(&self, bot: BotRecord) -> Result<(), RepositoryError>;

    /// Returns `false` when no bot with this `did` exists.
    async fn set_bot_mqtt(&self, did: &str, connected: bool) -> Result<bool, RepositoryError>;

    async fn remove_bot(&self, did: &str) -> Result<bool, RepositoryError>;

    async fn list_bots(&self) -> Result<Vec<BotRecord>, RepositoryError>;

    async fn get_client(&self, userid: &str) -> Result<Option<ClientRecord>, RepositoryError>;

    /// Inserts the client or updates name, realm and resource. Connection
    /// flags are preserved.
    async fn upsert_client(&self, client: ClientRecord) -> Result<(), RepositoryError>;

    async fn set_client_mqtt(&self, userid: &str, connected: bool)
        -> Result<bool, RepositoryError>;

    async fn remove_client(&self, userid: &str) -> Result<bool, RepositoryError>;

    async fn list_clients(&self) -> Result<Vec<ClientRecord>, RepositoryError>;

    async fn add_token(&self, token: TokenRecord) -> Result<(), RepositoryError>;

    /// True when `code` is a non-expired authorization code issued to `did`
    /// (with or without the `fuid_` prefix).
    async fn verify_auth_code(&self, did: &str, code: &str) -> Result<bool, RepositoryError>;
}
