use super::{BotRecord, ClientRecord, Repository, RepositoryError, TokenRecord};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const FUID_PREFIX: &str = "fuid_";

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
struct Tables {
    #[serde(default)]
    bots: BTreeMap<String, BotRecord>,
    #[serde(default)]
    clients: BTreeMap<String, ClientRecord>,
    #[serde(default)]
    tokens: Vec<TokenRecord>,
}

/// Document store kept in memory and optionally mirrored to a TOML file.
///
/// Every mutation rewrites the snapshot while the write lock is held, so the
/// file never lags behind a completed call.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the snapshot at `path`, starting empty if it does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let path = path.as_ref().to_path_buf();

        let tables = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            let tables: Tables = toml::from_str(&content)?;
            info!(
                "Loaded store {} ({} bots, {} clients, {} tokens)",
                path.display(),
                tables.bots.len(),
                tables.clients.len(),
                tables.tokens.len()
            );
            tables
        } else {
            warn!("Store file {} does not exist, starting empty", path.display());
            Tables::default()
        };

        Ok(Self {
            tables: RwLock::new(tables),
            path: Some(path),
        })
    }

    async fn flush(&self, tables: &Tables) -> Result<(), RepositoryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = toml::to_string_pretty(tables)?;
        tokio::fs::write(path, content).await?;
        debug!("Store flushed to {}", path.display());
        Ok(())
    }
}

fn matches_userid(stored: &str, did: &str) -> bool {
    let bare = did.strip_prefix(FUID_PREFIX).unwrap_or(did);
    stored == bare || stored == format!("{FUID_PREFIX}{did}")
}

#[async_trait]
impl Repository for MemoryStore {
    async fn get_bot(&self, did: &str) -> Result<Option<BotRecord>, RepositoryError> {
        Ok(self.tables.read().await.bots.get(did).cloned())
    }

    async fn upsert_bot(&self, bot: BotRecord) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        match tables.bots.get_mut(&bot.did) {
            Some(existing) => {
                existing.name = bot.name;
                existing.class_id = bot.class_id;
                existing.resource = bot.resource;
                existing.company = bot.company;
            }
            None => {
                info!("Adding new bot with SN: {} DID: {}", bot.name, bot.did);
                tables.bots.insert(bot.did.clone(), bot);
            }
        }
        self.flush(&tables).await
    }

    async fn set_bot_mqtt(&self, did: &str, connected: bool) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        let Some(bot) = tables.bots.get_mut(did) else {
            return Ok(false);
        };
        bot.mqtt_connection = connected;
        self.flush(&tables).await?;
        Ok(true)
    }

    async fn remove_bot(&self, did: &str) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        let removed = tables.bots.remove(did).is_some();
        if removed {
            self.flush(&tables).await?;
        }
        Ok(removed)
    }

    async fn list_bots(&self) -> Result<Vec<BotRecord>, RepositoryError> {
        Ok(self.tables.read().await.bots.values().cloned().collect())
    }

    async fn get_client(&self, userid: &str) -> Result<Option<ClientRecord>, RepositoryError> {
        Ok(self.tables.read().await.clients.get(userid).cloned())
    }

    async fn upsert_client(&self, client: ClientRecord) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        match tables.clients.get_mut(&client.userid) {
            Some(existing) => {
                existing.name = client.name;
                existing.realm = client.realm;
                existing.resource = client.resource;
            }
            None => {
                info!("Adding new client with UID: {}", client.userid);
                tables.clients.insert(client.userid.clone(), client);
            }
        }
        self.flush(&tables).await
    }

    async fn set_client_mqtt(
        &self,
        userid: &str,
        connected: bool,
    ) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        let Some(client) = tables.clients.get_mut(userid) else {
            return Ok(false);
        };
        client.mqtt_connection = connected;
        self.flush(&tables).await?;
        Ok(true)
    }

    async fn remove_client(&self, userid: &str) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        let removed = tables.clients.remove(userid).is_some();
        if removed {
            self.flush(&tables).await?;
        }
        Ok(removed)
    }

    async fn list_clients(&self) -> Result<Vec<ClientRecord>, RepositoryError> {
        Ok(self.tables.read().await.clients.values().cloned().collect())
    }

    async fn add_token(&self, token: TokenRecord) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        tables.tokens.retain(|t| !t.is_expired_at(now));
        tables
            .tokens
            .retain(|t| !(t.userid == token.userid && t.token == token.token));
        tables.tokens.push(token);
        self.flush(&tables).await
    }

    async fn verify_auth_code(&self, did: &str, code: &str) -> Result<bool, RepositoryError> {
        debug!("Checking for authcode: {}", code);
        let now = Utc::now();
        let tables = self.tables.read().await;
        Ok(tables.tokens.iter().any(|t| {
            t.authcode.as_deref() == Some(code)
                && matches_userid(&t.userid, did)
                && !t.is_expired_at(now)
        }))
    }
}
