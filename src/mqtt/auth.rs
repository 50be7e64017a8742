//! # Session Authenticator
//!
//! Decides accept/reject for every MQTT CONNECT and classifies accepted
//! clients for the connection tracker.
//!
//! ## Decision Chain
//!
//! ```text
//! CONNECT ─► helper bot? ──yes──► Accepted(HelperBot)
//!              │
//!              ▼
//!          no '@' in client id + credentials ──► password file ──► Accepted(FileUser)
//!              │
//!              ▼
//!          did@class/resource ─► [auth code] ─► upsert bot / client ─► Accepted
//! ```
//!
//! Every branch returns a [`RejectReason`] instead of short-circuiting, and
//! the anonymous fallback is applied once at the top. Internal repository
//! failures are never turned into an anonymous accept.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, error, info, warn};

use super::identity::{ClientIdentity, UserRealms, HELPER_BOT_CLIENT_ID};
use super::plugin::Session;
use super::proxy::{ProxyBridge, UpstreamLogin};
use crate::db::{BotRecord, ClientRecord, Repository, BOT_COMPANY};

const DEFAULT_DENIED: &str =
    "File Authentication Failed :: Default access not grant - last try anonymous auth if allowed!";

/// Result of comparing a password against the credential table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialCheck {
    NoEntry,
    Mismatch,
    Match,
}

/// Username → password hash table read from a `username:hash` file.
#[derive(Debug, Clone, Default)]
pub struct CredentialTable {
    users: HashMap<String, String>,
}

impl CredentialTable {
    /// Reads the password file. A missing or unreadable file yields an empty
    /// table; a malformed line stops reading but keeps what was loaded.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            warn!("Configuration parameter 'password-file' not found");
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(content) => {
                debug!("Reading user database from {}", path.display());
                let table = Self::parse(&content);
                debug!("{} user(s) loaded from {}", table.len(), path.display());
                table
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Password file {} not found", path.display());
                Self::default()
            }
            Err(e) => {
                error!("Unexpected error reading password file '{}': {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Self {
        let mut users = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.splitn(4, ':').collect();
            let [username, hash] = parts.as_slice() else {
                error!("Malformed password file line: '{}'", line);
                break;
            };
            if !username.is_empty() {
                users.insert(username.to_string(), hash.to_string());
                debug!("User '{}' loaded", username);
            }
        }
        Self { users }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Verifies on the blocking pool; crypt hashes are deliberately slow.
    pub async fn verify(&self, username: &str, password: &str) -> CredentialCheck {
        let Some(hash) = self.users.get(username).cloned() else {
            return CredentialCheck::NoEntry;
        };
        let password = password.to_string();
        match tokio::task::spawn_blocking(move || pwhash::unix::verify(password, &hash)).await {
            Ok(true) => CredentialCheck::Match,
            Ok(false) => CredentialCheck::Mismatch,
            Err(e) => {
                error!("Password verification task failed: {}", e);
                CredentialCheck::Mismatch
            }
        }
    }
}

/// Who an accepted session belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    HelperBot,
    FileUser(String),
    Bot(ClientIdentity),
    User(ClientIdentity),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    MissingClientId,
    MalformedClientId(String),
    UnknownUser(String),
    WrongPassword(String),
    MissingPassword,
    InvalidAuthCode,
    /// Repository or runtime failure, not a decision about the client
    Internal(String),
}

impl RejectReason {
    pub fn is_authorization_failure(&self) -> bool {
        !matches!(self, RejectReason::Internal(_))
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RejectReason::MissingClientId => write!(f, "no client_id provided"),
            RejectReason::MalformedClientId(id) => write!(f, "wrong formatted client_id '{}'", id),
            RejectReason::UnknownUser(user) => write!(f, "no entry for user '{}'", user),
            RejectReason::WrongPassword(user) => write!(f, "wrong password for user '{}'", user),
            RejectReason::MissingPassword => write!(f, "no password provided"),
            RejectReason::InvalidAuthCode => write!(f, "invalid or expired auth code"),
            RejectReason::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted(Principal),
    Rejected { reason: RejectReason },
    AnonymousFallback { reason: RejectReason },
}

impl AuthOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, AuthOutcome::Rejected { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
    pub allow_anonymous: bool,
    pub use_auth: bool,
    pub realms: UserRealms,
}

pub struct Authenticator {
    settings: AuthSettings,
    credentials: CredentialTable,
    repository: Arc<dyn Repository>,
    bridge: Arc<ProxyBridge>,
}

impl Authenticator {
    pub fn new(
        settings: AuthSettings,
        credentials: CredentialTable,
        repository: Arc<dyn Repository>,
        bridge: Arc<ProxyBridge>,
    ) -> Self {
        Self {
            settings,
            credentials,
            repository,
            bridge,
        }
    }

    /// Authenticates `session`, normalizing its username in place.
    pub async fn authenticate(&self, session: &mut Session) -> AuthOutcome {
        let reason = match self.check(session).await {
            Ok(principal) => return AuthOutcome::Accepted(principal),
            Err(reason) => reason,
        };

        if reason.is_authorization_failure() && self.settings.allow_anonymous {
            info!(
                "Anonymous Authentication Success :: config allows anonymous :: Username: {} :: Reason: {}",
                session.username.as_deref().unwrap_or_default(),
                reason
            );
            return AuthOutcome::AnonymousFallback { reason };
        }

        info!(
            "Bumper Authentication Failed :: {} :: Session: {}",
            reason, session
        );
        AuthOutcome::Rejected { reason }
    }

    async fn check(&self, session: &mut Session) -> Result<Principal, RejectReason> {
        let Some(client_id) = session.client_id.clone() else {
            warn!("Bumper Authentication Failed :: No client_id provided");
            return Err(RejectReason::MissingClientId);
        };

        if client_id == HELPER_BOT_CLIENT_ID {
            info!("Bumper Authentication Success :: Helperbot :: ClientID: {}", client_id);
            return Ok(Principal::HelperBot);
        }

        if let Some(username) = session.username.as_mut() {
            if let Some((prefix, _)) = username.split_once('@') {
                *username = prefix.to_string();
            }
        }

        if !client_id.contains('@') {
            if let (Some(username), Some(password)) = (&session.username, &session.password) {
                return self.check_file_auth(&client_id, username, password).await;
            }
        }

        let identity = ClientIdentity::parse(&client_id, &self.settings.realms).map_err(|_| {
            warn!("Failed to connect client :: Wrong formatted client_id '{}'", client_id);
            RejectReason::MalformedClientId(client_id.clone())
        })?;

        if let Some(username) = session.username.as_mut() {
            if let Some(base) = extract_user_metadata(username) {
                *username = base;
            }
        }

        if self.settings.use_auth {
            let Some(password) = session.password.as_deref() else {
                warn!(
                    "Bumper Authentication Failed :: No password provided and password authentication is enabled ('USE_AUTH')"
                );
                return Err(RejectReason::MissingPassword);
            };
            let valid = self
                .repository
                .verify_auth_code(&identity.did, password)
                .await
                .map_err(|e| RejectReason::Internal(e.to_string()))?;
            if !valid {
                warn!("Bumper Authentication Failed :: Wrong password");
                return Err(RejectReason::InvalidAuthCode);
            }
        }

        let username = session.username.clone().unwrap_or_default();
        if identity.is_bot() {
            self.accept_bot(&identity, &username, session).await?;
            Ok(Principal::Bot(identity))
        } else {
            self.repository
                .upsert_client(ClientRecord::new(
                    &username,
                    &identity.did,
                    &identity.class_id,
                    &identity.resource,
                ))
                .await
                .map_err(|e| RejectReason::Internal(e.to_string()))?;
            info!(
                "Bumper Authentication Success :: Client :: Username: {} :: ClientID: {}",
                username, client_id
            );
            Ok(Principal::User(identity))
        }
    }

    async fn check_file_auth(
        &self,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<Principal, RejectReason> {
        let suffix = format!("Username: {} - ClientID: {}", username, client_id);
        match self.credentials.verify(username, password).await {
            CredentialCheck::Match => {
                info!("File Authentication Success :: {}", suffix);
                Ok(Principal::FileUser(username.to_string()))
            }
            CredentialCheck::NoEntry => {
                info!("File Authentication Failed :: No Entry for :: {}", suffix);
                debug!("{}", DEFAULT_DENIED);
                Err(RejectReason::UnknownUser(username.to_string()))
            }
            CredentialCheck::Mismatch => {
                info!("File Authentication Failed :: {}", suffix);
                debug!("{}", DEFAULT_DENIED);
                Err(RejectReason::WrongPassword(username.to_string()))
            }
        }
    }

    async fn accept_bot(
        &self,
        identity: &ClientIdentity,
        username: &str,
        session: &Session,
    ) -> Result<(), RejectReason> {
        let name = if username.is_empty() { &identity.did } else { username };
        self.repository
            .upsert_bot(BotRecord::new(
                name,
                &identity.did,
                &identity.class_id,
                &identity.resource,
                BOT_COMPANY,
            ))
            .await
            .map_err(|e| RejectReason::Internal(e.to_string()))?;
        info!(
            "Bumper Authentication Success :: Bot :: Username: {} :: ClientID: {}",
            username, identity
        );

        if !self.bridge.is_enabled() {
            return Ok(());
        }
        let (Some(user), Some(password)) = (&session.username, &session.password) else {
            return Ok(());
        };
        let login = UpstreamLogin {
            client_id: identity.to_string(),
            username: user.clone(),
            password: password.clone(),
        };
        if let Err(e) = self.bridge.attach(login).await {
            error!(
                target: "bumper::proxy",
                "MQTT Proxy Mode :: Failed to connect shadow client for {} :: {}",
                identity,
                e
            );
        }
        Ok(())
    }
}

/// Splits ``name`header`body`` usernames and logs the decoded metadata.
///
/// Returns the bare username, or `None` when there is no metadata.
fn extract_user_metadata(username: &str) -> Option<String> {
    let parts: Vec<&str> = username.split('`').collect();
    if parts.len() < 3 {
        return None;
    }
    let header = decode_metadata(parts[1]);
    let body = decode_metadata(parts[2]);
    match (header, body) {
        (Some(header), Some(body)) => debug!("Bumper USER info :: {} :: {}", header, body),
        _ => debug!("Bumper USER info :: undecodable metadata for {}", parts[0]),
    }
    Some(parts[0].to_string())
}

fn decode_metadata(segment: &str) -> Option<String> {
    let cleaned = segment.replace('\n', "");
    let bytes = STANDARD.decode(cleaned).ok()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, TokenRecord};
    use crate::mqtt::proxy::tests::{FakeConnector, NullPublisher};
    use chrono::{Duration, Utc};
    use std::io::Write;

    fn secret_hash() -> String {
        pwhash::sha512_crypt::hash("secret").unwrap()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        connector: Arc<FakeConnector>,
        auth: Authenticator,
    }

    fn fixture(settings: AuthSettings, proxy: bool, credentials: CredentialTable) -> Fixture {
        let store = Arc::new(MemoryStore::in_memory());
        let connector = Arc::new(FakeConnector::default());
        let bridge = Arc::new(ProxyBridge::new(
            proxy,
            connector.clone(),
            Arc::new(NullPublisher),
        ));
        let auth = Authenticator::new(settings, credentials, store.clone(), bridge);
        Fixture {
            store,
            connector,
            auth,
        }
    }

    fn settings() -> AuthSettings {
        AuthSettings {
            allow_anonymous: false,
            use_auth: false,
            realms: UserRealms::new(["ecouser.net"]),
        }
    }

    fn session(client_id: Option<&str>, username: Option<&str>, password: Option<&str>) -> Session {
        Session {
            client_id: client_id.map(str::to_string),
            username: username.map(str::to_string),
            password: password.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn password_file_skips_comments_and_stops_at_malformed_line() {
        let table = CredentialTable::parse(
            "# users\n\nalice:$6$a$hash\n:$6$b$nouser\nbroken line\nbob:$6$c$hash\n",
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.verify("alice", "x").await, CredentialCheck::Mismatch);
        assert_eq!(table.verify("bob", "x").await, CredentialCheck::NoEntry);
    }

    #[test]
    fn missing_password_file_yields_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let table = CredentialTable::load(Some(&dir.path().join("passwd")));
        assert!(table.is_empty());
        assert!(CredentialTable::load(None).is_empty());
    }

    #[tokio::test]
    async fn password_file_is_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwd");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "test-client:{}", secret_hash()).unwrap();
        let table = CredentialTable::load(Some(&path));
        assert_eq!(table.verify("test-client", "secret").await, CredentialCheck::Match);
    }

    #[test]
    fn backtick_metadata_is_stripped() {
        let header = STANDARD.encode(r#"{"fv":"1.0.0","wv":"v2.1.0"}"#);
        let body = STANDARD.encode(r#"{"app":"user","st":10}"#);
        let name = extract_user_metadata(&format!("sn1`{}`{}", header, body));
        assert_eq!(name.as_deref(), Some("sn1"));

        assert_eq!(extract_user_metadata("sn1`!!`??").as_deref(), Some("sn1"));
        assert_eq!(extract_user_metadata("sn1`only"), None);
    }

    #[tokio::test]
    async fn helper_bot_is_always_accepted() {
        let f = fixture(settings(), false, CredentialTable::default());
        let mut s = session(Some(HELPER_BOT_CLIENT_ID), Some("x"), Some("garbage"));
        assert_eq!(
            f.auth.authenticate(&mut s).await,
            AuthOutcome::Accepted(Principal::HelperBot)
        );
    }

    #[tokio::test]
    async fn file_auth_accepts_correct_and_rejects_wrong_password() {
        let table = CredentialTable::parse(&format!("test-client:{}", secret_hash()));
        let f = fixture(settings(), false, table);

        let mut ok = session(Some("test-client"), Some("test-client"), Some("secret"));
        assert_eq!(
            f.auth.authenticate(&mut ok).await,
            AuthOutcome::Accepted(Principal::FileUser("test-client".to_string()))
        );

        let mut wrong = session(Some("test-client"), Some("test-client"), Some("nope"));
        assert_eq!(
            f.auth.authenticate(&mut wrong).await,
            AuthOutcome::Rejected {
                reason: RejectReason::WrongPassword("test-client".to_string())
            }
        );

        let mut unknown = session(Some("test-client"), Some("someone"), Some("secret"));
        assert!(!f.auth.authenticate(&mut unknown).await.is_accepted());
    }

    #[tokio::test]
    async fn file_auth_ignores_proxy_mode() {
        let table = CredentialTable::parse(&format!("test-client:{}", secret_hash()));
        let f = fixture(settings(), true, table);
        let mut ok = session(Some("test-client"), Some("test-client@realm"), Some("secret"));
        assert!(f.auth.authenticate(&mut ok).await.is_accepted());
        assert_eq!(ok.username.as_deref(), Some("test-client"));
        assert!(f.connector.logins.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bot_without_credentials_is_accepted_and_recorded() {
        let f = fixture(settings(), false, CredentialTable::default());
        let mut s = session(Some("did123@ls1ok3/res1"), None, None);
        let outcome = f.auth.authenticate(&mut s).await;
        assert!(matches!(outcome, AuthOutcome::Accepted(Principal::Bot(_))));

        let bot = f.store.get_bot("did123").await.unwrap().unwrap();
        assert_eq!(bot.class_id, "ls1ok3");
        assert_eq!(bot.resource, "res1");
        assert_eq!(bot.company, BOT_COMPANY);
        assert!(f.store.list_clients().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn user_realm_creates_client_record() {
        let f = fixture(settings(), false, CredentialTable::default());
        let mut s = session(Some("user1@ecouser.net/res2"), Some("user1"), None);
        let outcome = f.auth.authenticate(&mut s).await;
        assert!(matches!(outcome, AuthOutcome::Accepted(Principal::User(_))));

        let client = f.store.get_client("user1").await.unwrap().unwrap();
        assert_eq!(client.realm, "ecouser.net");
        assert!(f.store.list_bots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconnect_updates_instead_of_duplicating() {
        let f = fixture(settings(), false, CredentialTable::default());
        for resource in ["res1", "res2"] {
            let id = format!("did123@ls1ok3/{}", resource);
            let mut s = session(Some(&id), Some("sn1"), None);
            assert!(f.auth.authenticate(&mut s).await.is_accepted());
        }
        let bots = f.store.list_bots().await.unwrap();
        assert_eq!(bots.len(), 1);
        assert_eq!(bots[0].resource, "res2");
    }

    #[tokio::test]
    async fn malformed_client_id_is_rejected_without_anonymous() {
        let f = fixture(settings(), false, CredentialTable::default());
        let mut s = session(Some("nodelimiter"), None, None);
        assert_eq!(
            f.auth.authenticate(&mut s).await,
            AuthOutcome::Rejected {
                reason: RejectReason::MalformedClientId("nodelimiter".to_string())
            }
        );

        let mut none = session(None, None, None);
        assert!(!f.auth.authenticate(&mut none).await.is_accepted());
    }

    #[tokio::test]
    async fn anonymous_fallback_covers_authorization_failures() {
        let f = fixture(
            AuthSettings {
                allow_anonymous: true,
                ..settings()
            },
            false,
            CredentialTable::default(),
        );
        let mut s = session(Some("nodelimiter"), None, None);
        assert_eq!(
            f.auth.authenticate(&mut s).await,
            AuthOutcome::AnonymousFallback {
                reason: RejectReason::MalformedClientId("nodelimiter".to_string())
            }
        );
        assert!(!RejectReason::Internal("db".to_string()).is_authorization_failure());
    }

    #[tokio::test]
    async fn auth_codes_are_checked_when_enabled() {
        let f = fixture(
            AuthSettings {
                use_auth: true,
                ..settings()
            },
            false,
            CredentialTable::default(),
        );
        f.store
            .add_token(TokenRecord {
                userid: "fuid_user1".to_string(),
                token: "tok".to_string(),
                authcode: Some("code1".to_string()),
                expiration: Utc::now() + Duration::minutes(5),
            })
            .await
            .unwrap();

        let mut missing = session(Some("user1@ecouser.net/res"), Some("user1"), None);
        assert_eq!(
            f.auth.authenticate(&mut missing).await,
            AuthOutcome::Rejected {
                reason: RejectReason::MissingPassword
            }
        );

        let mut wrong = session(Some("user1@ecouser.net/res"), Some("user1"), Some("bad"));
        assert_eq!(
            f.auth.authenticate(&mut wrong).await,
            AuthOutcome::Rejected {
                reason: RejectReason::InvalidAuthCode
            }
        );

        let mut ok = session(Some("user1@ecouser.net/res"), Some("user1"), Some("code1"));
        assert!(f.auth.authenticate(&mut ok).await.is_accepted());
    }

    #[tokio::test]
    async fn proxy_mode_attaches_shadow_client_for_bots() {
        let f = fixture(settings(), true, CredentialTable::default());
        let mut s = session(Some("did1@ls1ok3/res1"), Some("sn1@ecouser"), Some("token"));
        assert!(f.auth.authenticate(&mut s).await.is_accepted());

        let logins = f.connector.logins.lock().unwrap().clone();
        assert_eq!(
            logins,
            vec![UpstreamLogin {
                client_id: "did1@ls1ok3/res1".to_string(),
                username: "sn1".to_string(),
                password: "token".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn proxy_failure_does_not_block_local_auth() {
        let store = Arc::new(MemoryStore::in_memory());
        let connector = Arc::new(FakeConnector {
            refuse: true,
            ..Default::default()
        });
        let bridge = Arc::new(ProxyBridge::new(true, connector, Arc::new(NullPublisher)));
        let auth = Authenticator::new(settings(), CredentialTable::default(), store, bridge.clone());

        let mut s = session(Some("did1@ls1ok3/res1"), Some("sn1"), Some("token"));
        assert!(auth.authenticate(&mut s).await.is_accepted());
        assert!(!bridge.has_client("did1@ls1ok3/res1").await);
    }
}
