//! Client identity parsing
//!
//! Devices and apps connect with a client id of the form
//! `<DID_or_USERID>@<CLASS_ID>/<RESOURCE>`. The class id decides whether the
//! connection belongs to an app user (one of the configured user realms) or to
//! a bot.

use std::collections::HashSet;
use std::fmt;

use super::error::MqttError;

/// Reserved client id of the internal helper bot.
pub const HELPER_BOT_CLIENT_ID: &str = "helperbot@bumper/helper";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Bot,
    User,
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientKind::Bot => write!(f, "bot"),
            ClientKind::User => write!(f, "user"),
        }
    }
}

/// Set of class ids that mark app user connections.
#[derive(Debug, Clone, Default)]
pub struct UserRealms {
    realms: HashSet<String>,
}

impl UserRealms {
    pub fn new<I, S>(realms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            realms: realms.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, class_id: &str) -> bool {
        self.realms.contains(class_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub did: String,
    pub class_id: String,
    pub resource: String,
    pub kind: ClientKind,
}

impl ClientIdentity {
    /// Splits `did@class/resource` and classifies the result.
    ///
    /// The first `@` separates the id, the first `/` after it separates class
    /// and resource. Anything without both delimiters is rejected.
    pub fn parse(client_id: &str, realms: &UserRealms) -> Result<Self, MqttError> {
        let (did, rest) = client_id
            .split_once('@')
            .ok_or_else(|| MqttError::MalformedClientId(client_id.to_string()))?;
        let (class_id, resource) = rest
            .split_once('/')
            .ok_or_else(|| MqttError::MalformedClientId(client_id.to_string()))?;

        let kind = if realms.contains(class_id) {
            ClientKind::User
        } else {
            ClientKind::Bot
        };

        Ok(Self {
            did: did.to_string(),
            class_id: class_id.to_string(),
            resource: resource.to_string(),
            kind,
        })
    }

    pub fn is_bot(&self) -> bool {
        self.kind == ClientKind::Bot
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}/{}", self.did, self.class_id, self.resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn realms() -> UserRealms {
        UserRealms::new(["ecouser.net"])
    }

    #[test]
    fn bot_class_is_classified_as_bot() {
        let identity = ClientIdentity::parse("did123@ls1ok3/res1", &realms()).unwrap();
        assert_eq!(identity.did, "did123");
        assert_eq!(identity.class_id, "ls1ok3");
        assert_eq!(identity.resource, "res1");
        assert_eq!(identity.kind, ClientKind::Bot);
    }

    #[test]
    fn user_realm_is_classified_as_user() {
        let identity = ClientIdentity::parse("user1@ecouser.net/res2", &realms()).unwrap();
        assert_eq!(identity.kind, ClientKind::User);
        assert_eq!(identity.to_string(), "user1@ecouser.net/res2");
    }

    #[test]
    fn realm_set_is_configurable() {
        let custom = UserRealms::new(["ls1ok3"]);
        let identity = ClientIdentity::parse("did123@ls1ok3/res1", &custom).unwrap();
        assert_eq!(identity.kind, ClientKind::User);
    }

    #[test]
    fn missing_delimiters_are_rejected() {
        for id in ["nodelimiter", "did123@ls1ok3", "did123/res1"] {
            assert!(
                matches!(
                    ClientIdentity::parse(id, &realms()),
                    Err(MqttError::MalformedClientId(_))
                ),
                "{id} should be rejected"
            );
        }
    }

    #[test]
    fn only_first_delimiters_split() {
        let identity = ClientIdentity::parse("a@b@c/d/e", &realms()).unwrap();
        assert_eq!(identity.did, "a");
        assert_eq!(identity.class_id, "b@c");
        assert_eq!(identity.resource, "d/e");
    }

    #[test]
    fn helper_bot_id_parses_as_bot() {
        let identity = ClientIdentity::parse(HELPER_BOT_CLIENT_ID, &realms()).unwrap();
        assert_eq!(identity.did, "helperbot");
        assert!(identity.is_bot());
    }
}
