//! Error definitions for the MQTT subsystem

use thiserror::Error;

use crate::db::RepositoryError;

/// Errors raised inside the broker, the proxy bridge and the helper bot.
///
/// None of these are fatal to the process: the caller logs them and at most one
/// client session or one proxy relay is affected.
#[derive(Debug, Error)]
pub enum MqttError {
    /// Client id does not follow `<did>@<class>/<resource>`
    #[error("Malformed client id: '{0}'")]
    MalformedClientId(String),

    /// Topic could not be split into the expected segments
    #[error("Topic error: {0}")]
    Topic(#[from] TopicError),

    /// MQTT framing error reported by the codec
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Socket or file I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS material could not be loaded
    #[error("TLS error: {0}")]
    Tls(String),

    /// Persistence layer failed
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Connection to the upstream broker failed
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The rumqttc client rejected a request
    #[error("Client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// An operation did not finish in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A channel between two tasks was closed
    #[error("Channel error: {0}")]
    Channel(String),
}

/// Errors produced while parsing a slash-delimited topic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic '{topic}' has {segments} segments, at least {required} required")]
    TooShort {
        topic: String,
        segments: usize,
        required: usize,
    },

    #[error("topic '{topic}' has no segment {index}")]
    MissingSegment { topic: String, index: usize },
}
