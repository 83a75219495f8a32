use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a [`BridgeError`], used when an error is
/// forwarded to the presentation layer as an event payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingConfiguration,
    BinaryNotFound,
    Spawn,
    ServerNotReady,
    Http,
    Network,
    Stream,
    SessionNotFound,
    TurnInProgress,
    Settings,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("missing configuration: {keys}")]
    MissingConfiguration { keys: String },
    #[error("agent binary not found: {name}")]
    BinaryNotFound { name: String },
    #[error("failed to spawn agent server: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
    #[error("agent server is not ready")]
    ServerNotReady,
    #[error("http error {status} {status_text}: {body}")]
    Http {
        status: u16,
        status_text: String,
        body: String,
    },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("stream error: {message}")]
    Stream { message: String },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("a chat turn is already in progress")]
    TurnInProgress,
    #[error("settings error: {message}")]
    Settings { message: String },
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingConfiguration { .. } => ErrorKind::MissingConfiguration,
            Self::BinaryNotFound { .. } => ErrorKind::BinaryNotFound,
            Self::Spawn { .. } => ErrorKind::Spawn,
            Self::ServerNotReady => ErrorKind::ServerNotReady,
            Self::Http { .. } => ErrorKind::Http,
            Self::Network(_) => ErrorKind::Network,
            Self::Stream { .. } => ErrorKind::Stream,
            Self::SessionNotFound { .. } => ErrorKind::SessionNotFound,
            Self::TurnInProgress => ErrorKind::TurnInProgress,
            Self::Settings { .. } => ErrorKind::Settings,
        }
    }

    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream {
            message: message.into(),
        }
    }

    pub fn settings(message: impl Into<String>) -> Self {
        Self::Settings {
            message: message.into(),
        }
    }
}

/// Serializable form of an error, suitable for event payloads crossing the
/// presentation-bridge boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&BridgeError> for ErrorReport {
    fn from(value: &BridgeError) -> Self {
        Self {
            kind: value.kind(),
            message: value.to_string(),
        }
    }
}

impl From<BridgeError> for ErrorReport {
    fn from(value: BridgeError) -> Self {
        Self::from(&value)
    }
}
