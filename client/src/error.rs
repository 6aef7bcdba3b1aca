//! Error types for the Tether client.

use thiserror::Error;

/// All possible errors surfaced by the client API.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid url '{0}': only ws:// and wss:// schemes are supported")]
    InvalidUrl(String),

    #[error("record names must be non-empty")]
    InvalidRecordName,

    #[error("record root values must be objects")]
    RootNotObject,

    #[error("record '{0}' was destroyed")]
    RecordDestroyed(String),

    #[error("this client's connection was closed: {0}")]
    ConnectionClosed(String),

    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    #[error("already listening to pattern '{0}'")]
    ListenerExists(String),

    #[error("not listening to pattern '{0}'")]
    NotListening(String),

    #[error("client was shut down")]
    ClientShutdown,

    #[error(transparent)]
    Engine(#[from] tether_engine::Error),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
