//! Typed client- and record-level events.

use tether_engine::{ConnectionState, Topic};

/// Events broadcast by the client shell.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The connection moved to a new lifecycle state.
    ConnectionStateChanged(ConnectionState),
    /// Reconnection was abandoned after the configured attempt cap.
    MaxReconnectionAttemptsReached,
    /// The error channel: protocol and transport problems that are not
    /// tied to one pending operation.
    Error {
        topic: Topic,
        event: String,
        message: String,
    },
}

/// Events broadcast by an individual record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecordEvent {
    /// The record received its initial snapshot and is usable.
    Ready,
    /// The record was torn down; no further operations will succeed.
    Destroyed,
    /// The server-side provider indication flipped.
    HasProviderChanged(bool),
}
