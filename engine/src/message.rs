//! Wire framing: topics, actions, events, connection states, and the
//! frame codec.
//!
//! A frame is `TOPIC ␟ ACTION ␟ data…␞`: fields are joined by U+001F and
//! each message is terminated by U+001E, so one transport payload may
//! carry any number of frames back to back.

use std::fmt;

use crate::error::{Error, Result};

/// Separator between the fields of a single frame.
pub const FIELD_SEPARATOR: char = '\u{1f}';

/// Terminator after each framed message.
pub const MESSAGE_SEPARATOR: char = '\u{1e}';

/// Message topic, the first field of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Connection,
    Auth,
    Record,
    Error,
}

impl Topic {
    /// The one-byte wire code.
    pub fn code(self) -> &'static str {
        match self {
            Topic::Connection => "C",
            Topic::Auth => "A",
            Topic::Record => "R",
            Topic::Error => "X",
        }
    }

    /// Parse a wire code back into a topic.
    pub fn from_code(code: &str) -> Result<Topic> {
        match code {
            "C" => Ok(Topic::Connection),
            "A" => Ok(Topic::Auth),
            "R" => Ok(Topic::Record),
            "X" => Ok(Topic::Error),
            other => Err(Error::UnknownTopic(other.to_string())),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topic::Connection => "CONNECTION",
            Topic::Auth => "AUTH",
            Topic::Record => "RECORD",
            Topic::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Message action, the second field of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Read,
    Update,
    Unsubscribe,
    SubscriptionHasProvider,
    Listen,
    Unlisten,
    Ack,
    Error,
    Ping,
    Pong,
    Challenge,
    ChallengeResponse,
    Redirect,
    Rejection,
    Request,
}

impl Action {
    /// The short wire code.
    pub fn code(self) -> &'static str {
        match self {
            Action::Read => "R",
            Action::Update => "U",
            Action::Unsubscribe => "US",
            Action::SubscriptionHasProvider => "SH",
            Action::Listen => "L",
            Action::Unlisten => "UL",
            Action::Ack => "A",
            Action::Error => "E",
            Action::Ping => "PI",
            Action::Pong => "PO",
            Action::Challenge => "CH",
            Action::ChallengeResponse => "CHR",
            Action::Redirect => "RED",
            Action::Rejection => "REJ",
            Action::Request => "REQ",
        }
    }

    /// Parse a wire code back into an action.
    pub fn from_code(code: &str) -> Result<Action> {
        match code {
            "R" => Ok(Action::Read),
            "U" => Ok(Action::Update),
            "US" => Ok(Action::Unsubscribe),
            "SH" => Ok(Action::SubscriptionHasProvider),
            "L" => Ok(Action::Listen),
            "UL" => Ok(Action::Unlisten),
            "A" => Ok(Action::Ack),
            "E" => Ok(Action::Error),
            "PI" => Ok(Action::Ping),
            "PO" => Ok(Action::Pong),
            "CH" => Ok(Action::Challenge),
            "CHR" => Ok(Action::ChallengeResponse),
            "RED" => Ok(Action::Redirect),
            "REJ" => Ok(Action::Rejection),
            "REQ" => Ok(Action::Request),
            other => Err(Error::UnknownAction(other.to_string())),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Event codes surfaced on the client error channel and in server error
/// frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    ConnectionError,
    ConnectionAuthenticationTimeout,
    TooManyAuthAttempts,
    IsClosed,
    MaxReconnectionAttemptsReached,
    ListenerExists,
    NotListening,
    MessageDenied,
    MessageParseError,
    UnsolicitedMessage,
}

impl Event {
    /// The wire/reporting code.
    pub fn code(self) -> &'static str {
        match self {
            Event::ConnectionError => "CONNECTION_ERROR",
            Event::ConnectionAuthenticationTimeout => "CONNECTION_AUTHENTICATION_TIMEOUT",
            Event::TooManyAuthAttempts => "TOO_MANY_AUTH_ATTEMPTS",
            Event::IsClosed => "IS_CLOSED",
            Event::MaxReconnectionAttemptsReached => "MAX_RECONNECTION_ATTEMPTS_REACHED",
            Event::ListenerExists => "LISTENER_EXISTS",
            Event::NotListening => "NOT_LISTENING",
            Event::MessageDenied => "MESSAGE_DENIED",
            Event::MessageParseError => "MESSAGE_PARSE_ERROR",
            Event::UnsolicitedMessage => "UNSOLICITED_MESSAGE",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Lifecycle states of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Closed,
    AwaitingConnection,
    Challenging,
    AwaitingAuthentication,
    Authenticating,
    Open,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::AwaitingConnection => "AWAITING_CONNECTION",
            ConnectionState::Challenging => "CHALLENGING",
            ConnectionState::AwaitingAuthentication => "AWAITING_AUTHENTICATION",
            ConnectionState::Authenticating => "AUTHENTICATING",
            ConnectionState::Open => "OPEN",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// A parsed wire message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: Topic,
    pub action: Action,
    pub data: Vec<String>,
}

impl Message {
    pub fn new(topic: Topic, action: Action, data: Vec<String>) -> Self {
        Self {
            topic,
            action,
            data,
        }
    }
}

/// Encode one outbound frame.
pub fn build_message(topic: Topic, action: Action, data: &[&str]) -> String {
    let mut frame = String::with_capacity(8 + data.iter().map(|d| d.len() + 1).sum::<usize>());
    frame.push_str(topic.code());
    frame.push(FIELD_SEPARATOR);
    frame.push_str(action.code());
    for field in data {
        frame.push(FIELD_SEPARATOR);
        frame.push_str(field);
    }
    frame.push(MESSAGE_SEPARATOR);
    frame
}

/// Decode every frame in a transport payload.
///
/// A malformed frame yields a per-frame error without poisoning the rest
/// of the batch.
pub fn parse_messages(raw: &str) -> Vec<Result<Message>> {
    raw.split(MESSAGE_SEPARATOR)
        .filter(|frame| !frame.is_empty())
        .map(parse_frame)
        .collect()
}

fn parse_frame(frame: &str) -> Result<Message> {
    let mut fields = frame.split(FIELD_SEPARATOR);
    let topic = fields
        .next()
        .filter(|code| !code.is_empty())
        .ok_or_else(|| Error::InvalidFrame(frame.to_string()))?;
    let action = fields
        .next()
        .filter(|code| !code.is_empty())
        .ok_or_else(|| Error::InvalidFrame(frame.to_string()))?;
    Ok(Message {
        topic: Topic::from_code(topic)?,
        action: Action::from_code(action)?,
        data: fields.map(str::to_owned).collect(),
    })
}

/// Parse the typed boolean flag carried by provider notifications.
pub fn parse_typed_bool(field: &str) -> Result<bool> {
    match field {
        "T" => Ok(true),
        "F" => Ok(false),
        other => Err(Error::InvalidTypedValue(other.to_string())),
    }
}
