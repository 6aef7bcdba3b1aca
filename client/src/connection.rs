//! The connection state machine.
//!
//! Owns the transport endpoint and everything that happens on it: the
//! authentication handshake, heartbeat liveness, the conflating send
//! buffer, cooperative inbound draining, and reconnection with linear
//! backoff. The machine itself is synchronous; the client core drives it
//! with transport events and timer wakes, and `next_wake` tells the core
//! when the next deadline is due.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use tether_engine::{build_message, parse_messages, Action, ConnectionState, Event, Message, Topic, MESSAGE_SEPARATOR};

use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::options::ClientOptions;
use crate::transport::{Connector, Endpoint, TransportEvent};

/// Outcome delivered to a pending `login` call.
pub(crate) type AuthOutcome = Result<Option<Value>, ClientError>;

/// How much longer than the heartbeat interval the connection tolerates
/// silence before declaring the peer dead.
const HEARTBEAT_TOLERANCE: u32 = 2;

pub(crate) struct Connection {
    options: Arc<ClientOptions>,
    connector: Arc<dyn Connector>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    events: broadcast::Sender<ClientEvent>,

    state: ConnectionState,
    endpoint: Option<Box<dyn Endpoint>>,
    /// The URL currently being connected to; diverges from
    /// `original_url` only while following a redirect.
    url: String,
    original_url: String,

    auth_params: Option<Value>,
    auth_reply: Option<oneshot::Sender<AuthOutcome>>,

    queued: VecDeque<String>,
    flush_at: Option<Instant>,

    inbound: VecDeque<String>,

    deliberate_close: bool,
    redirecting: bool,
    too_many_auth_attempts: bool,
    challenge_denied: bool,
    connection_auth_timeout: bool,

    reconnect_attempts: u32,
    reconnect_at: Option<Instant>,

    heartbeat_at: Option<Instant>,
    last_heartbeat: Instant,
}

impl Connection {
    /// Create a connection for an already normalized URL. Returns the
    /// receiver the core loop drains transport events from.
    pub(crate) fn new(
        url: String,
        options: Arc<ClientOptions>,
        connector: Arc<dyn Connector>,
        events: broadcast::Sender<ClientEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let connection = Self {
            options,
            connector,
            transport_tx,
            events,
            state: ConnectionState::Closed,
            endpoint: None,
            original_url: url.clone(),
            url,
            auth_params: None,
            auth_reply: None,
            queued: VecDeque::new(),
            flush_at: None,
            inbound: VecDeque::new(),
            deliberate_close: false,
            redirecting: false,
            too_many_auth_attempts: false,
            challenge_denied: false,
            connection_auth_timeout: false,
            reconnect_attempts: 0,
            reconnect_at: None,
            heartbeat_at: None,
            last_heartbeat: Instant::now(),
        };
        (connection, transport_rx)
    }

    /// Open the initial endpoint.
    pub(crate) fn start(&mut self) {
        let url = self.url.clone();
        self.connect_endpoint(&url);
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    /// Queue one frame for the wire.
    ///
    /// A queue longer than `max_messages_per_packet` flushes immediately;
    /// anything shorter waits up to `send_delay` so bursts conflate into
    /// a single transport write.
    pub(crate) fn send(&mut self, frame: String) {
        self.queued.push_back(frame);
        if self.queued.len() > self.options.max_messages_per_packet {
            self.flush();
        } else if self.flush_at.is_none() {
            self.flush_at = Some(Instant::now() + self.options.send_delay);
        }
    }

    /// Build and queue one frame.
    pub(crate) fn send_msg(&mut self, topic: Topic, action: Action, data: &[&str]) {
        self.send(build_message(topic, action, data));
    }

    /// Store credentials and submit them as soon as the handshake allows.
    pub(crate) fn authenticate(&mut self, params: Value, reply: oneshot::Sender<AuthOutcome>) {
        if let Some(reason) = self.terminal_close_reason() {
            let _ = reply.send(Err(ClientError::ConnectionClosed(reason.to_string())));
            return;
        }

        self.auth_params = Some(params);
        self.auth_reply = Some(reply);

        if self.deliberate_close && self.state == ConnectionState::Closed {
            // A deliberately closed client may log back in; reopen first.
            self.deliberate_close = false;
            self.url = self.original_url.clone();
            let url = self.url.clone();
            self.connect_endpoint(&url);
        } else if self.state == ConnectionState::AwaitingAuthentication {
            self.send_auth_request();
        }
    }

    /// Deliberately close the connection. No reconnect will follow.
    pub(crate) fn close(&mut self) {
        self.deliberate_close = true;
        self.flush();
        self.flush_at = None;
        self.heartbeat_at = None;
        self.reconnect_at = None;
        match self.endpoint.as_mut() {
            Some(endpoint) => endpoint.close(),
            None => self.set_state(ConnectionState::Closed),
        }
    }

    /// Feed one transport event through the machine. Messages for topics
    /// the connection does not own are returned for the record layer.
    pub(crate) fn on_transport_event(
        &mut self,
        event: TransportEvent,
        now: Instant,
    ) -> Vec<Message> {
        match event {
            TransportEvent::Open => {
                self.on_open(now);
                Vec::new()
            }
            TransportEvent::Frame(payload) => {
                for frame in payload
                    .split(MESSAGE_SEPARATOR)
                    .filter(|frame| !frame.is_empty())
                {
                    self.inbound.push_back(frame.to_string());
                }
                self.drain_inbound(now)
            }
            TransportEvent::Error(message) => {
                self.on_transport_error(message);
                Vec::new()
            }
            TransportEvent::Closed => {
                self.on_closed(now);
                Vec::new()
            }
        }
    }

    /// The earliest pending deadline, if any. Leftover inbound frames
    /// request an immediate wake so large batches keep draining without
    /// starving commands.
    pub(crate) fn next_wake(&self) -> Option<Instant> {
        if !self.inbound.is_empty() {
            return Some(Instant::now());
        }
        [self.flush_at, self.reconnect_at, self.heartbeat_at]
            .into_iter()
            .flatten()
            .min()
    }

    /// Run every deadline that has come due.
    pub(crate) fn on_wake(&mut self, now: Instant) -> Vec<Message> {
        if self.flush_at.is_some_and(|at| at <= now) {
            self.flush();
        }
        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            let url = self.url.clone();
            self.connect_endpoint(&url);
        }
        if self.heartbeat_at.is_some_and(|at| at <= now) {
            self.check_heartbeat(now);
        }
        if self.inbound.is_empty() {
            Vec::new()
        } else {
            self.drain_inbound(now)
        }
    }

    fn terminal_close_reason(&self) -> Option<&'static str> {
        if self.too_many_auth_attempts {
            Some("too many authentication attempts")
        } else if self.challenge_denied {
            Some("connection challenge was denied")
        } else if self.connection_auth_timeout {
            Some("authentication timed out")
        } else {
            None
        }
    }

    fn connect_endpoint(&mut self, url: &str) {
        tracing::debug!(url = %url, "opening endpoint");
        self.endpoint = Some(self.connector.connect(url, self.transport_tx.clone()));
    }

    fn on_open(&mut self, now: Instant) {
        self.reconnect_attempts = 0;
        self.reconnect_at = None;
        self.last_heartbeat = now;
        self.heartbeat_at = Some(now + self.options.heartbeat_interval);
        self.set_state(ConnectionState::AwaitingConnection);
    }

    fn on_transport_error(&mut self, message: String) {
        self.heartbeat_at = None;
        self.flush_at = None;
        if self.state == ConnectionState::Reconnecting {
            // Failed reconnect attempts stay in RECONNECTING; the closed
            // event that follows schedules the next attempt.
            tracing::debug!("reconnect attempt failed: {}", message);
        } else {
            self.set_state(ConnectionState::Error);
            self.emit_error(Topic::Connection, Event::ConnectionError, message);
        }
    }

    fn on_closed(&mut self, now: Instant) {
        self.endpoint = None;
        self.heartbeat_at = None;
        self.flush_at = None;
        if self.redirecting {
            self.redirecting = false;
            let url = self.url.clone();
            self.connect_endpoint(&url);
        } else if self.deliberate_close {
            self.set_state(ConnectionState::Closed);
        } else {
            self.try_reconnect(now);
        }
    }

    fn try_reconnect(&mut self, now: Instant) {
        if self.reconnect_attempts < self.options.max_reconnect_attempts {
            self.reconnect_attempts += 1;
            let delay = (self.options.reconnect_interval_increment * self.reconnect_attempts)
                .min(self.options.max_reconnect_interval);
            self.reconnect_at = Some(now + delay);
            self.url = self.original_url.clone();
            self.set_state(ConnectionState::Reconnecting);
            tracing::info!(
                attempt = self.reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
        } else {
            tracing::error!(
                attempts = self.reconnect_attempts,
                "giving up on reconnecting"
            );
            let _ = self.events.send(ClientEvent::MaxReconnectionAttemptsReached);
            self.deliberate_close = true;
            self.reconnect_at = None;
            self.set_state(ConnectionState::Closed);
        }
    }

    fn check_heartbeat(&mut self, now: Instant) {
        let tolerance = self.options.heartbeat_interval * HEARTBEAT_TOLERANCE;
        if now.duration_since(self.last_heartbeat) > tolerance {
            tracing::error!("heartbeat not received in time, closing endpoint");
            self.emit_error(
                Topic::Connection,
                Event::ConnectionError,
                "heartbeat not received".to_string(),
            );
            self.heartbeat_at = None;
            if let Some(endpoint) = self.endpoint.as_mut() {
                endpoint.close();
            }
        } else {
            self.submit_direct(build_message(Topic::Connection, Action::Ping, &[]));
            self.heartbeat_at = Some(now + self.options.heartbeat_interval);
        }
    }

    /// Write a frame straight to the endpoint, bypassing the conflation
    /// queue. Used for handshake and heartbeat traffic, which must go out
    /// before the connection reaches OPEN.
    fn submit_direct(&mut self, frame: String) {
        if let Some(endpoint) = self.endpoint.as_mut() {
            if endpoint.is_writable() {
                endpoint.send(frame);
            }
        }
    }

    fn flush(&mut self) {
        self.flush_at = None;
        if self.state != ConnectionState::Open {
            return;
        }
        let Some(endpoint) = self.endpoint.as_mut() else {
            return;
        };
        if !endpoint.is_writable() {
            return;
        }
        while !self.queued.is_empty() {
            let take = self.queued.len().min(self.options.max_messages_per_packet);
            let mut packet = String::new();
            for frame in self.queued.drain(..take) {
                packet.push_str(&frame);
            }
            endpoint.send(packet);
        }
    }

    fn drain_inbound(&mut self, now: Instant) -> Vec<Message> {
        let mut routed = Vec::new();
        let mut budget = self.options.max_messages_per_read;
        while budget > 0 {
            let Some(frame) = self.inbound.pop_front() else {
                break;
            };
            budget -= 1;
            for parsed in parse_messages(&frame) {
                match parsed {
                    Ok(message) => {
                        tracing::trace!(topic = %message.topic, action = %message.action, "incoming message");
                        match message.topic {
                            Topic::Connection => self.handle_connection_message(message, now),
                            Topic::Auth => self.handle_auth_message(message),
                            _ => routed.push(message),
                        }
                    }
                    Err(e) => {
                        tracing::warn!("dropping malformed frame: {}", e);
                        self.emit_error(Topic::Error, Event::MessageParseError, e.to_string());
                    }
                }
            }
        }
        routed
    }

    fn handle_connection_message(&mut self, message: Message, now: Instant) {
        match message.action {
            Action::Ping => {
                self.last_heartbeat = now;
                self.submit_direct(build_message(Topic::Connection, Action::Pong, &[]));
            }
            Action::Pong => {
                self.last_heartbeat = now;
            }
            Action::Challenge => {
                let url = self.original_url.clone();
                self.submit_direct(build_message(
                    Topic::Connection,
                    Action::ChallengeResponse,
                    &[&url],
                ));
                self.set_state(ConnectionState::Challenging);
            }
            Action::Ack => {
                self.set_state(ConnectionState::AwaitingAuthentication);
                if self.auth_params.is_some() {
                    self.send_auth_request();
                }
            }
            Action::Redirect => match message.data.first() {
                Some(url) => {
                    tracing::info!(url = %url, "following connection redirect");
                    self.redirecting = true;
                    self.url = url.clone();
                    if let Some(endpoint) = self.endpoint.as_mut() {
                        endpoint.close();
                    }
                }
                None => {
                    self.emit_error(
                        Topic::Connection,
                        Event::MessageParseError,
                        "redirect without a target url".to_string(),
                    );
                }
            },
            Action::Rejection => {
                self.challenge_denied = true;
                self.close();
            }
            Action::Error => {
                let code = message.data.first().map(String::as_str).unwrap_or("");
                if code == Event::ConnectionAuthenticationTimeout.code() {
                    self.connection_auth_timeout = true;
                    self.emit_error(
                        Topic::Connection,
                        Event::ConnectionAuthenticationTimeout,
                        message.data.join(" "),
                    );
                    self.close();
                } else {
                    self.emit_error(Topic::Connection, Event::ConnectionError, message.data.join(" "));
                }
            }
            other => {
                tracing::warn!(action = %other, "unexpected action on connection topic");
            }
        }
    }

    fn handle_auth_message(&mut self, message: Message) {
        match message.action {
            Action::Ack => {
                self.set_state(ConnectionState::Open);
                let data = message
                    .data
                    .first()
                    .and_then(|d| serde_json::from_str(d).ok());
                if let Some(reply) = self.auth_reply.take() {
                    let _ = reply.send(Ok(data));
                }
                self.flush();
            }
            Action::Error => {
                let code = message.data.first().map(String::as_str).unwrap_or("");
                if code == Event::TooManyAuthAttempts.code() {
                    self.too_many_auth_attempts = true;
                    self.close();
                } else {
                    self.set_state(ConnectionState::AwaitingAuthentication);
                }
                if let Some(reply) = self.auth_reply.take() {
                    let _ = reply.send(Err(ClientError::AuthenticationRejected(
                        message.data.join(" "),
                    )));
                }
            }
            other => {
                tracing::warn!(action = %other, "unexpected action on auth topic");
            }
        }
    }

    fn send_auth_request(&mut self) {
        if let Some(params) = &self.auth_params {
            let payload = params.to_string();
            self.submit_direct(build_message(Topic::Auth, Action::Request, &[&payload]));
            self.set_state(ConnectionState::Authenticating);
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        tracing::debug!(from = %self.state, to = %state, "connection state changed");
        self.state = state;
        let _ = self
            .events
            .send(ClientEvent::ConnectionStateChanged(state));
    }

    fn emit_error(&self, topic: Topic, event: Event, message: String) {
        tracing::error!(topic = %topic, event = %event, "{}", message);
        let _ = self.events.send(ClientEvent::Error {
            topic,
            event: event.code().to_string(),
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockConnector, MockLink};
    use serde_json::json;
    use std::time::Duration;

    fn test_options() -> ClientOptions {
        ClientOptions {
            heartbeat_interval: Duration::from_millis(100),
            reconnect_interval_increment: Duration::from_millis(50),
            max_reconnect_interval: Duration::from_millis(120),
            max_reconnect_attempts: 3,
            max_messages_per_packet: 4,
            send_delay: Duration::from_millis(5),
            ..ClientOptions::default()
        }
    }

    struct Rig {
        connection: Connection,
        transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        connector: MockConnector,
        events: broadcast::Receiver<ClientEvent>,
    }

    impl Rig {
        fn new(options: ClientOptions) -> Self {
            let connector = MockConnector::new();
            let (events_tx, events) = broadcast::channel(64);
            let (mut connection, transport_rx) = Connection::new(
                "ws://server:6020/tether".to_string(),
                Arc::new(options),
                Arc::new(connector.clone()),
                events_tx,
            );
            connection.start();
            Self {
                connection,
                transport_rx,
                connector,
                events,
            }
        }

        /// Drain transport events through the machine, as the core loop
        /// would, and collect any routed record-topic messages.
        fn pump(&mut self) -> Vec<Message> {
            let mut routed = Vec::new();
            while let Ok(event) = self.transport_rx.try_recv() {
                routed.extend(
                    self.connection
                        .on_transport_event(event, Instant::now()),
                );
            }
            routed
        }

        fn link(&self, i: usize) -> MockLink {
            self.connector.link(i)
        }

        fn open_to_awaiting_auth(&mut self) -> MockLink {
            let link = self.link(0);
            link.open();
            link.frame(build_message(Topic::Connection, Action::Challenge, &[]));
            link.frame(build_message(Topic::Connection, Action::Ack, &[]));
            self.pump();
            link
        }

        fn open_to_ready(&mut self) -> (MockLink, oneshot::Receiver<AuthOutcome>) {
            let link = self.open_to_awaiting_auth();
            let (reply_tx, reply_rx) = oneshot::channel();
            self.connection.authenticate(json!({"user": "a"}), reply_tx);
            link.frame(build_message(Topic::Auth, Action::Ack, &[]));
            self.pump();
            (link, reply_rx)
        }

        fn state_changes(&mut self) -> Vec<ConnectionState> {
            let mut states = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if let ClientEvent::ConnectionStateChanged(state) = event {
                    states.push(state);
                }
            }
            states
        }
    }

    #[test]
    fn handshake_and_auth_state_sequence() {
        let mut rig = Rig::new(test_options());
        let link = rig.link(0);

        link.open();
        rig.pump();
        assert_eq!(rig.connection.state(), ConnectionState::AwaitingConnection);

        link.frame(build_message(Topic::Connection, Action::Challenge, &[]));
        rig.pump();
        assert_eq!(rig.connection.state(), ConnectionState::Challenging);
        let challenge_response = &rig.link(0).sent_frames()[0];
        assert!(challenge_response.starts_with("C\u{1f}CHR\u{1f}ws://server:6020/tether"));

        link.frame(build_message(Topic::Connection, Action::Ack, &[]));
        rig.pump();
        assert_eq!(
            rig.connection.state(),
            ConnectionState::AwaitingAuthentication
        );

        let (reply_tx, mut reply_rx) = oneshot::channel();
        rig.connection.authenticate(json!({"user": "a"}), reply_tx);
        assert_eq!(rig.connection.state(), ConnectionState::Authenticating);

        link.frame(build_message(Topic::Auth, Action::Ack, &[]));
        rig.pump();
        assert_eq!(rig.connection.state(), ConnectionState::Open);
        assert_eq!(reply_rx.try_recv().unwrap().unwrap(), None);

        assert_eq!(
            rig.state_changes(),
            vec![
                ConnectionState::AwaitingConnection,
                ConnectionState::Challenging,
                ConnectionState::AwaitingAuthentication,
                ConnectionState::Authenticating,
                ConnectionState::Open,
            ]
        );
    }

    #[test]
    fn credentials_provided_before_ack_are_submitted_on_ack() {
        let mut rig = Rig::new(test_options());
        let link = rig.link(0);
        link.open();
        rig.pump();

        let (reply_tx, _reply_rx) = oneshot::channel();
        rig.connection.authenticate(json!({"user": "a"}), reply_tx);

        link.frame(build_message(Topic::Connection, Action::Ack, &[]));
        rig.pump();
        assert_eq!(rig.connection.state(), ConnectionState::Authenticating);
        assert!(rig
            .link(0)
            .sent_frames()
            .iter()
            .any(|f| f.starts_with("A\u{1f}REQ\u{1f}")));
    }

    #[test]
    fn auth_ack_carries_login_data() {
        let mut rig = Rig::new(test_options());
        let link = rig.open_to_awaiting_auth();

        let (reply_tx, mut reply_rx) = oneshot::channel();
        rig.connection.authenticate(json!({"user": "a"}), reply_tx);
        link.frame(build_message(Topic::Auth, Action::Ack, &[r#"{"id":7}"#]));
        rig.pump();

        assert_eq!(
            reply_rx.try_recv().unwrap().unwrap(),
            Some(json!({"id": 7}))
        );
    }

    #[test]
    fn auth_error_returns_to_awaiting_authentication() {
        let mut rig = Rig::new(test_options());
        let link = rig.open_to_awaiting_auth();

        let (reply_tx, mut reply_rx) = oneshot::channel();
        rig.connection.authenticate(json!({"user": "a"}), reply_tx);
        link.frame(build_message(
            Topic::Auth,
            Action::Error,
            &["INVALID_AUTH_DATA", "nope"],
        ));
        rig.pump();

        assert_eq!(
            rig.connection.state(),
            ConnectionState::AwaitingAuthentication
        );
        assert!(matches!(
            reply_rx.try_recv().unwrap(),
            Err(ClientError::AuthenticationRejected(_))
        ));
    }

    #[test]
    fn too_many_auth_attempts_is_terminal() {
        let mut rig = Rig::new(test_options());
        let link = rig.open_to_awaiting_auth();

        let (reply_tx, _reply_rx) = oneshot::channel();
        rig.connection.authenticate(json!({"user": "a"}), reply_tx);
        link.frame(build_message(
            Topic::Auth,
            Action::Error,
            &[Event::TooManyAuthAttempts.code()],
        ));
        rig.pump();
        assert_eq!(rig.connection.state(), ConnectionState::Closed);

        let (reply_tx, mut reply_rx) = oneshot::channel();
        rig.connection.authenticate(json!({"user": "a"}), reply_tx);
        assert!(matches!(
            reply_rx.try_recv().unwrap(),
            Err(ClientError::ConnectionClosed(_))
        ));
        // No reopen was attempted.
        assert_eq!(rig.connector.connect_count(), 1);
    }

    #[test]
    fn challenge_rejection_closes_permanently() {
        let mut rig = Rig::new(test_options());
        let link = rig.link(0);
        link.open();
        link.frame(build_message(Topic::Connection, Action::Rejection, &[]));
        rig.pump();

        assert_eq!(rig.connection.state(), ConnectionState::Closed);

        let (reply_tx, mut reply_rx) = oneshot::channel();
        rig.connection.authenticate(json!({}), reply_tx);
        assert!(matches!(
            reply_rx.try_recv().unwrap(),
            Err(ClientError::ConnectionClosed(_))
        ));
    }

    #[test]
    fn redirect_reopens_at_new_url_and_keeps_original() {
        let mut rig = Rig::new(test_options());
        let link = rig.link(0);
        link.open();
        link.frame(build_message(
            Topic::Connection,
            Action::Redirect,
            &["ws://other:7070/tether"],
        ));
        rig.pump();

        assert_eq!(rig.connector.connect_count(), 2);
        assert_eq!(rig.link(1).url, "ws://other:7070/tether");

        // A later transport loss reconnects to the original URL.
        rig.link(1).open();
        rig.pump();
        rig.link(1).drop_connection();
        rig.pump();
        assert_eq!(rig.connection.state(), ConnectionState::Reconnecting);
        let wake = rig.connection.next_wake().unwrap();
        rig.connection.on_wake(wake);
        assert_eq!(rig.connector.connect_count(), 3);
        assert_eq!(rig.link(2).url, "ws://server:6020/tether");
    }

    #[test]
    fn sends_conflate_into_packets() {
        let mut rig = Rig::new(test_options());
        let (link, _reply) = rig.open_to_ready();
        link.clear_sent();

        rig.connection.send_msg(Topic::Record, Action::Read, &["a"]);
        rig.connection.send_msg(Topic::Record, Action::Read, &["b"]);
        assert!(link.sent().is_empty());

        let wake = rig.connection.next_wake().unwrap();
        rig.connection.on_wake(wake);

        let packets = link.sent();
        assert_eq!(packets.len(), 1);
        assert_eq!(
            packets[0],
            "R\u{1f}R\u{1f}a\u{1e}R\u{1f}R\u{1f}b\u{1e}"
        );
    }

    #[test]
    fn queue_overflow_flushes_immediately_in_chunks() {
        let mut rig = Rig::new(test_options());
        let (link, _reply) = rig.open_to_ready();
        link.clear_sent();

        for name in ["a", "b", "c", "d", "e"] {
            rig.connection.send_msg(Topic::Record, Action::Read, &[name]);
        }

        // Five frames exceeded the cap of four: one full packet plus the
        // remainder, written without waiting for the send delay.
        let packets = link.sent();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].matches(MESSAGE_SEPARATOR).count(), 4);
        assert_eq!(packets[1].matches(MESSAGE_SEPARATOR).count(), 1);
    }

    #[test]
    fn nothing_is_written_before_open() {
        let mut rig = Rig::new(test_options());
        let link = rig.open_to_awaiting_auth();
        link.clear_sent();

        rig.connection.send_msg(Topic::Record, Action::Read, &["a"]);
        if let Some(wake) = rig.connection.next_wake() {
            rig.connection.on_wake(wake);
        }
        assert!(link.sent().is_empty());

        // The queue flushes the moment authentication completes.
        let (reply_tx, _reply_rx) = oneshot::channel();
        rig.connection.authenticate(json!({}), reply_tx);
        link.frame(build_message(Topic::Auth, Action::Ack, &[]));
        rig.pump();
        assert!(link
            .sent()
            .iter()
            .any(|p| p.contains("R\u{1f}R\u{1f}a")));
    }

    #[test]
    fn heartbeat_pings_and_times_out() {
        let mut rig = Rig::new(test_options());
        let (link, _reply) = rig.open_to_ready();
        link.clear_sent();

        let opened = Instant::now();
        // First tick: still fresh, a PING goes out.
        rig.connection
            .on_wake(opened + Duration::from_millis(100));
        assert!(link
            .sent_frames()
            .iter()
            .any(|f| f == &format!("C\u{1f}PI{}", MESSAGE_SEPARATOR)));

        // Silence past the tolerance: the endpoint is closed and the
        // machine goes into reconnect.
        rig.connection
            .on_wake(opened + Duration::from_millis(500));
        rig.pump();
        assert_eq!(rig.connection.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn inbound_ping_answers_pong() {
        let mut rig = Rig::new(test_options());
        let (link, _reply) = rig.open_to_ready();
        link.clear_sent();

        link.frame(build_message(Topic::Connection, Action::Ping, &[]));
        rig.pump();
        assert_eq!(
            link.sent_frames(),
            vec![format!("C\u{1f}PO{}", MESSAGE_SEPARATOR)]
        );
    }

    #[test]
    fn reconnect_backs_off_linearly_and_caps() {
        let options = test_options();
        let increment = options.reconnect_interval_increment;
        let cap = options.max_reconnect_interval;
        let mut rig = Rig::new(options);
        let link = rig.link(0);
        link.open();
        rig.pump();

        // Attempt 1.
        let before = Instant::now();
        link.drop_connection();
        rig.pump();
        let first = rig.connection.next_wake().unwrap();
        assert!(first >= before + increment);
        rig.connection.on_wake(first);
        assert_eq!(rig.connector.connect_count(), 2);

        // Attempt 2 backs off further; attempt 3 hits the cap.
        let before = Instant::now();
        rig.link(1).fail("refused");
        rig.pump();
        let second = rig.connection.next_wake().unwrap();
        assert!(second >= before + increment * 2);
        rig.connection.on_wake(second);

        let before = Instant::now();
        rig.link(2).fail("refused");
        rig.pump();
        let third = rig.connection.next_wake().unwrap();
        assert!(third >= before + cap);
        assert!(third < before + increment * 3);
    }

    #[test]
    fn reconnect_attempt_counter_resets_on_open() {
        let mut rig = Rig::new(test_options());
        rig.link(0).open();
        rig.pump();

        rig.link(0).drop_connection();
        rig.pump();
        rig.connection.on_wake(rig.connection.next_wake().unwrap());
        rig.link(1).open();
        rig.pump();
        assert_eq!(rig.connection.state(), ConnectionState::AwaitingConnection);

        // The next loss schedules with the initial backoff again.
        let before = Instant::now();
        rig.link(1).drop_connection();
        rig.pump();
        let wake = rig.connection.next_wake().unwrap();
        assert!(wake < before + Duration::from_millis(100));
    }

    #[test]
    fn reconnect_gives_up_after_max_attempts() {
        let mut rig = Rig::new(test_options());
        rig.link(0).open();
        rig.pump();
        rig.link(0).drop_connection();
        rig.pump();

        for i in 1..=3 {
            rig.connection.on_wake(rig.connection.next_wake().unwrap());
            rig.link(i).fail("refused");
            rig.pump();
        }

        assert_eq!(rig.connection.state(), ConnectionState::Closed);
        assert!(rig.connection.next_wake().is_none());
        let mut saw_give_up = false;
        while let Ok(event) = rig.events.try_recv() {
            if event == ClientEvent::MaxReconnectionAttemptsReached {
                saw_give_up = true;
            }
        }
        assert!(saw_give_up);
    }

    #[test]
    fn deliberate_close_does_not_reconnect() {
        let mut rig = Rig::new(test_options());
        let (_link, _reply) = rig.open_to_ready();

        rig.connection.close();
        rig.pump();
        assert_eq!(rig.connection.state(), ConnectionState::Closed);
        assert!(rig.connection.next_wake().is_none());
        assert_eq!(rig.connector.connect_count(), 1);
    }

    #[test]
    fn record_topic_messages_are_routed_out() {
        let mut rig = Rig::new(test_options());
        let (link, _reply) = rig.open_to_ready();

        link.frame(build_message(
            Topic::Record,
            Action::Update,
            &["user/a", "1-x", "{}"],
        ));
        let routed = rig.pump();
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].topic, Topic::Record);
        assert_eq!(routed[0].data[0], "user/a");
    }

    #[test]
    fn malformed_frames_surface_on_error_channel() {
        let mut rig = Rig::new(test_options());
        let (link, _reply) = rig.open_to_ready();
        rig.state_changes();

        link.frame("garbage\u{1f}frame\u{1e}");
        let routed = rig.pump();
        assert!(routed.is_empty());
        let mut saw_parse_error = false;
        while let Ok(event) = rig.events.try_recv() {
            if let ClientEvent::Error { event, .. } = event {
                if event == Event::MessageParseError.code() {
                    saw_parse_error = true;
                }
            }
        }
        assert!(saw_parse_error);
    }

    #[test]
    fn large_inbound_batches_drain_across_wakes() {
        let mut options = test_options();
        options.max_messages_per_read = 3;
        let mut rig = Rig::new(options);
        let (link, _reply) = rig.open_to_ready();

        let payload: String = (0..8)
            .map(|i| {
                build_message(
                    Topic::Record,
                    Action::Update,
                    &[&format!("r{}", i), "1-a", "{}"],
                )
            })
            .collect();
        link.frame(payload);

        let first = rig.pump();
        assert_eq!(first.len(), 3);
        // Leftovers request an immediate wake.
        let wake = rig.connection.next_wake().unwrap();
        let second = rig.connection.on_wake(wake);
        assert_eq!(second.len(), 3);
        let third = rig.connection.on_wake(rig.connection.next_wake().unwrap());
        assert_eq!(third.len(), 2);
    }
}
