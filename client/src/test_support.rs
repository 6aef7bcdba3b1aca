//! Shared helpers for driving a connection to OPEN in unit tests.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use tether_engine::{build_message, Action, Message, Topic};

use crate::connection::Connection;
use crate::events::ClientEvent;
use crate::options::ClientOptions;
use crate::transport::mock::{MockConnector, MockLink};
use crate::transport::TransportEvent;

pub(crate) struct OpenConnection {
    pub connection: Connection,
    pub link: MockLink,
    pub transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    pub events_rx: broadcast::Receiver<ClientEvent>,
}

impl OpenConnection {
    /// A connection driven through the full handshake to OPEN, with the
    /// mock link's captured traffic cleared.
    pub(crate) fn establish() -> Self {
        let connector = MockConnector::new();
        let (events_tx, events_rx) = broadcast::channel(64);
        let (mut connection, transport_rx) = Connection::new(
            "ws://server:6020/tether".to_string(),
            Arc::new(ClientOptions::default()),
            Arc::new(connector.clone()),
            events_tx,
        );
        connection.start();

        let link = connector.link(0);
        link.open();
        link.frame(build_message(Topic::Connection, Action::Ack, &[]));
        let mut this = Self {
            connection,
            link,
            transport_rx,
            events_rx,
        };
        this.pump();

        let (reply, _discarded) = oneshot::channel();
        this.connection.authenticate(json!({}), reply);
        this.link
            .frame(build_message(Topic::Auth, Action::Ack, &[]));
        this.pump();
        this.link.clear_sent();
        this
    }

    /// Feed pending transport events through the connection, returning
    /// any routed record-topic messages.
    pub(crate) fn pump(&mut self) -> Vec<Message> {
        let mut routed = Vec::new();
        while let Ok(event) = self.transport_rx.try_recv() {
            routed.extend(self.connection.on_transport_event(event, Instant::now()));
        }
        routed
    }

    /// Run the connection's pending deadline, flushing queued sends.
    pub(crate) fn flush(&mut self) {
        if let Some(wake) = self.connection.next_wake() {
            self.connection.on_wake(wake);
        }
    }

    /// Flush and return every frame written so far.
    pub(crate) fn sent_frames(&mut self) -> Vec<String> {
        self.flush();
        self.link.sent_frames()
    }

    /// Flush pending sends and forget everything captured so far, so the
    /// next assertion sees only what follows.
    pub(crate) fn drain(&mut self) {
        self.flush();
        self.link.clear_sent();
    }
}
