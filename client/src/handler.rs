//! The record registry: reference-counted acquisition, idle pruning, and
//! routing of inbound record-topic traffic.

use std::collections::HashMap;

use tokio::sync::broadcast;

use tether_engine::{Action, ConnectionState, Event, Message, Topic};

use crate::connection::Connection;
use crate::error::{ClientError, Result};
use crate::events::ClientEvent;
use crate::record::Record;

/// A registered listener pattern. Destruction is two-phase: `unlisten`
/// sends the teardown and the entry is dropped when the server acks it.
struct Listener {
    destroy_pending: bool,
}

pub(crate) struct RecordHandler {
    /// Name to position in `records`.
    indices: HashMap<String, usize>,
    /// The records themselves, in an order that allows swap-and-pop
    /// removal during pruning.
    records: Vec<Record>,
    listeners: HashMap<String, Listener>,
    events: broadcast::Sender<ClientEvent>,
}

impl RecordHandler {
    pub(crate) fn new(events: broadcast::Sender<ClientEvent>) -> Self {
        Self {
            indices: HashMap::new(),
            records: Vec::new(),
            listeners: HashMap::new(),
            events,
        }
    }

    /// Look up or lazily create the record for `name`, bumping its usage
    /// count either way.
    pub(crate) fn get_record(&mut self, name: &str, connection: &mut Connection) -> &mut Record {
        if !self.indices.contains_key(name) {
            let record = Record::new(name.to_string(), connection);
            self.indices.insert(name.to_string(), self.records.len());
            self.records.push(record);
        }
        let index = self.indices[name];
        let record = &mut self.records[index];
        record.retain();
        record
    }

    pub(crate) fn record_mut(&mut self, name: &str) -> Option<&mut Record> {
        let index = *self.indices.get(name)?;
        Some(&mut self.records[index])
    }

    pub(crate) fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Destroy every record that is ready and no longer referenced.
    pub(crate) fn prune(&mut self, connection: &mut Connection) {
        let mut index = 0;
        while index < self.records.len() {
            if self.records[index].eligible_for_destruction() {
                let mut record = self.records.swap_remove(index);
                self.indices.remove(record.name());
                record.destroy(connection, false);
                if let Some(moved) = self.records.get(index) {
                    self.indices.insert(moved.name().to_string(), index);
                }
            } else {
                index += 1;
            }
        }
    }

    /// Fan a connection state change out to every record. A terminal
    /// close empties the registry; the records were destroyed silently.
    pub(crate) fn on_connection_state(
        &mut self,
        state: ConnectionState,
        connection: &mut Connection,
    ) {
        for record in &mut self.records {
            record.on_connection_state(state, connection);
        }
        if state == ConnectionState::Closed {
            self.records.clear();
            self.indices.clear();
            self.listeners.clear();
        }
    }

    /// Route one inbound record-topic message.
    pub(crate) fn on_message(&mut self, message: Message, connection: &mut Connection) {
        match message.action {
            Action::Update => {
                let (Some(name), Some(version), Some(payload)) = (
                    message.data.first(),
                    message.data.get(1),
                    message.data.get(2),
                ) else {
                    self.emit_error(Event::MessageParseError, "incomplete update frame");
                    return;
                };
                let name = name.clone();
                match self.record_mut(&name) {
                    Some(record) => {
                        if let Err(e) = record.on_update(version, payload, connection) {
                            tracing::warn!(record = %name, "bad update: {}", e);
                            self.emit_error(Event::MessageParseError, &e.to_string());
                        }
                    }
                    None => self.emit_error(Event::UnsolicitedMessage, &name),
                }
            }
            Action::SubscriptionHasProvider => {
                let (Some(name), Some(flag)) = (message.data.first(), message.data.get(1)) else {
                    self.emit_error(Event::MessageParseError, "incomplete provider frame");
                    return;
                };
                let name = name.clone();
                match self.record_mut(&name) {
                    Some(record) => {
                        if let Err(e) = record.on_has_provider(flag) {
                            self.emit_error(Event::MessageParseError, &e.to_string());
                        }
                    }
                    None => self.emit_error(Event::UnsolicitedMessage, &name),
                }
            }
            Action::Ack => self.on_ack(&message),
            Action::Error => {
                let code = message.data.first().map(String::as_str).unwrap_or("");
                if code == Event::MessageDenied.code() {
                    tracing::debug!("record operation denied: {}", message.data.join(" "));
                } else {
                    let _ = self.events.send(ClientEvent::Error {
                        topic: Topic::Record,
                        event: code.to_string(),
                        message: message.data.join(" "),
                    });
                }
            }
            other => {
                tracing::warn!(action = %other, "unexpected action on record topic");
            }
        }
    }

    /// Register a listener for `pattern` and announce it to the server.
    /// Only a single listener per pattern is permitted.
    pub(crate) fn listen(&mut self, pattern: &str, connection: &mut Connection) -> Result<()> {
        if self.listeners.contains_key(pattern) {
            self.emit_error(Event::ListenerExists, pattern);
            return Err(ClientError::ListenerExists(pattern.to_string()));
        }
        self.listeners.insert(
            pattern.to_string(),
            Listener {
                destroy_pending: false,
            },
        );
        connection.send_msg(Topic::Record, Action::Listen, &[pattern]);
        Ok(())
    }

    /// Begin tearing a listener down; the entry survives until the
    /// server acknowledges the unlisten.
    pub(crate) fn unlisten(&mut self, pattern: &str, connection: &mut Connection) -> Result<()> {
        match self.listeners.get_mut(pattern) {
            Some(listener) if !listener.destroy_pending => {
                listener.destroy_pending = true;
                connection.send_msg(Topic::Record, Action::Unlisten, &[pattern]);
                Ok(())
            }
            _ => {
                self.emit_error(Event::NotListening, pattern);
                Err(ClientError::NotListening(pattern.to_string()))
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn on_ack(&mut self, message: &Message) {
        let acked = message.data.first().map(String::as_str).unwrap_or("");
        let name = message.data.get(1).map(String::as_str).unwrap_or("");
        match Action::from_code(acked) {
            Ok(Action::Unlisten) => {
                if self
                    .listeners
                    .get(name)
                    .is_some_and(|listener| listener.destroy_pending)
                {
                    self.listeners.remove(name);
                }
            }
            Ok(Action::Listen) | Ok(Action::Unsubscribe) => {
                tracing::trace!(name = %name, acked = %acked, "ack received");
            }
            _ => {
                tracing::warn!(acked = %acked, "unexpected ack on record topic");
            }
        }
    }

    fn emit_error(&self, event: Event, message: &str) {
        tracing::warn!(event = %event, "{}", message);
        let _ = self.events.send(ClientEvent::Error {
            topic: Topic::Record,
            event: event.code().to_string(),
            message: message.to_string(),
        });
    }
}
