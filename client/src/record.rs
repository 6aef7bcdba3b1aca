//! The per-record state machine.
//!
//! A record is created on first acquisition, immediately requests the
//! server's snapshot with a READ, and becomes ready when the first UPDATE
//! arrives. Writes made before that point are queued and replayed on top
//! of the snapshot. Once ready, local writes mint strictly increasing
//! versions and remote updates are reconciled last-version-wins.

use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot};

use tether_engine::path::{self, Applied};
use tether_engine::{message, Action, ConnectionState, Topic, VersionToken};

use crate::connection::Connection;
use crate::error::{ClientError, Result};
use crate::events::RecordEvent;

/// A write made before the record was ready, waiting to be replayed on
/// top of the server's initial snapshot. A `None` path replaces the root.
struct PatchQueueEntry {
    path: Option<String>,
    data: Value,
}

struct SubscriptionEntry {
    id: u64,
    path: String,
    tx: mpsc::UnboundedSender<Value>,
}

pub(crate) struct Record {
    name: String,
    data: Value,
    version: Option<VersionToken>,
    has_provider: bool,
    is_ready: bool,
    is_subscribed: bool,
    is_destroyed: bool,
    usages: usize,
    patch_queue: Vec<PatchQueueEntry>,
    subscriptions: Vec<SubscriptionEntry>,
    ready_waiters: Vec<oneshot::Sender<Result<()>>>,
    events: broadcast::Sender<RecordEvent>,
    next_subscription: u64,
}

impl Record {
    /// Create the record and request its current state from the server.
    pub(crate) fn new(name: String, connection: &mut Connection) -> Self {
        let (events, _) = broadcast::channel(16);
        let mut record = Self {
            name,
            data: Value::Object(Map::new()),
            version: None,
            has_provider: false,
            is_ready: false,
            is_subscribed: false,
            is_destroyed: false,
            usages: 0,
            patch_queue: Vec::new(),
            subscriptions: Vec::new(),
            ready_waiters: Vec::new(),
            events,
            next_subscription: 0,
        };
        record.send_read(connection);
        record
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.is_ready
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.is_destroyed
    }

    pub(crate) fn has_provider(&self) -> bool {
        self.has_provider
    }

    pub(crate) fn usages(&self) -> usize {
        self.usages
    }

    pub(crate) fn version(&self) -> Option<&VersionToken> {
        self.version.as_ref()
    }

    /// Another handle was taken out on this record.
    pub(crate) fn retain(&mut self) {
        self.usages += 1;
    }

    /// A handle was released. Destruction is the registry's job.
    pub(crate) fn discard(&mut self) {
        self.usages = self.usages.saturating_sub(1);
    }

    pub(crate) fn eligible_for_destruction(&self) -> bool {
        self.usages == 0 && self.is_ready && !self.is_destroyed
    }

    /// Read the value at `path` from the local snapshot.
    pub(crate) fn get(&self, path: &str) -> Result<Option<Value>> {
        self.ensure_alive()?;
        Ok(path::get(&self.data, path)?.cloned())
    }

    /// Write `value` at `path`; the empty path replaces the root, which
    /// must be an object.
    ///
    /// Before the record is ready the write lands locally and is queued
    /// for replay on top of the server snapshot; a root write clears the
    /// queue first. A write that leaves the data structurally unchanged
    /// is a complete no-op: no notifications, no outbound update.
    pub(crate) fn set(&mut self, path: &str, value: Value, connection: &mut Connection) -> Result<()> {
        self.ensure_alive()?;
        let is_root = path::tokenize(path).is_empty();
        if is_root && !value.is_object() {
            return Err(ClientError::RootNotObject);
        }

        if !self.is_ready {
            if is_root {
                self.patch_queue.clear();
                self.patch_queue.push(PatchQueueEntry {
                    path: None,
                    data: value.clone(),
                });
            } else {
                self.patch_queue.push(PatchQueueEntry {
                    path: Some(path.to_string()),
                    data: value.clone(),
                });
            }
        }

        let Applied::Changed(next) = path::set(&self.data, path, value) else {
            return Ok(());
        };
        let previous = std::mem::replace(&mut self.data, next);
        self.broadcast_changes(&previous);
        if self.is_ready {
            self.dispatch_update(connection);
        }
        Ok(())
    }

    /// Register interest in the value at `path`. With `trigger_now`, the
    /// current local value is delivered immediately, even before the
    /// server snapshot arrives.
    pub(crate) fn subscribe(
        &mut self,
        path: &str,
        trigger_now: bool,
    ) -> Result<(u64, mpsc::UnboundedReceiver<Value>)> {
        self.ensure_alive()?;
        let (tx, rx) = mpsc::unbounded_channel();
        if trigger_now {
            let current = path::get(&self.data, path)?
                .cloned()
                .unwrap_or(Value::Null);
            let _ = tx.send(current);
        }
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.subscriptions.push(SubscriptionEntry {
            id,
            path: path.to_string(),
            tx,
        });
        Ok((id, rx))
    }

    pub(crate) fn unsubscribe(&mut self, id: u64) {
        self.subscriptions.retain(|sub| sub.id != id);
    }

    /// Resolve `reply` on the first ready, or reject it if the record is
    /// destroyed first. An already-ready record resolves immediately.
    pub(crate) fn when_ready(&mut self, reply: oneshot::Sender<Result<()>>) {
        if self.is_destroyed {
            let _ = reply.send(Err(ClientError::RecordDestroyed(self.name.clone())));
        } else if self.is_ready {
            let _ = reply.send(Ok(()));
        } else {
            self.ready_waiters.push(reply);
        }
    }

    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<RecordEvent> {
        self.events.subscribe()
    }

    /// Handle an inbound UPDATE: the initial snapshot if the record is
    /// not ready yet, otherwise a remote write to reconcile.
    pub(crate) fn on_update(
        &mut self,
        version: &str,
        payload: &str,
        connection: &mut Connection,
    ) -> Result<()> {
        let incoming: VersionToken = version.parse()?;
        let incoming_data: Value = serde_json::from_str(payload)
            .map_err(|e| tether_engine::Error::InvalidJson(e.to_string()))?;

        if !self.is_ready {
            self.adopt_snapshot(incoming, incoming_data, connection);
            return Ok(());
        }

        // Duplicates and reordered echoes of our own writes arrive with
        // versions at or below the current one; drop them.
        if self
            .version
            .as_ref()
            .is_some_and(|current| incoming <= *current)
        {
            tracing::debug!(record = %self.name, version = %incoming, "dropping stale update");
            return Ok(());
        }

        self.version = Some(incoming);
        if let Applied::Changed(next) = path::patch(&self.data, incoming_data) {
            let previous = std::mem::replace(&mut self.data, next);
            self.broadcast_changes(&previous);
        }
        Ok(())
    }

    /// Handle an inbound SUBSCRIPTION_HAS_PROVIDER notification.
    pub(crate) fn on_has_provider(&mut self, flag: &str) -> Result<()> {
        let flag = message::parse_typed_bool(flag)?;
        if flag != self.has_provider {
            self.has_provider = flag;
            let _ = self.events.send(RecordEvent::HasProviderChanged(flag));
        }
        Ok(())
    }

    /// React to connection lifecycle changes.
    pub(crate) fn on_connection_state(
        &mut self,
        state: ConnectionState,
        connection: &mut Connection,
    ) {
        match state {
            ConnectionState::Open if !self.is_subscribed => self.send_read(connection),
            ConnectionState::Reconnecting => self.is_subscribed = false,
            ConnectionState::Closed => self.destroy(connection, true),
            _ => {}
        }
    }

    /// Tear the record down. Idempotent. `silent` skips the UNSUBSCRIBE,
    /// for when the connection is already gone.
    pub(crate) fn destroy(&mut self, connection: &mut Connection, silent: bool) {
        if self.is_destroyed {
            return;
        }
        if !silent && self.is_subscribed {
            connection.send_msg(Topic::Record, Action::Unsubscribe, &[&self.name]);
        }
        self.is_destroyed = true;
        self.is_ready = false;
        self.is_subscribed = false;
        self.patch_queue.clear();
        self.subscriptions.clear();
        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.send(Err(ClientError::RecordDestroyed(self.name.clone())));
        }
        let _ = self.events.send(RecordEvent::Destroyed);
        tracing::debug!(record = %self.name, "record destroyed");
    }

    fn send_read(&mut self, connection: &mut Connection) {
        connection.send_msg(Topic::Record, Action::Read, &[&self.name]);
        self.is_subscribed = true;
    }

    /// Adopt the server's initial snapshot, replaying queued writes on
    /// top. If the replay changed anything, the server is brought up to
    /// date with a follow-up update.
    fn adopt_snapshot(&mut self, version: VersionToken, snapshot: Value, connection: &mut Connection) {
        let mut merged = snapshot.clone();
        for entry in &self.patch_queue {
            let path = entry.path.as_deref().unwrap_or("");
            merged = path::set(&merged, path, entry.data.clone()).into_value(&merged);
        }
        let diverged = merged != snapshot;
        self.patch_queue.clear();
        self.version = Some(version);
        self.is_ready = true;

        let previous = std::mem::replace(&mut self.data, merged);
        self.broadcast_changes(&previous);

        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        let _ = self.events.send(RecordEvent::Ready);

        if diverged {
            self.dispatch_update(connection);
        }
    }

    /// Mint the next version and send the full state to the server.
    fn dispatch_update(&mut self, connection: &mut Connection) {
        let Some(current) = self.version.clone() else {
            return;
        };
        let next = current.next();
        let payload = self.data.to_string();
        connection.send_msg(
            Topic::Record,
            Action::Update,
            &[&self.name, &next.to_string(), &payload, &current.to_string()],
        );
        self.version = Some(next);
    }

    /// Notify subscribers whose path saw an actual change. The data
    /// pointer has already been swapped, so a subscriber reading back
    /// through its handle observes the new state. Subscribers whose
    /// receiver is gone are dropped along the way.
    fn broadcast_changes(&mut self, previous: &Value) {
        let data = &self.data;
        self.subscriptions.retain(|sub| {
            let old_value = path::get(previous, &sub.path).ok().flatten();
            let new_value = path::get(data, &sub.path).ok().flatten();
            if old_value == new_value {
                return !sub.tx.is_closed();
            }
            sub.tx
                .send(new_value.cloned().unwrap_or(Value::Null))
                .is_ok()
        });
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed {
            Err(ClientError::RecordDestroyed(self.name.clone()))
        } else {
            Ok(())
        }
    }
}
