//! The client shell and its core task.
//!
//! All connection and record state lives on one spawned task; public
//! handles send it commands over a channel and get replies over
//! oneshots, so every mutation is serialized through a single mailbox.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use tether_engine::{ConnectionState, Event, Message, Topic};

use crate::connection::{AuthOutcome, Connection};
use crate::error::{ClientError, Result};
use crate::events::{ClientEvent, RecordEvent};
use crate::handle::{ObserveStream, RecordHandle};
use crate::handler::RecordHandler;
use crate::options::ClientOptions;
use crate::transport::{normalize_url, Connector, TransportEvent, WsConnector};

/// Commands the public API sends to the core task.
pub(crate) enum Command {
    Login {
        params: Value,
        reply: oneshot::Sender<AuthOutcome>,
    },
    Close,
    ConnectionState {
        reply: oneshot::Sender<ConnectionState>,
    },
    GetRecord {
        name: String,
    },
    RecordGet {
        name: String,
        path: String,
        reply: oneshot::Sender<Result<Option<Value>>>,
    },
    RecordSet {
        name: String,
        path: String,
        value: Value,
        reply: oneshot::Sender<Result<()>>,
    },
    RecordSubscribe {
        name: String,
        path: String,
        trigger_now: bool,
        reply: oneshot::Sender<Result<(u64, mpsc::UnboundedReceiver<Value>)>>,
    },
    RecordUnsubscribe {
        name: String,
        id: u64,
    },
    RecordWhenReady {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    RecordHasProvider {
        name: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    RecordEvents {
        name: String,
        reply: oneshot::Sender<Result<broadcast::Receiver<RecordEvent>>>,
    },
    RecordDiscard {
        name: String,
    },
    Listen {
        pattern: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Unlisten {
        pattern: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// A connected Tether client.
///
/// Cheap to clone; all clones talk to the same core task. The core shuts
/// down when the last clone is dropped or after [`Client::close`].
#[derive(Clone)]
pub struct Client {
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ClientEvent>,
}

impl Client {
    /// Connect to a server over websockets. Must be called from within a
    /// tokio runtime.
    pub fn connect(url: &str, options: ClientOptions) -> Result<Client> {
        Self::connect_with_connector(url, options, Arc::new(WsConnector))
    }

    /// Connect through a custom transport; used by tests and embeddings
    /// that bring their own channel.
    pub fn connect_with_connector(
        url: &str,
        options: ClientOptions,
        connector: Arc<dyn Connector>,
    ) -> Result<Client> {
        let url = normalize_url(url, &options.path)?;
        let options = Arc::new(options);
        let (events_tx, _) = broadcast::channel(256);
        let (connection, transport_rx) =
            Connection::new(url, options.clone(), connector, events_tx.clone());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let core = Core {
            prune_at: Instant::now() + options.prune_interval,
            options,
            connection,
            records: RecordHandler::new(events_tx.clone()),
            cmd_rx,
            transport_rx,
            events: events_tx.clone(),
        };
        tokio::spawn(core.run());

        Ok(Client {
            cmd_tx,
            events: events_tx,
        })
    }

    /// Authenticate with the server. Resolves with the server's optional
    /// login data once the connection reaches OPEN.
    pub async fn login(&self, params: Value) -> Result<Option<Value>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Login { params, reply })?;
        rx.await.map_err(|_| ClientError::ClientShutdown)?
    }

    /// Deliberately close the connection. No reconnect will follow.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    /// Connection-state changes, reconnect exhaustion, and the error
    /// channel.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn connection_state(&self) -> Result<ConnectionState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ConnectionState { reply })?;
        rx.await.map_err(|_| ClientError::ClientShutdown)
    }

    /// Acquire a handle on the named record, creating it (and requesting
    /// its state from the server) on first acquisition.
    pub fn record(&self, name: &str) -> Result<RecordHandle> {
        if name.is_empty() {
            return Err(ClientError::InvalidRecordName);
        }
        self.send(Command::GetRecord {
            name: name.to_string(),
        })?;
        Ok(RecordHandle {
            name: name.to_string(),
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    /// One-shot read of a record's root value.
    pub async fn get(&self, name: &str) -> Result<Value> {
        self.with_ready_record(name, |record| async move { record.get().await })
            .await
    }

    /// One-shot read of the value at `path`.
    pub async fn get_path(&self, name: &str, path: &str) -> Result<Option<Value>> {
        let path = path.to_string();
        self.with_ready_record(name, |record| async move { record.get_path(&path).await })
            .await
    }

    /// One-shot root replacement.
    pub async fn set(&self, name: &str, value: Value) -> Result<()> {
        self.with_ready_record(name, |record| async move { record.set(value).await })
            .await
    }

    /// One-shot write at `path`.
    pub async fn set_path(&self, name: &str, path: &str, value: Value) -> Result<()> {
        let path = path.to_string();
        self.with_ready_record(name, |record| async move {
            record.set_path(&path, value).await
        })
        .await
    }

    /// Read-modify-write on a record's root. The updater runs on the
    /// caller's task; a panic there propagates to the caller and leaves
    /// the record untouched.
    pub async fn update<F>(&self, name: &str, updater: F) -> Result<()>
    where
        F: FnOnce(Value) -> Value,
    {
        self.with_ready_record(name, |record| async move {
            let current = record.get().await?;
            record.set(updater(current)).await
        })
        .await
    }

    /// Read-modify-write on the value at `path`.
    pub async fn update_path<F>(&self, name: &str, path: &str, updater: F) -> Result<()>
    where
        F: FnOnce(Option<Value>) -> Value,
    {
        let path = path.to_string();
        self.with_ready_record(name, |record| async move {
            let current = record.get_path(&path).await?;
            record.set_path(&path, updater(current)).await
        })
        .await
    }

    /// Observe a record's root: the current value, then every change.
    /// The handle acquired for the observation is released when the
    /// stream is dropped.
    pub async fn observe(&self, name: &str) -> Result<ObserveStream> {
        let handle = self.record(name)?;
        match handle.subscribe(true).await {
            Ok(subscription) => Ok(ObserveStream::new(
                handle.name().to_string(),
                subscription,
                self.cmd_tx.clone(),
            )),
            Err(e) => {
                handle.discard();
                Err(e)
            }
        }
    }

    /// Register a listener for a record-name pattern.
    pub async fn listen(&self, pattern: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Listen {
            pattern: pattern.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| ClientError::ClientShutdown)?
    }

    /// Tear a listener down.
    pub async fn unlisten(&self, pattern: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unlisten {
            pattern: pattern.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| ClientError::ClientShutdown)?
    }

    /// Acquire, await ready, run the operation, and always release the
    /// handle again, even when the operation failed.
    async fn with_ready_record<T, Fut>(
        &self,
        name: &str,
        op: impl FnOnce(RecordHandle) -> Fut,
    ) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        let handle = self.record(name)?;
        let guard = handle.clone();
        let result = match handle.when_ready().await {
            Ok(()) => op(handle).await,
            Err(e) => Err(e),
        };
        guard.discard();
        result
    }

    fn send(&self, command: Command) -> Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| ClientError::ClientShutdown)
    }
}

/// The single task that owns all connection and record state.
struct Core {
    options: Arc<ClientOptions>,
    connection: Connection,
    records: RecordHandler,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    events: broadcast::Sender<ClientEvent>,
    prune_at: Instant,
}

impl Core {
    async fn run(mut self) {
        self.connection.start();
        loop {
            let wake = self.next_wake();
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        // Every client handle is gone; shut down.
                        self.connection.close();
                        break;
                    }
                },
                event = self.transport_rx.recv() => {
                    if let Some(event) = event {
                        self.on_transport(event);
                    }
                }
                _ = tokio::time::sleep_until(wake) => self.on_wake(Instant::now()),
            }
        }
    }

    fn next_wake(&self) -> Instant {
        match self.connection.next_wake() {
            Some(wake) => wake.min(self.prune_at),
            None => self.prune_at,
        }
    }

    fn on_transport(&mut self, event: TransportEvent) {
        let before = self.connection.state();
        let routed = self.connection.on_transport_event(event, Instant::now());
        self.after_connection_step(before, routed);
    }

    fn on_wake(&mut self, now: Instant) {
        if now >= self.prune_at {
            self.records.prune(&mut self.connection);
            self.prune_at = now + self.options.prune_interval;
        }
        let before = self.connection.state();
        let routed = self.connection.on_wake(now);
        self.after_connection_step(before, routed);
    }

    /// Records react to state changes before routed messages apply, so a
    /// reconnect's re-READ precedes the updates that follow it.
    fn after_connection_step(&mut self, before: ConnectionState, routed: Vec<Message>) {
        let after = self.connection.state();
        if after != before {
            self.records.on_connection_state(after, &mut self.connection);
        }
        for message in routed {
            self.route(message);
        }
    }

    fn route(&mut self, message: Message) {
        match message.topic {
            Topic::Record => self.records.on_message(message, &mut self.connection),
            Topic::Error => {
                let event = message
                    .data
                    .first()
                    .cloned()
                    .unwrap_or_else(|| Event::ConnectionError.code().to_string());
                let _ = self.events.send(ClientEvent::Error {
                    topic: Topic::Error,
                    event,
                    message: message.data.join(" "),
                });
            }
            _ => {
                tracing::warn!(topic = %message.topic, "unroutable message topic");
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Login { params, reply } => {
                self.connection.authenticate(params, reply);
            }
            Command::Close => {
                self.connection.close();
            }
            Command::ConnectionState { reply } => {
                let _ = reply.send(self.connection.state());
            }
            Command::GetRecord { name } => {
                self.records.get_record(&name, &mut self.connection);
            }
            Command::RecordGet { name, path, reply } => {
                let result = match self.records.record_mut(&name) {
                    Some(record) => record.get(&path),
                    None => Err(ClientError::RecordDestroyed(name)),
                };
                let _ = reply.send(result);
            }
            Command::RecordSet {
                name,
                path,
                value,
                reply,
            } => {
                let result = match self.records.record_mut(&name) {
                    Some(record) => record.set(&path, value, &mut self.connection),
                    None => Err(ClientError::RecordDestroyed(name)),
                };
                let _ = reply.send(result);
            }
            Command::RecordSubscribe {
                name,
                path,
                trigger_now,
                reply,
            } => {
                let result = match self.records.record_mut(&name) {
                    Some(record) => record.subscribe(&path, trigger_now),
                    None => Err(ClientError::RecordDestroyed(name)),
                };
                let _ = reply.send(result);
            }
            Command::RecordUnsubscribe { name, id } => {
                if let Some(record) = self.records.record_mut(&name) {
                    record.unsubscribe(id);
                }
            }
            Command::RecordWhenReady { name, reply } => {
                match self.records.record_mut(&name) {
                    Some(record) => record.when_ready(reply),
                    None => {
                        let _ = reply.send(Err(ClientError::RecordDestroyed(name)));
                    }
                }
            }
            Command::RecordHasProvider { name, reply } => {
                let result = match self.records.record_mut(&name) {
                    Some(record) => Ok(record.has_provider()),
                    None => Err(ClientError::RecordDestroyed(name)),
                };
                let _ = reply.send(result);
            }
            Command::RecordEvents { name, reply } => {
                let result = match self.records.record_mut(&name) {
                    Some(record) => Ok(record.subscribe_events()),
                    None => Err(ClientError::RecordDestroyed(name)),
                };
                let _ = reply.send(result);
            }
            Command::RecordDiscard { name } => {
                if let Some(record) = self.records.record_mut(&name) {
                    record.discard();
                }
            }
            Command::Listen { pattern, reply } => {
                let _ = reply.send(self.records.listen(&pattern, &mut self.connection));
            }
            Command::Unlisten { pattern, reply } => {
                let _ = reply.send(self.records.unlisten(&pattern, &mut self.connection));
            }
        }
    }
}
