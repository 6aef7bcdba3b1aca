//! Public handles onto records owned by the client core.
//!
//! Handles are thin command-channel proxies: every operation is executed
//! on the client's core task, which owns the actual record state.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::client::Command;
use crate::error::{ClientError, Result};
use crate::events::RecordEvent;

/// A reference-counted acquisition of a record.
///
/// Dropping the handle does not release the reference; call
/// [`RecordHandle::discard`] when done. Idle records are destroyed by
/// the registry's pruner once every handle has been discarded.
#[derive(Clone)]
pub struct RecordHandle {
    pub(crate) name: String,
    pub(crate) cmd_tx: mpsc::UnboundedSender<Command>,
}

impl RecordHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The record's current root value.
    pub async fn get(&self) -> Result<Value> {
        let value = self
            .request(|reply| Command::RecordGet {
                name: self.name.clone(),
                path: String::new(),
                reply,
            })
            .await??;
        Ok(value.unwrap_or(Value::Null))
    }

    /// The current value at `path`, if anything lives there.
    pub async fn get_path(&self, path: &str) -> Result<Option<Value>> {
        self.request(|reply| Command::RecordGet {
            name: self.name.clone(),
            path: path.to_string(),
            reply,
        })
        .await?
    }

    /// Replace the record's root. The value must be an object.
    pub async fn set(&self, value: Value) -> Result<()> {
        self.request(|reply| Command::RecordSet {
            name: self.name.clone(),
            path: String::new(),
            value,
            reply,
        })
        .await?
    }

    /// Write `value` at `path`.
    pub async fn set_path(&self, path: &str, value: Value) -> Result<()> {
        self.request(|reply| Command::RecordSet {
            name: self.name.clone(),
            path: path.to_string(),
            value,
            reply,
        })
        .await?
    }

    /// Subscribe to the record's root.
    pub async fn subscribe(&self, trigger_now: bool) -> Result<Subscription> {
        self.subscribe_path("", trigger_now).await
    }

    /// Subscribe to the value at `path`. With `trigger_now`, the current
    /// value is delivered as the first item.
    pub async fn subscribe_path(&self, path: &str, trigger_now: bool) -> Result<Subscription> {
        let (id, rx) = self
            .request(|reply| Command::RecordSubscribe {
                name: self.name.clone(),
                path: path.to_string(),
                trigger_now,
                reply,
            })
            .await??;
        Ok(Subscription { id, rx })
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, subscription: Subscription) -> Result<()> {
        self.command(Command::RecordUnsubscribe {
            name: self.name.clone(),
            id: subscription.id,
        })
    }

    /// Resolves once the record has its initial server state; fails with
    /// [`ClientError::RecordDestroyed`] if it is torn down first.
    pub async fn when_ready(&self) -> Result<()> {
        self.request(|reply| Command::RecordWhenReady {
            name: self.name.clone(),
            reply,
        })
        .await?
    }

    /// Whether the server reports an authoritative provider for this
    /// record.
    pub async fn has_provider(&self) -> Result<bool> {
        self.request(|reply| Command::RecordHasProvider {
            name: self.name.clone(),
            reply,
        })
        .await?
    }

    /// Lifecycle events: ready, destroyed, provider changes.
    pub async fn events(&self) -> Result<broadcast::Receiver<RecordEvent>> {
        self.request(|reply| Command::RecordEvents {
            name: self.name.clone(),
            reply,
        })
        .await?
    }

    /// Release this handle's reference. The record itself stays alive
    /// until the pruner collects it.
    pub fn discard(&self) {
        let _ = self.cmd_tx.send(Command::RecordDiscard {
            name: self.name.clone(),
        });
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply))
            .map_err(|_| ClientError::ClientShutdown)?;
        rx.await.map_err(|_| ClientError::ClientShutdown)
    }

    fn command(&self, command: Command) -> Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| ClientError::ClientShutdown)
    }
}

/// A stream of values for one subscribed path.
///
/// Dropping the receiver lazily removes the registration on the next
/// change; use [`RecordHandle::unsubscribe`] to remove it eagerly.
pub struct Subscription {
    pub(crate) id: u64,
    pub(crate) rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    /// The next value, or `None` once the record is gone.
    pub async fn next(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// A value that has already arrived, if any.
    pub fn try_next(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.rx.poll_recv(cx)
    }
}

/// A one-shot observation stream over a record's root: the current value
/// first, then every subsequent change. Dropping the stream unsubscribes
/// and releases the record handle it holds.
pub struct ObserveStream {
    name: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Value>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ObserveStream {
    pub(crate) fn new(
        name: String,
        subscription: Subscription,
        cmd_tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            name,
            id: subscription.id,
            rx: subscription.rx,
            cmd_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The next root value, or `None` once the record is gone.
    pub async fn next(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

impl Stream for ObserveStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ObserveStream {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::RecordUnsubscribe {
            name: self.name.clone(),
            id: self.id,
        });
        let _ = self.cmd_tx.send(Command::RecordDiscard {
            name: self.name.clone(),
        });
    }
}
