//! # Tether Client
//!
//! A realtime record-synchronization client.
//!
//! The server stores versioned JSON documents ("records"); clients
//! subscribe to them by name over a persistent websocket and receive the
//! current value plus every subsequent update. Any client may propose a
//! new version; conflicts resolve last-version-wins with a deterministic
//! tie-break.
//!
//! All state lives on a single core task per client: the connection
//! state machine (handshake, heartbeat, conflated sends, reconnect with
//! linear backoff) and the record registry (reference counting, idle
//! pruning, re-subscription after reconnect). Public handles are thin
//! command-channel proxies, so there is no shared-memory locking in the
//! hot path.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use tether_client::{Client, ClientOptions};
//!
//! #[tokio::main]
//! async fn main() -> tether_client::Result<()> {
//!     let client = Client::connect("localhost:6020", ClientOptions::default())?;
//!     client.login(json!({"user": "alice"})).await?;
//!
//!     // Handle-based access.
//!     let record = client.record("profile/alice")?;
//!     record.when_ready().await?;
//!     record.set_path("city", json!("Berlin")).await?;
//!     let mut changes = record.subscribe_path("city", true).await?;
//!     while let Some(city) = changes.next().await {
//!         println!("city is now {city}");
//!     }
//!     record.discard();
//!
//!     // Or the one-shot convenience layer.
//!     let profile = client.get("profile/alice").await?;
//!     println!("{profile}");
//!     Ok(())
//! }
//! ```

mod client;
mod connection;
mod error;
mod events;
mod handle;
mod handler;
mod options;
mod record;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use client::Client;
pub use error::{ClientError, Result};
pub use events::{ClientEvent, RecordEvent};
pub use handle::{ObserveStream, RecordHandle, Subscription};
pub use options::ClientOptions;

// The engine types that appear in this crate's public API.
pub use tether_engine::{ConnectionState, Event, Topic, VersionToken};
