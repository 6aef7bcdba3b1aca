//! # Tether Engine
//!
//! The deterministic core of the Tether record-sync client.
//!
//! This crate holds the pure logic the connection layer builds on: JSON
//! path addressing with change detection, totally ordered version tokens,
//! and the text wire framing. The same inputs always produce the same
//! outputs.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine has no knowledge of sockets, timers, or tasks
//! - **Deterministic**: every merge and comparison is reproducible
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Paths
//!
//! Records hold arbitrary JSON. Paths like `"pets[0].name"` address slots
//! inside that JSON; [`path::get`], [`path::set`], and [`path::patch`]
//! walk and rewrite trees, reporting [`path::Applied::Unchanged`] when a
//! write left the tree structurally identical, which is what lets callers
//! skip notifications and network traffic for no-op writes.
//!
//! ### Version Tokens
//!
//! Every record version is a [`VersionToken`] of the form
//! `"<counter>-<nonce>"`. Tokens are totally ordered: higher counter
//! wins, and equal counters tie-break on the lexicographically greater
//! nonce, so concurrent writers resolve races identically.
//!
//! ### Framing
//!
//! Frames are plain text: topic and action codes plus data fields joined
//! by U+001F, with U+001E terminating each message. One transport payload
//! may carry many frames; [`message::parse_messages`] decodes them all.
//!
//! ## Quick Start
//!
//! ```rust
//! use tether_engine::path::{self, Applied};
//! use tether_engine::VersionToken;
//! use serde_json::json;
//!
//! // Address and rewrite a JSON tree.
//! let data = json!({"pets": [{"name": "Ruffus"}]});
//! assert_eq!(
//!     path::get(&data, "pets[0].name").unwrap(),
//!     Some(&json!("Ruffus"))
//! );
//! let updated = match path::set(&data, "pets[0].age", json!(3)) {
//!     Applied::Changed(value) => value,
//!     Applied::Unchanged => unreachable!(),
//! };
//! assert_eq!(path::get(&updated, "pets[0].age").unwrap(), Some(&json!(3)));
//!
//! // Writing the same value again reports no change.
//! assert!(path::set(&updated, "pets[0].age", json!(3)).is_unchanged());
//!
//! // Versions are totally ordered.
//! let mine: VersionToken = "2-aaa".parse().unwrap();
//! let theirs: VersionToken = "2-bbb".parse().unwrap();
//! assert!(mine < theirs);
//! ```

pub mod error;
pub mod message;
pub mod path;
pub mod version;

// Re-export main types at crate root
pub use error::Error;
pub use message::{
    build_message, parse_messages, Action, ConnectionState, Event, Message, Topic,
    FIELD_SEPARATOR, MESSAGE_SEPARATOR,
};
pub use path::Applied;
pub use version::VersionToken;

/// Type alias for clarity
pub type RecordName = String;
