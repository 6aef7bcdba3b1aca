//! Version tokens for optimistic record versioning.
//!
//! Every accepted write stamps a record with a new token, which is
//! essential for deterministic conflict resolution across clients.
//!
//! Ordering rules:
//! 1. Higher counter wins
//! 2. If counters are equal, the lexicographically greater nonce wins
//!
//! This ensures a total order across concurrent writers, so every client
//! resolves a version race the same way without coordination.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A record version of the wire form `"<counter>-<nonce>"`.
///
/// The counter increases monotonically with each local write; the nonce is
/// a random 128-bit identifier that breaks ties between concurrent writes
/// with the same counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionToken {
    counter: u64,
    nonce: String,
}

impl VersionToken {
    /// Create a token from its parts.
    pub fn new(counter: u64, nonce: impl Into<String>) -> Self {
        Self {
            counter,
            nonce: nonce.into(),
        }
    }

    /// The monotonically increasing write counter.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// The tie-breaking nonce.
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// The successor token: counter + 1 with a fresh random nonce.
    ///
    /// A successor is strictly greater than every token with this counter,
    /// regardless of nonce.
    pub fn next(&self) -> VersionToken {
        VersionToken::new(self.counter + 1, fresh_nonce())
    }
}

/// A random identifier with 128 bits of entropy.
fn fresh_nonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl Ord for VersionToken {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.counter.cmp(&other.counter) {
            Ordering::Equal => self.nonce.cmp(&other.nonce),
            other => other,
        }
    }
}

impl PartialOrd for VersionToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.counter, self.nonce)
    }
}

impl FromStr for VersionToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (counter, nonce) = s
            .split_once('-')
            .ok_or_else(|| Error::InvalidVersion(s.to_string()))?;
        if nonce.is_empty() {
            return Err(Error::InvalidVersion(s.to_string()));
        }
        let counter = counter
            .parse::<u64>()
            .map_err(|_| Error::InvalidVersion(s.to_string()))?;
        Ok(VersionToken::new(counter, nonce))
    }
}
