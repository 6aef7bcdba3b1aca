//! Client configuration.

use std::time::Duration;

/// Tunables for a [`crate::Client`].
///
/// The defaults suit a typical deployment; construct with struct-update
/// syntax to override individual knobs:
///
/// ```
/// use std::time::Duration;
/// use tether_client::ClientOptions;
///
/// let options = ClientOptions {
///     heartbeat_interval: Duration::from_secs(10),
///     ..ClientOptions::default()
/// };
/// assert_eq!(options.max_reconnect_attempts, 5);
/// ```
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Period of outbound PINGs and of the staleness check. A connection
    /// that hears no heartbeat for twice this interval is considered dead.
    pub heartbeat_interval: Duration,
    /// Linear backoff step between reconnect attempts.
    pub reconnect_interval_increment: Duration,
    /// Cap on the reconnect backoff delay.
    pub max_reconnect_interval: Duration,
    /// Give up reconnecting after this many failed attempts.
    pub max_reconnect_attempts: u32,
    /// Outbound conflation cap: a queue longer than this flushes at once,
    /// and each transport write carries at most this many frames.
    pub max_messages_per_packet: usize,
    /// How long outbound frames may sit in the queue before a flush.
    pub send_delay: Duration,
    /// Inbound frames processed per scheduler wake; the remainder is
    /// picked up on the next wake so one large batch cannot starve
    /// timers and commands.
    pub max_messages_per_read: usize,
    /// How often idle, ready records are swept out of the registry.
    pub prune_interval: Duration,
    /// Default URL path appended to host-only server URLs.
    pub path: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            reconnect_interval_increment: Duration::from_secs(4),
            max_reconnect_interval: Duration::from_secs(180),
            max_reconnect_attempts: 5,
            max_messages_per_packet: 100,
            send_delay: Duration::from_millis(10),
            max_messages_per_read: 100,
            prune_interval: Duration::from_secs(10),
            path: "/tether".to_string(),
        }
    }
}
