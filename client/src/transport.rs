//! The message-channel transport seam.
//!
//! The connection state machine talks to an [`Endpoint`] and receives
//! [`TransportEvent`]s; [`WsConnector`] is the production implementation
//! over tokio-tungstenite. The [`mock`] module provides a scriptable
//! in-memory transport for tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::ClientError;

/// Events a transport endpoint reports back to the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The channel is established and writable.
    Open,
    /// One inbound text payload (may contain several framed messages).
    Frame(String),
    /// A transport-level failure; a `Closed` event follows.
    Error(String),
    /// The channel is gone, whether deliberately or not.
    Closed,
}

/// One end of an established (or establishing) message channel.
pub trait Endpoint: Send {
    /// Queue a text payload for the wire.
    fn send(&mut self, payload: String);
    /// Close the channel; a [`TransportEvent::Closed`] will follow.
    fn close(&mut self);
    /// Whether the channel is currently established and writable.
    fn is_writable(&self) -> bool;
}

/// Factory for endpoints, injected into the client so tests can swap the
/// network out.
pub trait Connector: Send + Sync {
    /// Begin establishing a channel to `url`. Lifecycle and inbound
    /// traffic are reported on `events`; the returned endpoint is usable
    /// once [`TransportEvent::Open`] arrives.
    fn connect(
        &self,
        url: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Box<dyn Endpoint>;
}

/// Normalize a server URL.
///
/// `ws://` and `wss://` pass through, schemeless URLs (including
/// protocol-relative `//host` forms) default to `ws://`, and `http(s)://`
/// is rejected. Host-only URLs get `default_path` appended.
pub fn normalize_url(url: &str, default_path: &str) -> Result<String, ClientError> {
    let trimmed = url.trim();
    if trimmed.is_empty() || trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Err(ClientError::InvalidUrl(url.to_string()));
    }

    let with_scheme = if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        format!("ws://{}", rest)
    } else if trimmed.contains("://") {
        return Err(ClientError::InvalidUrl(url.to_string()));
    } else {
        format!("ws://{}", trimmed)
    };

    // Append the default path when the authority has no path of its own.
    let authority_start = with_scheme.find("://").map(|i| i + 3).unwrap_or(0);
    if with_scheme[authority_start..].contains('/') {
        Ok(with_scheme)
    } else {
        Ok(format!("{}{}", with_scheme, default_path))
    }
}

/// Production websocket transport.
#[derive(Debug, Default)]
pub struct WsConnector;

enum Outbound {
    Text(String),
    Close,
}

struct WsEndpoint {
    outbound: mpsc::UnboundedSender<Outbound>,
    writable: Arc<AtomicBool>,
}

impl Endpoint for WsEndpoint {
    fn send(&mut self, payload: String) {
        let _ = self.outbound.send(Outbound::Text(payload));
    }

    fn close(&mut self) {
        self.writable.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Outbound::Close);
    }

    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }
}

impl Connector for WsConnector {
    fn connect(
        &self,
        url: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Box<dyn Endpoint> {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let writable = Arc::new(AtomicBool::new(false));
        let url = url.to_string();
        let flag = writable.clone();

        tokio::spawn(async move {
            let (stream, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok(established) => established,
                Err(e) => {
                    tracing::warn!(url = %url, "websocket connect failed: {}", e);
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    let _ = events.send(TransportEvent::Closed);
                    return;
                }
            };

            flag.store(true, Ordering::SeqCst);
            let _ = events.send(TransportEvent::Open);

            let (mut sink, mut source) = stream.split();

            // Forward queued payloads onto the socket.
            let writer = tokio::spawn(async move {
                while let Some(outbound) = outbound_rx.recv().await {
                    match outbound {
                        Outbound::Text(text) => {
                            if let Err(e) = sink.send(WsMessage::Text(text)).await {
                                tracing::warn!("websocket send failed: {}", e);
                                break;
                            }
                        }
                        Outbound::Close => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            break;
                        }
                    }
                }
            });

            while let Some(next) = source.next().await {
                match next {
                    Ok(WsMessage::Text(text)) => {
                        let _ = events.send(TransportEvent::Frame(text));
                    }
                    Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {
                        tracing::warn!("binary websocket messages are not supported");
                    }
                    Err(e) => {
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
            }

            flag.store(false, Ordering::SeqCst);
            writer.abort();
            let _ = events.send(TransportEvent::Closed);
        });

        Box::new(WsEndpoint {
            outbound: outbound_tx,
            writable,
        })
    }
}

/// In-memory transport for tests: captures outbound payloads and lets the
/// test script inbound events.
pub mod mock {
    use super::*;
    use parking_lot::Mutex;

    /// A connector whose every `connect` call is recorded as a
    /// [`MockLink`] the test can drive.
    #[derive(Clone, Default)]
    pub struct MockConnector {
        links: Arc<Mutex<Vec<MockLink>>>,
    }

    impl MockConnector {
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of `connect` calls observed so far.
        pub fn connect_count(&self) -> usize {
            self.links.lock().len()
        }

        /// The link created by the i-th `connect` call.
        pub fn link(&self, i: usize) -> MockLink {
            self.links.lock()[i].clone()
        }

        /// The most recent link, if any.
        pub fn last_link(&self) -> Option<MockLink> {
            self.links.lock().last().cloned()
        }
    }

    impl Connector for MockConnector {
        fn connect(
            &self,
            url: &str,
            events: mpsc::UnboundedSender<TransportEvent>,
        ) -> Box<dyn Endpoint> {
            let link = MockLink {
                url: url.to_string(),
                events,
                sent: Arc::new(Mutex::new(Vec::new())),
                writable: Arc::new(AtomicBool::new(false)),
            };
            self.links.lock().push(link.clone());
            let endpoint = MockEndpoint {
                events: link.events.clone(),
                sent: link.sent.clone(),
                writable: link.writable.clone(),
            };
            Box::new(endpoint)
        }
    }

    /// Test-side handle to one mock endpoint.
    #[derive(Clone)]
    pub struct MockLink {
        pub url: String,
        events: mpsc::UnboundedSender<TransportEvent>,
        sent: Arc<Mutex<Vec<String>>>,
        writable: Arc<AtomicBool>,
    }

    impl MockLink {
        /// Simulate the channel opening.
        pub fn open(&self) {
            self.writable.store(true, Ordering::SeqCst);
            let _ = self.events.send(TransportEvent::Open);
        }

        /// Deliver an inbound payload.
        pub fn frame(&self, payload: impl Into<String>) {
            let _ = self.events.send(TransportEvent::Frame(payload.into()));
        }

        /// Simulate a transport failure followed by closure.
        pub fn fail(&self, error: impl Into<String>) {
            self.writable.store(false, Ordering::SeqCst);
            let _ = self.events.send(TransportEvent::Error(error.into()));
            let _ = self.events.send(TransportEvent::Closed);
        }

        /// Simulate the peer closing the channel.
        pub fn drop_connection(&self) {
            self.writable.store(false, Ordering::SeqCst);
            let _ = self.events.send(TransportEvent::Closed);
        }

        /// Everything the client wrote to this endpoint so far.
        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }

        /// All frames written so far, split out of their packets.
        pub fn sent_frames(&self) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .flat_map(|packet| {
                    packet
                        .split(tether_engine::MESSAGE_SEPARATOR)
                        .filter(|f| !f.is_empty())
                        .map(|f| format!("{}{}", f, tether_engine::MESSAGE_SEPARATOR))
                        .collect::<Vec<_>>()
                })
                .collect()
        }

        pub fn clear_sent(&self) {
            self.sent.lock().clear();
        }
    }

    struct MockEndpoint {
        events: mpsc::UnboundedSender<TransportEvent>,
        sent: Arc<Mutex<Vec<String>>>,
        writable: Arc<AtomicBool>,
    }

    impl Endpoint for MockEndpoint {
        fn send(&mut self, payload: String) {
            self.sent.lock().push(payload);
        }

        fn close(&mut self) {
            self.writable.store(false, Ordering::SeqCst);
            let _ = self.events.send(TransportEvent::Closed);
        }

        fn is_writable(&self) -> bool {
            self.writable.load(Ordering::SeqCst)
        }
    }
}
