//! Shared fixtures: a client wired to the mock transport, plus helpers
//! to drive the handshake and wait for asynchronous effects.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tether_client::transport::mock::{MockConnector, MockLink};
use tether_client::{Client, ClientOptions};
use tether_engine::{build_message, Action, Topic};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the tracing subscriber so failing tests show client logs.
/// Safe to call from every test; only the first call wins.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Poll `probe` until it yields, advancing (paused) time along the way.
pub async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    for _ in 0..1000 {
        if let Some(value) = probe() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached in time");
}

/// Wait until the connection reports the wanted state.
pub async fn wait_for_state(client: &Client, want: tether_engine::ConnectionState) {
    for _ in 0..1000 {
        if client.connection_state().await.unwrap() == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("connection never reached {want}");
}

/// Wait until the record's value at `path` equals `want`.
pub async fn wait_for_value(
    record: &tether_client::RecordHandle,
    path: &str,
    want: &serde_json::Value,
) {
    for _ in 0..1000 {
        if record.get_path(path).await.ok().flatten().as_ref() == Some(want) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("record never reached expected value at '{path}'");
}

/// Wait until the link has sent a frame matching `predicate`.
pub async fn wait_for_frame(link: &MockLink, predicate: impl Fn(&str) -> bool) -> String {
    wait_for(|| link.sent_frames().into_iter().find(|f| predicate(f))).await
}

/// A client whose transport is the scriptable mock.
pub async fn connect() -> (Client, MockConnector, MockLink) {
    init_logging();
    let connector = MockConnector::new();
    let client = Client::connect_with_connector(
        "ws://server:6020/tether",
        ClientOptions::default(),
        Arc::new(connector.clone()),
    )
    .unwrap();
    let link = wait_for(|| connector.last_link()).await;
    (client, connector, link)
}

/// Drive a link through challenge, ack, and authentication so the
/// connection reaches OPEN.
pub async fn open_link(client: &Client, link: &MockLink) {
    link.open();
    link.frame(build_message(Topic::Connection, Action::Challenge, &[]));
    wait_for_frame(link, |f| f.starts_with("C\u{1f}CHR\u{1f}")).await;
    link.frame(build_message(Topic::Connection, Action::Ack, &[]));

    let login = {
        let client = client.clone();
        tokio::spawn(async move { client.login(json!({"user": "test"})).await })
    };
    wait_for_frame(link, |f| f.starts_with("A\u{1f}REQ\u{1f}")).await;
    link.frame(build_message(Topic::Auth, Action::Ack, &[]));
    login.await.unwrap().unwrap();
    link.clear_sent();
}

/// A client already driven to OPEN.
pub async fn connect_open() -> (Client, MockConnector, MockLink) {
    let (client, connector, link) = connect().await;
    open_link(&client, &link).await;
    (client, connector, link)
}

/// Answer a record's READ with an initial server snapshot.
pub async fn answer_read(link: &MockLink, name: &str, version: &str, payload: &str) {
    wait_for_frame(link, |f| f == format!("R\u{1f}R\u{1f}{}\u{1e}", name)).await;
    link.frame(build_message(
        Topic::Record,
        Action::Update,
        &[name, version, payload],
    ));
}
