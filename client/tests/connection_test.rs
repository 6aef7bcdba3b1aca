//! End-to-end connection lifecycle tests against the mock transport.

mod common;

use common::{connect, connect_open, open_link, wait_for, wait_for_frame, wait_for_state, wait_for_value};
use serde_json::json;
use tether_client::ClientEvent;
use tether_engine::{build_message, Action, ConnectionState, Topic};

#[tokio::test(start_paused = true)]
async fn handshake_walks_the_full_state_sequence() {
    let (client, _connector, link) = connect().await;
    let mut events = client.events();

    link.open();
    link.frame(build_message(Topic::Connection, Action::Challenge, &[]));
    wait_for_frame(&link, |f| f.starts_with("C\u{1f}CHR\u{1f}")).await;
    link.frame(build_message(Topic::Connection, Action::Ack, &[]));

    let login = {
        let client = client.clone();
        tokio::spawn(async move { client.login(json!({"user": "a"})).await })
    };
    wait_for_frame(&link, |f| f.starts_with("A\u{1f}REQ\u{1f}")).await;
    link.frame(build_message(Topic::Auth, Action::Ack, &[]));

    assert_eq!(login.await.unwrap().unwrap(), None);
    assert_eq!(
        client.connection_state().await.unwrap(),
        ConnectionState::Open
    );

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::ConnectionStateChanged(state) = event {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![
            ConnectionState::AwaitingConnection,
            ConnectionState::Challenging,
            ConnectionState::AwaitingAuthentication,
            ConnectionState::Authenticating,
            ConnectionState::Open,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn login_resolves_with_server_data() {
    let (client, _connector, link) = connect().await;
    link.open();
    link.frame(build_message(Topic::Connection, Action::Ack, &[]));

    let login = {
        let client = client.clone();
        tokio::spawn(async move { client.login(json!({"user": "a"})).await })
    };
    wait_for_frame(&link, |f| f.starts_with("A\u{1f}REQ\u{1f}")).await;
    link.frame(build_message(
        Topic::Auth,
        Action::Ack,
        &[r#"{"role":"admin"}"#],
    ));

    assert_eq!(
        login.await.unwrap().unwrap(),
        Some(json!({"role": "admin"}))
    );
}

#[tokio::test(start_paused = true)]
async fn transport_loss_reconnects_and_resubscribes_records() {
    let (client, connector, link) = connect_open().await;

    let record = client.record("user/a").unwrap();
    common::answer_read(&link, "user/a", "1-srv", r#"{"x":1}"#).await;
    record.when_ready().await.unwrap();

    // Lose the transport; the client schedules a reconnect.
    link.drop_connection();
    wait_for(|| {
        (connector.connect_count() == 2).then_some(())
    })
    .await;

    // The replacement endpoint comes up and the handshake replays; the
    // stored credentials re-authenticate automatically.
    let link2 = connector.link(1);
    link2.open();
    link2.frame(build_message(Topic::Connection, Action::Ack, &[]));
    wait_for_frame(&link2, |f| f.starts_with("A\u{1f}REQ\u{1f}")).await;
    link2.frame(build_message(Topic::Auth, Action::Ack, &[]));

    // Reaching OPEN re-reads every live record.
    wait_for_frame(&link2, |f| f == "R\u{1f}R\u{1f}user/a\u{1e}").await;

    // The record is served fresh state and stays usable.
    link2.frame(build_message(
        Topic::Record,
        Action::Update,
        &["user/a", "2-srv", r#"{"x":2}"#],
    ));
    wait_for_value(&record, "x", &json!(2)).await;

    record.discard();
}

#[tokio::test(start_paused = true)]
async fn reconnect_exhaustion_emits_and_closes() {
    let (client, connector, link) = connect_open().await;
    let mut events = client.events();

    link.drop_connection();
    // Refuse every reconnect attempt (default cap is five).
    for i in 1..=5 {
        wait_for(|| (connector.connect_count() == i + 1).then_some(())).await;
        connector.link(i).fail("connection refused");
    }

    wait_for_state(&client, ConnectionState::Closed).await;

    let mut reached_cap = false;
    while let Ok(event) = events.try_recv() {
        if event == ClientEvent::MaxReconnectionAttemptsReached {
            reached_cap = true;
        }
    }
    assert!(reached_cap);
    assert_eq!(connector.connect_count(), 6);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_silence_triggers_reconnect() {
    let (client, connector, link) = connect_open().await;

    // PINGs go out while the server stays silent; after the tolerance the
    // client tears the endpoint down and reconnects.
    wait_for_frame(&link, |f| f == "C\u{1f}PI\u{1e}").await;
    wait_for(|| (connector.connect_count() == 2).then_some(())).await;

    drop(client);
}

#[tokio::test(start_paused = true)]
async fn deliberate_close_stays_closed() {
    let (client, connector, link) = connect_open().await;

    client.close();
    wait_for_state(&client, ConnectionState::Closed).await;

    // Give any stray reconnect timer a chance to fire; none may.
    tokio::time::sleep(std::time::Duration::from_secs(600)).await;
    assert_eq!(connector.connect_count(), 1);
    drop(link);
}

#[tokio::test(start_paused = true)]
async fn http_urls_are_rejected() {
    let connector = std::sync::Arc::new(tether_client::transport::mock::MockConnector::new());
    let result = tether_client::Client::connect_with_connector(
        "http://server:6020",
        tether_client::ClientOptions::default(),
        connector,
    );
    assert!(result.is_err());
}

#[tokio::test(start_paused = true)]
async fn redirect_is_followed_before_reconnect_logic() {
    let (client, connector, link) = connect().await;
    link.open();
    link.frame(build_message(
        Topic::Connection,
        Action::Redirect,
        &["ws://other:9999/tether"],
    ));

    wait_for(|| (connector.connect_count() == 2).then_some(())).await;
    assert_eq!(connector.link(1).url, "ws://other:9999/tether");

    // The redirected endpoint completes the handshake as usual.
    open_link(&client, &connector.link(1)).await;
    assert_eq!(
        client.connection_state().await.unwrap(),
        ConnectionState::Open
    );
}
