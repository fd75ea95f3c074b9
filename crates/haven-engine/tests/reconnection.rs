//! Reconnection supervisor tests: resubscription, resync, attempt
//! accounting and shutdown behavior

mod common;

use std::time::Duration;

use common::{new_client_server, start_server, test_config};
use haven_core::State;
use haven_engine::{Connection, Entity, EntityLike, Light, LightLike};
use haven_ws::testing::wait_for;

#[tokio::test]
async fn basic_reconnection() {
    let (conn, server) = new_client_server().await;

    let entity = Entity::new("test.entity");
    conn.register_entity(entity.clone()).await;
    conn.start().await.unwrap();

    server.send_event(State::new("test.entity", "on"));
    wait_for("initial state update", || entity.state().is_on()).await;

    server.disconnect_client();
    wait_for("reconnection", || conn.reconnect_attempts() >= 1).await;
    wait_for("subscription restored", || server.subscription_count() >= 1).await;

    server.send_event(State::new("test.entity", "off"));
    wait_for("state update after reconnection", || entity.state().is_off()).await;

    conn.close().await;
}

#[tokio::test]
async fn service_calls_fail_during_disconnection() {
    let (conn, server) = new_client_server().await;

    let light = Light::new("test.light");
    conn.register_entity(light.clone()).await;
    conn.start().await.unwrap();

    light.turn_on().await.expect("service call while connected");

    server.disconnect_client();
    wait_for("disconnect detection", || !conn.is_connected()).await;

    let err = light.turn_on().await.expect_err("session is down");
    assert!(err.is_not_connected());

    wait_for("reconnection", || conn.reconnect_attempts() >= 1).await;
    wait_for("subscription restored", || server.subscription_count() >= 1).await;

    light.turn_on().await.expect("service call after reconnect");

    conn.close().await;
}

#[tokio::test]
async fn state_resyncs_after_reconnect() {
    let (conn, server) = new_client_server().await;

    let entity = Entity::new("test.entity");
    conn.register_entity(entity.clone()).await;
    conn.start().await.unwrap();

    server.send_event(State::new("test.entity", "on"));
    wait_for("state before disconnect", || entity.state().is_on()).await;

    server.disconnect_client();

    // Upstream state moves while we are away; only the post-reconnect
    // resync can pick it up.
    server.set_state(State::new("test.entity", "moved_while_away"));

    wait_for("reconnection", || conn.reconnect_attempts() >= 1).await;
    wait_for("resynced state", || {
        entity.state().state == "moved_while_away"
    })
    .await;

    conn.close().await;
}

#[tokio::test]
async fn multiple_disconnect_reconnect_cycles() {
    let (conn, server) = new_client_server().await;

    let entity = Entity::new("test.entity");
    conn.register_entity(entity.clone()).await;
    conn.start().await.unwrap();

    for cycle in 1..=3 {
        server.disconnect_client();
        wait_for("reconnection", || conn.reconnect_attempts() >= cycle).await;
        wait_for("subscription restored", || server.subscription_count() >= 1).await;

        let value = format!("cycle{cycle}");
        server.send_event(State::new("test.entity", value.clone()));
        wait_for("event in cycle", || entity.state().state == value).await;
    }

    assert_eq!(conn.reconnect_attempts(), 3);

    conn.reset_reconnect_attempts();
    assert_eq!(conn.reconnect_attempts(), 0);

    server.disconnect_client();
    wait_for("reconnection after reset", || conn.reconnect_attempts() == 1).await;

    conn.close().await;
}

#[tokio::test]
async fn shutdown_during_reconnection_is_prompt_and_final() {
    let server = start_server().await;
    let mut config = test_config(&server);
    // Slow retry so close() races a pending reconnect sleep.
    config.reconnect_interval = Some(1.0);
    let conn = Connection::new(config).unwrap();
    conn.register_entity(Entity::new("test.entity")).await;
    conn.start().await.unwrap();

    server.disconnect_client();
    wait_for("disconnect detection", || !conn.is_connected()).await;

    let attempts_before = conn.reconnect_attempts();

    tokio::time::timeout(Duration::from_secs(2), conn.close())
        .await
        .expect("close should cancel the pending reconnect sleep");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        conn.reconnect_attempts(),
        attempts_before,
        "no reconnect attempts after close"
    );
}
