//! Shared harness for engine integration tests

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::collections::HashMap;

use haven_engine::{Config, Connection, HomeAssistantConfig};
use haven_ws::testing::Server;

pub const TEST_TOKEN: &str = "test-token";
pub const TEST_USER_ID: &str = "d8e8fca2dc0f896fd7cb4cb0031ba249";

pub async fn start_server() -> Server {
    Server::start(HashMap::from([(
        TEST_TOKEN.to_string(),
        TEST_USER_ID.to_string(),
    )]))
    .await
    .expect("mock server should bind")
}

pub fn test_config(server: &Server) -> Config {
    Config {
        home_assistant: HomeAssistantConfig {
            host: server.listen_address(),
            token: TEST_TOKEN.to_string(),
            user_id: TEST_USER_ID.to_string(),
        },
        database_path: Some(":memory:".to_string()),
        reconnect_interval: Some(0.1),
        ..Default::default()
    }
}

/// Mock server plus an unstarted connection pointed at it
pub async fn new_client_server() -> (Connection, Server) {
    let server = start_server().await;
    let conn = Connection::new(test_config(&server)).expect("connection should build");
    (conn, server)
}
