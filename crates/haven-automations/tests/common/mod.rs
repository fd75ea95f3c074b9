//! Shared harness for automation integration tests

use std::collections::HashMap;

use haven_engine::{Config, Connection, HomeAssistantConfig};
use haven_ws::testing::Server;

pub const TEST_TOKEN: &str = "test-token";
pub const TEST_USER_ID: &str = "d8e8fca2dc0f896fd7cb4cb0031ba249";

pub async fn new_client_server() -> (Connection, Server) {
    let server = Server::start(HashMap::from([(
        TEST_TOKEN.to_string(),
        TEST_USER_ID.to_string(),
    )]))
    .await
    .expect("mock server should bind");

    let config = Config {
        home_assistant: HomeAssistantConfig {
            host: server.listen_address(),
            token: TEST_TOKEN.to_string(),
            user_id: TEST_USER_ID.to_string(),
        },
        database_path: Some(":memory:".to_string()),
        reconnect_interval: Some(0.1),
        ..Default::default()
    };

    let conn = Connection::new(config).expect("connection should build");
    (conn, server)
}
