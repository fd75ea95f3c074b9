//! In-process mock upstream for tests
//!
//! A minimal stand-in for the real upstream: it serves the auth
//! handshake, `subscribe_events`, `get_states` and `call_service`, and
//! lets tests push state-change events and force disconnects.
//!
//! `turn_on`/`turn_off` service calls mutate the server's state table
//! and are echoed back as `state_changed` events attributed to the
//! calling token's user id, which is what the engine's loop suppression
//! keys on.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, warn};

use haven_core::{Context, State};

/// Poll `condition` until it holds or a 3 second deadline passes.
///
/// The runtime is event-driven end to end, so tests assert by polling
/// observable state rather than sleeping fixed amounts.
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

struct ClientConn {
    generation: u64,
    tx: mpsc::UnboundedSender<Message>,
    kill: Arc<Notify>,
    user_id: String,
    /// Id of the client's most recent event subscription; event frames
    /// are correlated to it.
    sub_id: Arc<AtomicU64>,
}

struct ServerInner {
    users: HashMap<String, String>,
    states: Mutex<HashMap<String, State>>,
    conn: Mutex<Option<ClientConn>>,
    subscriptions: AtomicUsize,
    generation: AtomicU64,
}

/// Mock upstream server
pub struct Server {
    inner: Arc<ServerInner>,
    addr: SocketAddr,
    accept_task: tokio::task::JoinHandle<()>,
}

impl Server {
    /// Start a server on an ephemeral local port. `users` maps valid
    /// access tokens to the user id their actions are attributed to.
    pub async fn start(users: HashMap<String, String>) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let inner = Arc::new(ServerInner {
            users,
            states: Mutex::new(HashMap::new()),
            conn: Mutex::new(None),
            subscriptions: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
        });

        let accept_inner = inner.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let conn_inner = accept_inner.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(conn_inner, stream).await {
                                debug!(error = %err, "mock server connection ended");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "mock server accept failed");
                        return;
                    }
                }
            }
        });

        Ok(Self {
            inner,
            addr,
            accept_task,
        })
    }

    /// Address clients should dial, e.g. "127.0.0.1:41234"
    pub fn listen_address(&self) -> String {
        self.addr.to_string()
    }

    /// Number of event subscriptions on the current session
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.load(Ordering::SeqCst)
    }

    /// Seed a state without emitting an event (visible via get_states)
    pub fn set_state(&self, state: State) {
        self.inner
            .states
            .lock()
            .unwrap()
            .insert(state.entity_id.clone(), state);
    }

    /// Push a state-change event with no user attribution (external)
    pub fn send_event(&self, new_state: State) {
        self.inner.push_state_change(new_state, Context::new());
    }

    /// Push a state-change event attributed to the given user
    pub fn send_event_from_user(&self, new_state: State, user_id: impl Into<String>) {
        self.inner
            .push_state_change(new_state, Context::with_user(user_id));
    }

    /// Drop the current client session, as a network failure would
    pub fn disconnect_client(&self) {
        if let Some(conn) = self.inner.conn.lock().unwrap().take() {
            conn.kill.notify_one();
        }
        self.inner.subscriptions.store(0, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.accept_task.abort();
        self.disconnect_client();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

impl ServerInner {
    fn push_state_change(&self, new_state: State, context: Context) {
        let old_state = {
            let mut states = self.states.lock().unwrap();
            states.insert(new_state.entity_id.clone(), new_state.clone())
        };

        let conn = self.conn.lock().unwrap();
        let Some(conn) = conn.as_ref() else {
            debug!("no client connected, dropping event");
            return;
        };

        let frame = json!({
            "id": conn.sub_id.load(Ordering::SeqCst).max(1),
            "type": "event",
            "event": {
                "event_type": "state_changed",
                "data": {
                    "entity_id": new_state.entity_id.clone(),
                    "old_state": old_state,
                    "new_state": new_state,
                },
                "context": context,
                "time_fired": chrono::Utc::now(),
                "origin": "LOCAL",
            },
        });
        let _ = conn.tx.send(Message::Text(frame.to_string()));
    }

    /// Mutate state for turn_on/turn_off calls and echo the change back
    /// attributed to the calling user.
    fn apply_service(&self, service: &str, service_data: &Value, user_id: &str) {
        let value = match service {
            "turn_on" => "on",
            "turn_off" => "off",
            _ => return,
        };

        let entity_ids: Vec<String> = match service_data.get("entity_id") {
            Some(Value::String(id)) => vec![id.clone()],
            Some(Value::Array(ids)) => ids
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => return,
        };

        for entity_id in entity_ids {
            let mut state = self
                .states
                .lock()
                .unwrap()
                .get(&entity_id)
                .cloned()
                .unwrap_or_else(|| State::new(entity_id.clone(), ""));
            state.state = value.to_string();

            if service == "turn_on" {
                if let Value::Object(data) = service_data {
                    for (key, val) in data {
                        if key != "entity_id" {
                            state.attributes.insert(key.clone(), val.clone());
                        }
                    }
                }
            }

            self.push_state_change(state, Context::with_user(user_id));
        }
    }
}

async fn handle_connection(inner: Arc<ServerInner>, stream: TcpStream) -> std::io::Result<()> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let (mut write, mut read) = ws.split();

    let _ = write
        .send(Message::Text(
            json!({"type": "auth_required", "ha_version": "2024.6.0"}).to_string(),
        ))
        .await;

    // Auth phase: expect exactly one auth frame.
    let user_id = loop {
        let Some(Ok(msg)) = read.next().await else {
            return Ok(());
        };
        let Message::Text(text) = msg else { continue };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };

        if frame.get("type").and_then(Value::as_str) == Some("auth") {
            let token = frame.get("access_token").and_then(Value::as_str);
            match token.and_then(|t| inner.users.get(t)) {
                Some(user_id) => {
                    let _ = write
                        .send(Message::Text(
                            json!({"type": "auth_ok", "ha_version": "2024.6.0"}).to_string(),
                        ))
                        .await;
                    break user_id.clone();
                }
                None => {
                    let _ = write
                        .send(Message::Text(
                            json!({"type": "auth_invalid", "message": "invalid token"})
                                .to_string(),
                        ))
                        .await;
                    return Ok(());
                }
            }
        }
    };

    let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let kill = Arc::new(Notify::new());
    let sub_id = Arc::new(AtomicU64::new(0));

    // One live client at a time: a new session replaces the old one.
    {
        let mut conn = inner.conn.lock().unwrap();
        if let Some(old) = conn.take() {
            old.kill.notify_one();
        }
        inner.subscriptions.store(0, Ordering::SeqCst);
        *conn = Some(ClientConn {
            generation,
            tx: tx.clone(),
            kill: kill.clone(),
            user_id: user_id.clone(),
            sub_id: sub_id.clone(),
        });
    }

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = kill.notified() => break,
            msg = read.next() => {
                let Some(Ok(Message::Text(text))) = msg else { break };
                let Ok(frame) = serde_json::from_str::<Value>(&text) else { continue };
                handle_command(&inner, &tx, &sub_id, &user_id, &frame);
            }
        }
    }

    writer.abort();

    // Deregister, unless a newer session already replaced us.
    let mut conn = inner.conn.lock().unwrap();
    if conn.as_ref().map(|c| c.generation) == Some(generation) {
        *conn = None;
        inner.subscriptions.store(0, Ordering::SeqCst);
    }

    Ok(())
}

fn handle_command(
    inner: &Arc<ServerInner>,
    tx: &mpsc::UnboundedSender<Message>,
    sub_id: &Arc<AtomicU64>,
    user_id: &str,
    frame: &Value,
) {
    let id = frame.get("id").and_then(Value::as_u64).unwrap_or(0);
    let msg_type = frame.get("type").and_then(Value::as_str).unwrap_or("");

    let send_result = |result: Value| {
        let _ = tx.send(Message::Text(
            json!({"id": id, "type": "result", "success": true, "result": result}).to_string(),
        ));
    };

    match msg_type {
        "subscribe_events" => {
            sub_id.store(id, Ordering::SeqCst);
            inner.subscriptions.fetch_add(1, Ordering::SeqCst);
            send_result(Value::Null);
        }
        "get_states" => {
            let states: Vec<State> = inner.states.lock().unwrap().values().cloned().collect();
            send_result(serde_json::to_value(states).unwrap_or_default());
        }
        "call_service" => {
            send_result(json!({"context": {"id": Context::new().id}}));
            let service = frame.get("service").and_then(Value::as_str).unwrap_or("");
            let service_data = frame.get("service_data").cloned().unwrap_or(Value::Null);
            inner.apply_service(service, &service_data, user_id);
        }
        "ping" => {
            let _ = tx.send(Message::Text(
                json!({"id": id, "type": "pong"}).to_string(),
            ));
        }
        other => {
            warn!(msg_type = %other, "mock server: unhandled command");
            let _ = tx.send(Message::Text(
                json!({
                    "id": id,
                    "type": "result",
                    "success": false,
                    "error": {"code": "unknown_command", "message": "unknown command"},
                })
                .to_string(),
            ));
        }
    }
}
