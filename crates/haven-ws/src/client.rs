//! Wire client
//!
//! Maintains at most one live upstream session and exposes synchronous
//! request/response (correlated by a monotonically increasing id) plus
//! asynchronous subscription callbacks.
//!
//! Frames are decoded on a dedicated reader task. Result frames wake
//! their waiting caller; event frames are forwarded over a FIFO channel
//! to a dispatch task that awaits handlers sequentially, so a handler
//! can itself issue `call_service` without deadlocking the reader.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use haven_core::State;

use crate::error::{WsError, WsResult};
use crate::types::{
    AuthFrame, CallServiceFrame, CallServiceRequest, EventMessage, GetStatesFrame, ResultFrame,
    ServerFrame, SubscribeEventsFrame,
};

/// Window for the auth handshake and for individual command replies
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type WsReader = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type WsWriter =
    futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Async callback invoked for every event of a subscribed type
pub type EventHandler = Arc<dyn Fn(EventMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Connection settings for the upstream websocket API
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Upstream address, e.g. "localhost:8123"
    pub host: String,
    /// Long-lived bearer token
    pub token: String,
}

struct Subscription {
    event_type: String,
    handler: EventHandler,
}

struct Session {
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

struct Inner {
    config: ClientConfig,
    next_id: AtomicU64,
    /// Incremented per successful connect; lets a stale reader's
    /// teardown recognize it has been superseded.
    epoch: AtomicU64,
    connected: AtomicBool,
    closed: AtomicBool,
    /// Pending requests: id -> reply channel. Dropped senders surface
    /// as NotConnected on the waiting side.
    pending: Mutex<HashMap<u64, oneshot::Sender<ResultFrame>>>,
    /// Remembered subscriptions, re-issued after reconnect
    subscriptions: Mutex<Vec<Subscription>>,
    /// Event types subscribed on the current session
    wire_subscribed: Mutex<HashSet<String>>,
    writer_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    disconnect_tx: mpsc::UnboundedSender<()>,
    disconnect_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl Inner {
    /// Tear down the session belonging to `epoch`. Safe to call from any
    /// task; only the first caller for a given epoch does anything.
    fn teardown(&self, epoch: u64, notify: bool) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        *self.writer_tx.lock().unwrap() = None;
        self.wire_subscribed.lock().unwrap().clear();

        // Dropping the reply senders fails every pending request with
        // NotConnected.
        let pending_count = {
            let mut pending = self.pending.lock().unwrap();
            let count = pending.len();
            pending.clear();
            count
        };
        if pending_count > 0 {
            debug!(pending = pending_count, "failing requests pending at disconnect");
        }

        if notify {
            let _ = self.disconnect_tx.send(());
        }
    }
}

/// Client for the upstream websocket API
///
/// Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                next_id: AtomicU64::new(1),
                epoch: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                pending: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(Vec::new()),
                wire_subscribed: Mutex::new(HashSet::new()),
                writer_tx: Mutex::new(None),
                disconnect_tx,
                disconnect_rx: Mutex::new(Some(disconnect_rx)),
                session: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Whether a session is currently live
    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Take the disconnect notification channel. Each signal means one
    /// session was lost to a transport failure. Yields `None` after the
    /// first call.
    pub fn take_disconnect_events(&self) -> Option<mpsc::UnboundedReceiver<()>> {
        self.inner.disconnect_rx.lock().unwrap().take()
    }

    /// Dial the upstream and run the auth handshake.
    ///
    /// Until this returns Ok, every other call fails with NotConnected.
    pub async fn connect(&self) -> WsResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(WsError::NotConnected);
        }

        let mut session_slot = self.inner.session.lock().await;
        if let Some(old) = session_slot.take() {
            old.reader.abort();
            old.writer.abort();
        }

        let url = format!("ws://{}/api/websocket", self.inner.config.host);
        debug!(url = %url, "dialing upstream");

        let (stream, _) = timeout(REQUEST_TIMEOUT, connect_async(&url))
            .await
            .map_err(|_| WsError::Timeout)??;
        let (mut write, mut read) = stream.split();

        self.authenticate(&mut write, &mut read).await?;
        info!(host = %self.inner.config.host, "connected and authenticated");

        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        // Writer: frames are written whole, one JSON value per message.
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Message>();
        let writer_inner = self.inner.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                if let Err(err) = write.send(msg).await {
                    warn!(error = %err, "write failed, tearing down session");
                    writer_inner.teardown(epoch, true);
                    break;
                }
            }
        });

        // Dispatcher: serialized event fan-out, fed by the reader.
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<EventMessage>();
        let dispatch_inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let handlers: Vec<EventHandler> = {
                    let subs = dispatch_inner.subscriptions.lock().unwrap();
                    subs.iter()
                        .filter(|s| s.event_type == event.event_type)
                        .map(|s| s.handler.clone())
                        .collect()
                };
                for handler in handlers {
                    handler(event.clone()).await;
                }
            }
        });

        let reader_inner = self.inner.clone();
        let reader = tokio::spawn(async move {
            read_loop(&reader_inner, &mut read, event_tx).await;
            reader_inner.teardown(epoch, true);
        });

        *self.inner.writer_tx.lock().unwrap() = Some(writer_tx);
        self.inner.connected.store(true, Ordering::SeqCst);
        *session_slot = Some(Session { reader, writer });

        Ok(())
    }

    async fn authenticate(&self, write: &mut WsWriter, read: &mut WsReader) -> WsResult<()> {
        loop {
            match read_frame(read).await? {
                ServerFrame::AuthRequired { ha_version } => {
                    debug!(ha_version = ?ha_version, "received auth challenge");
                    let auth = serde_json::to_string(&AuthFrame::new(&self.inner.config.token))
                        .map_err(|e| WsError::Protocol(e.to_string()))?;
                    write.send(Message::Text(auth)).await?;
                }
                ServerFrame::AuthOk { .. } => return Ok(()),
                ServerFrame::AuthInvalid { message } => {
                    return Err(WsError::AuthFailed(
                        message.unwrap_or_else(|| "invalid access token".to_string()),
                    ));
                }
                other => {
                    return Err(WsError::Protocol(format!(
                        "unexpected frame during auth handshake: {other:?}"
                    )));
                }
            }
        }
    }

    /// Register a handler for server-pushed events of the given type.
    ///
    /// The registration is remembered so the reconnection supervisor can
    /// re-issue it via `resubscribe_all` after a reconnect.
    pub async fn subscribe_events(
        &self,
        event_type: impl Into<String>,
        handler: EventHandler,
    ) -> WsResult<()> {
        let event_type = event_type.into();
        self.inner.subscriptions.lock().unwrap().push(Subscription {
            event_type: event_type.clone(),
            handler,
        });

        if !self.connected() {
            return Err(WsError::NotConnected);
        }
        self.send_subscribe(&event_type).await
    }

    /// Re-issue every remembered subscription on the current session
    pub async fn resubscribe_all(&self) -> WsResult<()> {
        let event_types: Vec<String> = {
            let subs = self.inner.subscriptions.lock().unwrap();
            let mut seen = HashSet::new();
            subs.iter()
                .filter(|s| seen.insert(s.event_type.clone()))
                .map(|s| s.event_type.clone())
                .collect()
        };

        for event_type in event_types {
            self.send_subscribe(&event_type).await?;
        }
        Ok(())
    }

    async fn send_subscribe(&self, event_type: &str) -> WsResult<()> {
        // One wire subscription per event type is enough; the dispatcher
        // fans out to every handler registered for it.
        if self
            .inner
            .wire_subscribed
            .lock()
            .unwrap()
            .contains(event_type)
        {
            return Ok(());
        }

        let id = self.next_id();
        let frame = serde_json::to_string(&SubscribeEventsFrame::new(id, event_type))
            .map_err(|e| WsError::Protocol(e.to_string()))?;
        self.send_command(id, frame).await?;

        self.inner
            .wire_subscribed
            .lock()
            .unwrap()
            .insert(event_type.to_string());
        debug!(event_type = %event_type, "subscribed to events");
        Ok(())
    }

    /// Blocking request/response service call
    pub async fn call_service(&self, request: CallServiceRequest) -> WsResult<ResultFrame> {
        let id = self.next_id();
        let frame = serde_json::to_string(&CallServiceFrame::new(id, &request))
            .map_err(|e| WsError::Protocol(e.to_string()))?;
        self.send_command(id, frame).await
    }

    /// One-shot bulk fetch of all upstream entity states
    pub async fn get_states(&self) -> WsResult<Vec<State>> {
        let id = self.next_id();
        let frame = serde_json::to_string(&GetStatesFrame::new(id))
            .map_err(|e| WsError::Protocol(e.to_string()))?;
        let result = self.send_command(id, frame).await?;

        let states = result.result.unwrap_or(serde_json::Value::Array(vec![]));
        serde_json::from_value(states).map_err(|e| WsError::Protocol(e.to_string()))
    }

    /// Terminate the session. Idempotent; all later calls fail with
    /// NotConnected. Does not signal the disconnect channel.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);

        let mut session_slot = self.inner.session.lock().await;
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        self.inner.teardown(epoch, false);

        if let Some(session) = session_slot.take() {
            session.reader.abort();
            session.writer.abort();
            info!("wire session closed");
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn send_command(&self, id: u64, frame: String) -> WsResult<ResultFrame> {
        let sender = self
            .inner
            .writer_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(WsError::NotConnected)?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(id, tx);

        if sender.send(Message::Text(frame)).is_err() {
            self.inner.pending.lock().unwrap().remove(&id);
            return Err(WsError::NotConnected);
        }

        let result = match timeout(REQUEST_TIMEOUT, rx).await {
            Err(_) => {
                self.inner.pending.lock().unwrap().remove(&id);
                return Err(WsError::Timeout);
            }
            // Sender dropped: the session died while we were waiting.
            Ok(Err(_)) => return Err(WsError::NotConnected),
            Ok(Ok(result)) => result,
        };

        if !result.success {
            return Err(WsError::CommandFailed {
                message: result.failure_message(),
            });
        }
        Ok(result)
    }
}

async fn read_frame(read: &mut WsReader) -> WsResult<ServerFrame> {
    loop {
        let msg = timeout(REQUEST_TIMEOUT, read.next())
            .await
            .map_err(|_| WsError::Timeout)?
            .ok_or(WsError::NotConnected)??;

        match msg {
            Message::Text(text) => {
                return serde_json::from_str(&text).map_err(|e| WsError::Protocol(e.to_string()));
            }
            Message::Close(_) => return Err(WsError::NotConnected),
            // Ping/pong and binary frames are not part of the protocol
            // we speak; skip them.
            _ => continue,
        }
    }
}

async fn read_loop(
    inner: &Arc<Inner>,
    read: &mut WsReader,
    event_tx: mpsc::UnboundedSender<EventMessage>,
) {
    while let Some(msg) = read.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                debug!("upstream closed the session");
                return;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(error = %err, "read failed, tearing down session");
                return;
            }
        };

        match serde_json::from_str::<ServerFrame>(&text) {
            Ok(ServerFrame::Result(result)) => {
                if let Some(tx) = inner.pending.lock().unwrap().remove(&result.id) {
                    let _ = tx.send(result);
                } else {
                    debug!(id = result.id, "result frame with no pending request");
                }
            }
            Ok(ServerFrame::Event(frame)) => {
                let _ = event_tx.send(frame.event);
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "undecodable frame, tearing down session");
                return;
            }
        }
    }
}
