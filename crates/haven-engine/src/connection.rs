//! The event core
//!
//! `Connection` owns the wire client, the sqlite store and the
//! entity/automation registries. It serializes the hot path: every
//! incoming state change updates the entity snapshot, queues a
//! persistence upsert, and dispatches automations in registration
//! order, all under one exclusive lock. A supervisor task drives
//! reconnection and post-reconnect resync.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use haven_core::{metrics as metric_types, STATE_CHANGED};
use haven_store::{
    EntityRow, LogService, MetricsRecorder, PruneTarget, Pruner, Store, DEFAULT_PRUNE_INTERVAL,
};
use haven_ws::{CallServiceRequest, Client, ClientConfig, EventMessage, ResultFrame};

use crate::automation::Automation;
use crate::collect::EntityCollection;
use crate::config::Config;
use crate::entity::{entity_kind, EntityLike, ServiceHandle};
use crate::error::EngineResult;

#[derive(Default)]
struct Registry {
    entities: HashMap<String, Arc<dyn EntityLike>>,
    /// Per entity id, in registration order. Duplicates allowed.
    automations: HashMap<String, Vec<Arc<dyn Automation>>>,
}

struct ConnectionInner {
    config: Config,
    client: Client,
    store: Store,
    metrics: MetricsRecorder,
    log: LogService,
    /// The core mutex: state updates and automation dispatch happen
    /// under the write guard, so automations observe events in upstream
    /// order against a consistent snapshot.
    registry: RwLock<Registry>,
    reconnect_attempts: AtomicUsize,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
    pruners: Mutex<Vec<Pruner>>,
}

/// The runtime: wire client + registries + persistence. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(config: Config) -> EngineResult<Self> {
        Self::with_logger(config, LogService::new())
    }

    /// Use an explicit log service; anything it buffered before this
    /// call is flushed to the database.
    pub fn with_logger(config: Config, log: LogService) -> EngineResult<Self> {
        let store = Store::open(config.database_path())?;
        log.attach(store.clone());

        let metrics = MetricsRecorder::new(store.clone()).with_enabled(config.metrics_enabled);
        let client = Client::new(ClientConfig {
            host: config.home_assistant.host.clone(),
            token: config.home_assistant.token.clone(),
        });
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                config,
                client,
                store,
                metrics,
                log,
                registry: RwLock::new(Registry::default()),
                reconnect_attempts: AtomicUsize::new(0),
                shutdown,
                supervisor: Mutex::new(None),
                pruners: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Register entities: bind them to this connection and index them
    /// by id. Later registrations of the same id overwrite. Entities
    /// that are also automations are registered as automations too.
    pub async fn register_entities(
        &self,
        entities: impl IntoIterator<Item = Arc<dyn EntityLike>>,
    ) {
        let mut registry = self.inner.registry.write().await;
        for entity in entities {
            self.register_entity_locked(&mut registry, entity, false);
        }
    }

    pub async fn register_entity(&self, entity: Arc<dyn EntityLike>) {
        self.register_entities([entity]).await;
    }

    /// Walk a collection and register everything it holds. Idempotent
    /// on id: entities already registered are skipped, so repeated
    /// walks do not double-register automations.
    pub async fn register_collection(&self, collection: &dyn EntityCollection) {
        let mut registry = self.inner.registry.write().await;
        for entity in collection.collect_entities() {
            self.register_entity_locked(&mut registry, entity, true);
        }
    }

    fn register_entity_locked(
        &self,
        registry: &mut Registry,
        entity: Arc<dyn EntityLike>,
        skip_existing: bool,
    ) {
        let id = entity.id();
        if skip_existing && registry.entities.contains_key(&id) {
            return;
        }

        info!(entity_id = %id, "registering entity");
        entity.bind(ServiceHandle::new(
            self.inner.client.clone(),
            self.inner.log.clone(),
        ));
        registry.entities.insert(id, entity.clone());

        if let Some(automation) = entity.as_automation() {
            Self::register_automation_locked(registry, automation);
        }
    }

    /// Register automations against the entity ids they watch
    pub async fn register_automations(
        &self,
        automations: impl IntoIterator<Item = Arc<dyn Automation>>,
    ) {
        let mut registry = self.inner.registry.write().await;
        for automation in automations {
            Self::register_automation_locked(&mut registry, automation);
        }
    }

    pub async fn register_automation(&self, automation: Arc<dyn Automation>) {
        self.register_automations([automation]).await;
    }

    fn register_automation_locked(registry: &mut Registry, automation: Arc<dyn Automation>) {
        info!(name = %automation.name(), "registering automation");
        for entity_id in automation.triggers() {
            if !registry.entities.contains_key(&entity_id) {
                debug!(entity_id = %entity_id, "automation watches an unregistered entity");
            }
            registry
                .automations
                .entry(entity_id)
                .or_default()
                .push(automation.clone());
        }
    }

    /// Connect, subscribe to state changes, run the initial sync, then
    /// hand over to the reconnection supervisor.
    pub async fn start(&self) -> EngineResult<()> {
        self.inner.client.connect().await?;

        let weak = Arc::downgrade(&self.inner);
        let handler: haven_ws::EventHandler = Arc::new(move |event| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    inner.on_state_change(event).await;
                }
            })
        });
        self.inner.client.subscribe_events(STATE_CHANGED, handler).await?;

        self.inner.sync_states().await?;

        self.spawn_supervisor();
        self.spawn_pruners();

        Ok(())
    }

    fn spawn_supervisor(&self) {
        let Some(mut disconnects) = self.inner.client.take_disconnect_events() else {
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    signal = disconnects.recv() => {
                        if signal.is_none() {
                            return;
                        }
                    }
                }

                let Some(inner) = weak.upgrade() else { return };
                warn!("connection lost, reconnecting");

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(inner.config.reconnect_interval()) => {}
                    }

                    let attempt = async {
                        inner.client.connect().await?;
                        inner.client.resubscribe_all().await?;
                        inner.sync_states().await
                    };

                    tokio::select! {
                        _ = shutdown.changed() => return,
                        result = attempt => match result {
                            Ok(()) => {
                                let attempts =
                                    inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                                info!(attempts, "reconnected to upstream");
                                break;
                            }
                            Err(err) => {
                                warn!(error = %err, "reconnect attempt failed");
                            }
                        }
                    }
                }
            }
        });

        *self.inner.supervisor.lock().unwrap() = Some(handle);
    }

    fn spawn_pruners(&self) {
        let mut pruners = self.inner.pruners.lock().unwrap();
        if !pruners.is_empty() {
            return;
        }
        for target in [PruneTarget::Metrics, PruneTarget::Logs] {
            pruners.push(Pruner::spawn_default(
                self.inner.store.clone(),
                target,
                DEFAULT_PRUNE_INTERVAL,
            ));
        }
    }

    /// Pass-through to the wire client
    pub async fn call_service(&self, request: CallServiceRequest) -> EngineResult<ResultFrame> {
        Ok(self.inner.client.call_service(request).await?)
    }

    /// Whether the wire session is currently live
    pub fn is_connected(&self) -> bool {
        self.inner.client.connected()
    }

    /// Successful reconnects since start (or the last reset)
    pub fn reconnect_attempts(&self) -> usize {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn reset_reconnect_attempts(&self) {
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn logger(&self) -> &LogService {
        &self.inner.log
    }

    /// Tear everything down: supervisor first (no further reconnect
    /// attempts), then the wire session, then the write queue after a
    /// drain. Idempotent.
    pub async fn close(&self) {
        let _ = self.inner.shutdown.send(true);

        let supervisor = self.inner.supervisor.lock().unwrap().take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        self.inner.client.close().await;
        self.inner.pruners.lock().unwrap().clear();
        self.inner.store.close().await;
        info!("connection closed");
    }
}

impl ConnectionInner {
    /// Bulk-fetch upstream states and apply them to registered
    /// entities. Unregistered ids are ignored.
    async fn sync_states(&self) -> EngineResult<()> {
        let started = Instant::now();
        let states = self.client.get_states().await?;

        let registry = self.registry.read().await;
        for state in states {
            let Some(entity) = registry.entities.get(&state.entity_id) else {
                continue;
            };
            debug!(entity_id = %state.entity_id, state = %state.state, "setting initial state");
            entity.set_state(state);
        }

        info!(duration = ?started.elapsed(), "initial state sync complete");
        Ok(())
    }

    /// The hot path. Holds the core write lock from lookup through the
    /// last automation, so events are fully processed in arrival order.
    async fn on_state_change(&self, event: EventMessage) {
        let started = Instant::now();
        let entity_id = event.data.entity_id.clone();

        let registry = self.registry.write().await;

        let Some(entity) = registry.entities.get(&entity_id).cloned() else {
            debug!(entity_id = %entity_id, "state change for unregistered entity");
            self.record_tick(started, &entity_id);
            return;
        };

        debug!(entity_id = %entity_id, new_state = ?event.data.new_state, "state changed");

        if let Some(new_state) = event.data.new_state.clone() {
            entity.set_state(new_state);
        }

        self.store.enqueue_entity_upsert(EntityRow {
            id: entity_id.clone(),
            kind: entity_kind(&entity_id),
            state: event
                .data
                .new_state
                .as_ref()
                .and_then(|s| serde_json::to_value(s).ok()),
        });

        let automations = registry
            .automations
            .get(&entity_id)
            .cloned()
            .unwrap_or_default();

        // Evaluated is recorded for every automation on this id, even
        // when loop suppression skips the invocation below.
        for automation in &automations {
            self.metrics.record_counter(
                metric_types::AUTOMATION_EVALUATED,
                &entity_id,
                &automation.name(),
            );
        }

        // Loop suppression: state changes this process caused update
        // state and persistence but never re-trigger automations.
        let own_user = &self.config.home_assistant.user_id;
        if !own_user.is_empty() && event.context.is_user(own_user) {
            debug!(entity_id = %entity_id, "skipping automations for self-originated event");
            self.record_tick(started, &entity_id);
            return;
        }

        for automation in &automations {
            let name = automation.name();
            info!(automation = %name, entity_id = %entity_id, "running automation");
            self.metrics
                .record_counter(metric_types::AUTOMATION_TRIGGERED, &entity_id, &name);

            // Per-automation isolation: one panicking action must not
            // take down the dispatcher or its siblings.
            let action = AssertUnwindSafe(automation.action(entity.clone())).catch_unwind();
            if action.await.is_err() {
                error!(automation = %name, entity_id = %entity_id, "automation panicked");
                self.log.error(
                    &format!("automation {name} panicked"),
                    Some(&entity_id),
                );
            }
        }

        self.record_tick(started, &entity_id);
    }

    fn record_tick(&self, started: Instant, entity_id: &str) {
        self.metrics.record_timer(
            metric_types::TICK_PROCESSING_TIME,
            started.elapsed(),
            entity_id,
            "",
        );
    }
}
