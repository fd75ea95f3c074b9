//! Entity model
//!
//! An entity is an addressable thing upstream: a stable string id plus
//! the latest state snapshot. The engine depends only on the
//! `EntityLike` capability set; domain wrappers (light, binary sensor,
//! input boolean) layer predicates and service calls on top.

use std::sync::{Arc, RwLock};

use tracing::error;

use haven_core::State;
use haven_store::LogService;
use haven_ws::{CallServiceRequest, Client, ResultFrame};

use crate::automation::Automation;
use crate::error::{EngineError, EngineResult};

/// Non-owning handle entities use to reach the connection's wire client
/// and log service. Established by `Connection::register_entities`.
#[derive(Clone)]
pub struct ServiceHandle {
    client: Client,
    log: LogService,
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle").finish_non_exhaustive()
    }
}

impl ServiceHandle {
    pub(crate) fn new(client: Client, log: LogService) -> Self {
        Self { client, log }
    }

    pub async fn call_service(&self, request: CallServiceRequest) -> EngineResult<ResultFrame> {
        Ok(self.client.call_service(request).await?)
    }

    pub fn log(&self) -> &LogService {
        &self.log
    }
}

/// The capability set the engine depends on
pub trait EntityLike: Send + Sync {
    /// Stable id, e.g. "light.kitchen"
    fn id(&self) -> String;

    /// Current state snapshot. Internally synchronized; callers never
    /// see a torn value.
    fn state(&self) -> State;

    fn set_state(&self, state: State);

    /// Bind the entity to a connection so service wrappers can reach
    /// the wire client
    fn bind(&self, handle: ServiceHandle);

    /// Entities that are also automations are registered as both
    fn as_automation(self: Arc<Self>) -> Option<Arc<dyn Automation>> {
        None
    }
}

/// Generic entity: id plus synchronized state snapshot
pub struct Entity {
    id: String,
    state: RwLock<State>,
    handle: RwLock<Option<ServiceHandle>>,
}

impl Entity {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        let id = id.into();
        Arc::new(Self {
            state: RwLock::new(State::new(id.clone(), "")),
            handle: RwLock::new(None),
            id,
        })
    }

    /// The bound service handle, or EntityNotRegistered
    pub fn service_handle(&self) -> EngineResult<ServiceHandle> {
        self.handle.read().unwrap().clone().ok_or_else(|| {
            error!(entity_id = %self.id, "entity not registered with a connection");
            EngineError::EntityNotRegistered(self.id.clone())
        })
    }
}

impl EntityLike for Entity {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn state(&self) -> State {
        self.state.read().unwrap().clone()
    }

    fn set_state(&self, state: State) {
        *self.state.write().unwrap() = state;
    }

    fn bind(&self, handle: ServiceHandle) {
        *self.handle.write().unwrap() = Some(handle);
    }
}

/// Entity kind for persistence: the domain prefix of the id
pub(crate) fn entity_kind(id: &str) -> String {
    id.split('.').next().unwrap_or(id).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_state_overwrites_snapshot() {
        let entity = Entity::new("sensor.hall");
        assert_eq!(entity.state().state, "");

        entity.set_state(State::new("sensor.hall", "on"));
        assert!(entity.state().is_on());

        entity.set_state(State::new("sensor.hall", "off"));
        assert!(entity.state().is_off());
    }

    #[test]
    fn unbound_entity_has_no_service_handle() {
        let entity = Entity::new("sensor.hall");
        let err = entity.service_handle().unwrap_err();
        assert!(matches!(err, EngineError::EntityNotRegistered(id) if id == "sensor.hall"));
    }

    #[test]
    fn kind_is_domain_prefix() {
        assert_eq!(entity_kind("light.kitchen"), "light");
        assert_eq!(entity_kind("no_dot"), "no_dot");
    }
}
