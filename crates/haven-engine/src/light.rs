//! Light entities
//!
//! `Light` wraps the generic entity with the light domain's service
//! calls. `LightGroup` aggregates several lights behind the same
//! capability set so automations can drive them as one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use haven_core::State;
use haven_ws::CallServiceRequest;

use crate::entity::{Entity, EntityLike, ServiceHandle};
use crate::error::{EngineError, EngineResult};

/// Capability set automations use to drive lights
#[async_trait]
pub trait LightLike: Send + Sync {
    fn id(&self) -> String;

    fn is_on(&self) -> bool;

    /// Currently observed brightness, if any
    fn brightness(&self) -> Option<f64>;

    async fn turn_on(&self) -> EngineResult<()>;

    /// Turn on with extra attributes (brightness, color, scene attrs)
    async fn turn_on_with(&self, attrs: HashMap<String, serde_json::Value>) -> EngineResult<()>;

    async fn turn_off(&self) -> EngineResult<()>;
}

pub struct Light {
    entity: Arc<Entity>,
}

impl Light {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            entity: Entity::new(id),
        })
    }

    async fn call(&self, service: &str, attrs: HashMap<String, serde_json::Value>) -> EngineResult<()> {
        let handle = self.entity.service_handle()?;
        let id = self.entity.id();

        let mut data = HashMap::from([("entity_id".to_string(), json!([id.clone()]))]);
        data.extend(attrs);

        debug!(entity_id = %id, service, "calling light service");
        let result = handle
            .call_service(CallServiceRequest::new("light", service).with_data(data))
            .await;

        if let Err(err) = &result {
            handle
                .log()
                .error(&format!("light service call failed: {err}"), Some(&id));
        }
        result.map(|_| ())
    }
}

impl EntityLike for Light {
    fn id(&self) -> String {
        self.entity.id()
    }

    fn state(&self) -> State {
        self.entity.state()
    }

    fn set_state(&self, state: State) {
        self.entity.set_state(state);
    }

    fn bind(&self, handle: ServiceHandle) {
        self.entity.bind(handle);
    }
}

#[async_trait]
impl LightLike for Light {
    fn id(&self) -> String {
        self.entity.id()
    }

    fn is_on(&self) -> bool {
        self.entity.state().is_on()
    }

    fn brightness(&self) -> Option<f64> {
        self.entity.state().brightness()
    }

    async fn turn_on(&self) -> EngineResult<()> {
        self.call("turn_on", HashMap::new()).await
    }

    async fn turn_on_with(&self, attrs: HashMap<String, serde_json::Value>) -> EngineResult<()> {
        self.call("turn_on", attrs).await
    }

    async fn turn_off(&self) -> EngineResult<()> {
        self.call("turn_off", HashMap::new()).await
    }
}

/// Several lights driven as one
pub struct LightGroup {
    members: Vec<Arc<dyn LightLike>>,
}

impl LightGroup {
    pub fn new(members: Vec<Arc<dyn LightLike>>) -> Arc<Self> {
        Arc::new(Self { members })
    }

    /// One member failure is propagated directly, two or more are
    /// joined.
    fn collect_errors(mut errors: Vec<EngineError>) -> EngineResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(EngineError::Multiple(errors)),
        }
    }
}

#[async_trait]
impl LightLike for LightGroup {
    fn id(&self) -> String {
        if self.members.is_empty() {
            return "(empty light group)".to_string();
        }
        self.members
            .iter()
            .map(|m| m.id())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// On only when every member is on
    fn is_on(&self) -> bool {
        self.members.iter().all(|m| m.is_on())
    }

    fn brightness(&self) -> Option<f64> {
        self.members.first().and_then(|m| m.brightness())
    }

    async fn turn_on(&self) -> EngineResult<()> {
        self.turn_on_with(HashMap::new()).await
    }

    async fn turn_on_with(&self, attrs: HashMap<String, serde_json::Value>) -> EngineResult<()> {
        let mut errors = Vec::new();
        for member in &self.members {
            if let Err(err) = member.turn_on_with(attrs.clone()).await {
                errors.push(err);
            }
        }
        Self::collect_errors(errors)
    }

    async fn turn_off(&self) -> EngineResult<()> {
        let mut errors = Vec::new();
        for member in &self.members {
            if let Err(err) = member.turn_off().await {
                errors.push(err);
            }
        }
        Self::collect_errors(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn group_id_lists_members() {
        let group = LightGroup::new(vec![
            Light::new("light.left") as Arc<dyn LightLike>,
            Light::new("light.right") as Arc<dyn LightLike>,
        ]);
        assert_eq!(group.id(), "light.left,light.right");

        let empty = LightGroup::new(vec![]);
        assert_eq!(empty.id(), "(empty light group)");
    }

    #[tokio::test]
    async fn group_is_on_requires_every_member() {
        let left = Light::new("light.left");
        let right = Light::new("light.right");
        let group = LightGroup::new(vec![
            left.clone() as Arc<dyn LightLike>,
            right.clone() as Arc<dyn LightLike>,
        ]);

        left.set_state(State::new("light.left", "on"));
        right.set_state(State::new("light.right", "off"));
        assert!(!LightLike::is_on(group.as_ref()));

        right.set_state(State::new("light.right", "on"));
        assert!(LightLike::is_on(group.as_ref()));
    }

    #[tokio::test]
    async fn unbound_group_propagates_single_error_directly() {
        let group = LightGroup::new(vec![Light::new("light.solo") as Arc<dyn LightLike>]);
        let err = group.turn_off().await.unwrap_err();
        assert!(matches!(err, EngineError::EntityNotRegistered(_)));
    }

    #[tokio::test]
    async fn unbound_group_joins_multiple_errors() {
        let group = LightGroup::new(vec![
            Light::new("light.left") as Arc<dyn LightLike>,
            Light::new("light.right") as Arc<dyn LightLike>,
        ]);
        let err = group.turn_off().await.unwrap_err();
        let EngineError::Multiple(errors) = err else {
            panic!("expected joined error");
        };
        assert_eq!(errors.len(), 2);
    }
}
