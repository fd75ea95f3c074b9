//! Input boolean entity

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use haven_core::State;
use haven_ws::CallServiceRequest;

use crate::entity::{Entity, EntityLike, ServiceHandle};
use crate::error::EngineResult;

/// A virtual switch that can be turned on or off
pub struct InputBoolean {
    entity: Arc<Entity>,
}

impl InputBoolean {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            entity: Entity::new(id),
        })
    }

    pub fn is_on(&self) -> bool {
        self.entity.state().is_on()
    }

    pub fn is_off(&self) -> bool {
        self.entity.state().is_off()
    }

    pub async fn turn_on(&self) -> EngineResult<()> {
        self.turn_on_with(HashMap::new()).await
    }

    pub async fn turn_on_with(
        &self,
        attrs: HashMap<String, serde_json::Value>,
    ) -> EngineResult<()> {
        let handle = self.entity.service_handle()?;
        let id = self.entity.id();
        handle
            .log()
            .debug("turning on virtual switch", Some(&id));

        let mut data = HashMap::from([("entity_id".to_string(), json!([id.clone()]))]);
        data.extend(attrs);

        let result = handle
            .call_service(CallServiceRequest::new("input_boolean", "turn_on").with_data(data))
            .await;
        if let Err(err) = &result {
            handle
                .log()
                .error(&format!("error turning on virtual switch: {err}"), Some(&id));
        }
        result.map(|_| ())
    }

    pub async fn turn_off(&self) -> EngineResult<()> {
        let handle = self.entity.service_handle()?;
        let id = self.entity.id();
        handle.log().info("turning off virtual switch", Some(&id));

        let data = HashMap::from([("entity_id".to_string(), json!([id.clone()]))]);
        let result = handle
            .call_service(CallServiceRequest::new("input_boolean", "turn_off").with_data(data))
            .await;
        if let Err(err) = &result {
            handle
                .log()
                .error(&format!("error turning off virtual switch: {err}"), Some(&id));
        }
        result.map(|_| ())
    }
}

impl EntityLike for InputBoolean {
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

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::EngineError;

    #[tokio::test]
    async fn unbound_switch_returns_not_registered() {
        let switch = InputBoolean::new("input_boolean.guest_mode");
        let err = switch.turn_on().await.unwrap_err();
        assert!(matches!(err, EngineError::EntityNotRegistered(_)));
    }
}
