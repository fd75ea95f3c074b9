//! Binary sensor entity

use std::sync::Arc;

use haven_core::State;

use crate::entity::{Entity, EntityLike, ServiceHandle};

/// A read-only on/off entity (motion, presence, door contact)
pub struct BinarySensor {
    entity: Arc<Entity>,
}

impl BinarySensor {
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
}

impl EntityLike for BinarySensor {
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

    #[test]
    fn predicates_follow_state() {
        let sensor = BinarySensor::new("binary_sensor.hall");
        assert!(!sensor.is_on());
        assert!(!sensor.is_off());

        sensor.set_state(State::new("binary_sensor.hall", "on"));
        assert!(sensor.is_on());

        sensor.set_state(State::new("binary_sensor.hall", "unavailable"));
        assert!(!sensor.is_on());
        assert!(!sensor.is_off());
    }
}
