//! Entity collection
//!
//! The explicit stand-in for reflective entity discovery: containers
//! and user structs describe how to enumerate the entities they hold,
//! and `Connection::register_collection` walks them. The
//! `impl_entity_collection!` macro wires up a struct's entity fields.

use std::collections::HashMap;
use std::sync::Arc;

use crate::entity::EntityLike;

/// Anything that can enumerate the entities it holds
pub trait EntityCollection {
    fn collect_entities(&self) -> Vec<Arc<dyn EntityLike>>;
}

impl<T: EntityLike + 'static> EntityCollection for Arc<T> {
    fn collect_entities(&self) -> Vec<Arc<dyn EntityLike>> {
        vec![self.clone()]
    }
}

impl<T: EntityCollection> EntityCollection for Vec<T> {
    fn collect_entities(&self) -> Vec<Arc<dyn EntityLike>> {
        self.iter().flat_map(|item| item.collect_entities()).collect()
    }
}

impl<T: EntityCollection> EntityCollection for Option<T> {
    fn collect_entities(&self) -> Vec<Arc<dyn EntityLike>> {
        self.iter().flat_map(|item| item.collect_entities()).collect()
    }
}

impl<K, T: EntityCollection> EntityCollection for HashMap<K, T> {
    fn collect_entities(&self) -> Vec<Arc<dyn EntityLike>> {
        self.values().flat_map(|item| item.collect_entities()).collect()
    }
}

/// Implement `EntityCollection` for a struct by listing the fields that
/// hold entities (directly or through nested collections):
///
/// ```ignore
/// struct Home {
///     hallway_motion: Arc<BinarySensor>,
///     hallway_lights: Vec<Arc<Light>>,
/// }
///
/// impl_entity_collection!(Home { hallway_motion, hallway_lights });
/// ```
#[macro_export]
macro_rules! impl_entity_collection {
    ($ty:ty { $($field:ident),+ $(,)? }) => {
        impl $crate::EntityCollection for $ty {
            fn collect_entities(
                &self,
            ) -> ::std::vec::Vec<::std::sync::Arc<dyn $crate::EntityLike>> {
                let mut entities = ::std::vec::Vec::new();
                $(
                    entities.extend($crate::EntityCollection::collect_entities(&self.$field));
                )+
                entities
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::binary_sensor::BinarySensor;
    use crate::light::Light;

    struct Home {
        motion: Arc<BinarySensor>,
        lights: Vec<Arc<Light>>,
        spare: Option<Arc<Light>>,
    }

    impl_entity_collection!(Home { motion, lights, spare });

    #[test]
    fn struct_fields_are_walked() {
        let home = Home {
            motion: BinarySensor::new("binary_sensor.hall"),
            lights: vec![Light::new("light.hall_1"), Light::new("light.hall_2")],
            spare: None,
        };

        let ids: Vec<String> = home.collect_entities().iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec!["binary_sensor.hall", "light.hall_1", "light.hall_2"]);
    }

    #[test]
    fn nested_containers_are_walked() {
        let mut rooms = HashMap::new();
        rooms.insert("kitchen", vec![Light::new("light.kitchen")]);

        let entities = rooms.collect_entities();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].id(), "light.kitchen");
    }
}
