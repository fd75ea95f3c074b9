//! State type representing an entity's current snapshot

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The state of an entity at a point in time
///
/// State includes the entity's current value (as a string), any
/// associated attributes, and the upstream's bookkeeping timestamps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    /// The entity this state belongs to
    #[serde(default)]
    pub entity_id: String,

    /// The state value (e.g., "on", "off", "23.5", "unavailable")
    #[serde(default)]
    pub state: String,

    /// Additional attributes associated with the state
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    /// When the state value last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_changed: Option<DateTime<Utc>>,

    /// When the state was last reported by the integration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reported: Option<DateTime<Utc>>,

    /// When the state was last written (even if the value didn't change)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl State {
    /// Create a state with just an entity id and value
    pub fn new(entity_id: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            ..Default::default()
        }
    }

    /// Attach an attribute, builder-style
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// The engine only distinguishes "on", "off" and everything else.
    pub fn is_on(&self) -> bool {
        self.state == "on"
    }

    pub fn is_off(&self) -> bool {
        self.state == "off"
    }

    /// Get an attribute value by key, deserialized to the requested type
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// The `brightness` attribute, the one attribute the engine consumes
    pub fn brightness(&self) -> Option<f64> {
        self.attributes.get("brightness").and_then(|v| v.as_f64())
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps are not compared; two snapshots are equal if they
        // describe the same entity, value and attributes.
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}
