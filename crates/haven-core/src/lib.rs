//! Core types for the haven runtime
//!
//! This crate provides the fundamental types shared by the wire client,
//! the persistence layer and the automation engine: State, Context and
//! the state-changed event payload.

mod context;
mod state;

pub use context::Context;
pub use state::State;

/// Event type for entity state changes
pub const STATE_CHANGED: &str = "state_changed";

/// Metric type names written by the engine
pub mod metrics {
    /// Counter: an automation action was actually invoked
    pub const AUTOMATION_TRIGGERED: &str = "automation_triggered";

    /// Counter: an automation was registered on the event's entity and
    /// considered for dispatch (recorded even when loop suppression
    /// skips the invocation)
    pub const AUTOMATION_EVALUATED: &str = "automation_evaluated";

    /// Timer: time spent processing one state-change event
    pub const TICK_PROCESSING_TIME: &str = "tick_processing_time";
}

/// Data carried by a `state_changed` event
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct StateChangedData {
    pub entity_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_state: Option<State>,

    #[serde(default)]
    pub new_state: Option<State>,
}
