//! Context type carried by upstream events and service calls

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifies who caused an event.
///
/// Every event pushed by the upstream carries a Context. The engine
/// compares `user_id` against its own configured user id to suppress
/// automation loops: state changes this process caused come back
/// attributed to its user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Context {
    /// Create a new context with a fresh ULID
    pub fn new() -> Self {
        Self {
            id: Ulid::new().to_string(),
            parent_id: None,
            user_id: None,
        }
    }

    /// Create a new context attributed to a specific user
    pub fn with_user(user_id: impl Into<String>) -> Self {
        Self {
            id: Ulid::new().to_string(),
            parent_id: None,
            user_id: Some(user_id.into()),
        }
    }

    /// True if this context is attributed to the given user id
    pub fn is_user(&self, user_id: &str) -> bool {
        self.user_id.as_deref() == Some(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_contexts_get_unique_ids() {
        let a = Context::new();
        let b = Context::new();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn user_attribution() {
        let ctx = Context::with_user("abc");
        assert!(ctx.is_user("abc"));
        assert!(!ctx.is_user("def"));
        assert!(!Context::new().is_user("abc"));
    }

    #[test]
    fn deserializes_sparse_wire_context() {
        // Upstream may omit parent_id/user_id entirely.
        let ctx: Context = serde_json::from_str(r#"{"id": "01J"}"#).unwrap();
        assert_eq!(ctx.id, "01J");
        assert_eq!(ctx.user_id, None);
    }
}
