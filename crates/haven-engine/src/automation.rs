//! Automation model
//!
//! Anything exposing a name, an ordered list of entity ids to watch,
//! and an action is an automation. `FnAutomation` is the closure-based
//! building block; richer automations implement the trait directly.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::entity::EntityLike;

#[async_trait]
pub trait Automation: Send + Sync {
    /// Friendly name, used in logs and metrics
    fn name(&self) -> String;

    /// Entity ids whose state changes trigger this automation, in
    /// subscription order
    fn triggers(&self) -> Vec<String>;

    /// Invoked with the entity that triggered
    async fn action(&self, trigger: Arc<dyn EntityLike>);
}

type ActionFn = Box<dyn Fn(Arc<dyn EntityLike>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Closure-backed automation, builder style
pub struct FnAutomation {
    name: String,
    triggers: Vec<String>,
    action: Option<ActionFn>,
}

impl FnAutomation {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            triggers: Vec::new(),
            action: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Watch the given entity
    pub fn with_entity(mut self, entity: Arc<dyn EntityLike>) -> Self {
        self.triggers.push(entity.id());
        self
    }

    pub fn with_entities(
        mut self,
        entities: impl IntoIterator<Item = Arc<dyn EntityLike>>,
    ) -> Self {
        self.triggers.extend(entities.into_iter().map(|e| e.id()));
        self
    }

    pub fn with_action<F, Fut>(mut self, action: F) -> Self
    where
        F: Fn(Arc<dyn EntityLike>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.action = Some(Box::new(move |trigger| Box::pin(action(trigger))));
        self
    }
}

impl Default for FnAutomation {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Automation for FnAutomation {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn triggers(&self) -> Vec<String> {
        self.triggers.clone()
    }

    async fn action(&self, trigger: Arc<dyn EntityLike>) {
        if let Some(action) = &self.action {
            action(trigger).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::entity::Entity;

    #[tokio::test]
    async fn builder_collects_triggers_in_order() {
        let automation = FnAutomation::new()
            .with_name("evening lights")
            .with_entity(Entity::new("sensor.a"))
            .with_entity(Entity::new("sensor.b"));

        assert_eq!(automation.name(), "evening lights");
        assert_eq!(automation.triggers(), vec!["sensor.a", "sensor.b"]);
    }

    #[tokio::test]
    async fn action_receives_the_trigger() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        let automation = FnAutomation::new().with_action(move |trigger| {
            let counter = counter.clone();
            async move {
                assert_eq!(trigger.id(), "sensor.a");
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        automation.action(Entity::new("sensor.a")).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
