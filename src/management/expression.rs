use crate::entity::EntityId;
use crate::sensor::{Sensor, SensorEvent};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Computation producing a value once its inputs are ready
pub type DeferredFn = Arc<dyn Fn(&ResolveContext) -> anyhow::Result<Value> + Send + Sync>;

/// Explicit context for resolving configuration values
///
/// Carries the owning entity (and the triggering event, when resolving
/// per event) instead of relying on any ambient "current entity".
#[derive(Debug, Clone)]
pub struct ResolveContext {
    pub owner: EntityId,
    pub event: Option<SensorEvent>,
}

impl ResolveContext {
    pub fn for_owner(owner: EntityId) -> Self {
        Self { owner, event: None }
    }

    pub fn with_event(owner: EntityId, event: SensorEvent) -> Self {
        Self {
            owner,
            event: Some(event),
        }
    }
}

/// Configuration value that may not be available immediately
#[derive(Clone)]
pub enum Expression {
    /// Already known
    Value(Value),

    /// Non-null value of a sensor; `entity` defaults to the context owner
    Attribute {
        entity: Option<EntityId>,
        sensor: Sensor,
    },

    /// Arbitrary (possibly slow) computation
    Deferred(DeferredFn),
}

impl Expression {
    pub fn deferred<F>(f: F) -> Self
    where
        F: Fn(&ResolveContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Expression::Deferred(Arc::new(f))
    }

    /// Attribute on the owner of the resolving unit
    pub fn owner_attribute(sensor: Sensor) -> Self {
        Expression::Attribute {
            entity: None,
            sensor,
        }
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Expression::Attribute { entity, sensor } => f
                .debug_struct("Attribute")
                .field("entity", entity)
                .field("sensor", sensor)
                .finish(),
            Expression::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

impl From<Value> for Expression {
    fn from(value: Value) -> Self {
        Expression::Value(value)
    }
}
