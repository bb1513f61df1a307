// Collaborator interfaces consumed by enrichers, plus an in-memory implementation

mod expression;
mod local;
mod metrics;

pub use expression::{DeferredFn, Expression, ResolveContext};
pub use local::{DeliveryReport, LocalManagement};
pub use metrics::{DeliveryMetrics, MetricsSnapshot};

use crate::entity::EntityId;
use crate::sensor::{Sensor, SensorEvent};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Callback invoked on the delivering thread for each matching event
///
/// An `Err` is reported back to whoever published the event; it never
/// cancels the subscription.
pub type Listener = Arc<dyn Fn(&SensorEvent) -> anyhow::Result<()> + Send + Sync>;

/// Unique identifier for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque handle returned by `subscribe`; pass it back to `unsubscribe`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Entity the subscription is attached to (the parent for bulk child subscriptions)
    pub producer: EntityId,
    /// None for a subscription to every attribute of the producer
    pub sensor: Option<Sensor>,
}

/// Everything an enricher needs from the surrounding platform
///
/// Implementations must tolerate re-entrant calls from inside a listener:
/// an enricher emits (and may subscribe or unsubscribe) while an event is
/// being delivered to it.
pub trait Management: Send + Sync {
    /// Deliver changes of `sensor` on `producer` to `listener`
    fn subscribe(&self, producer: &EntityId, sensor: &Sensor, listener: Listener)
        -> SubscriptionHandle;

    /// Deliver changes of `sensor` on any current child of `parent`
    fn subscribe_to_children(
        &self,
        parent: &EntityId,
        sensor: &Sensor,
        listener: Listener,
    ) -> SubscriptionHandle;

    /// Deliver changes of every attribute on `producer`
    ///
    /// Membership notifications are not attributes and are not delivered.
    fn subscribe_to_all(&self, producer: &EntityId, listener: Listener) -> SubscriptionHandle;

    /// Release a subscription; returns false if it was already gone
    fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool;

    /// Latest known value; None if the sensor was never published
    fn current_value(&self, entity: &EntityId, sensor: &Sensor) -> Option<Value>;

    /// Every attribute currently published on `entity`, ordered by sensor
    fn current_values(&self, entity: &EntityId) -> Vec<(Sensor, Value)>;

    /// Publish a value on `owner`, notifying downstream subscribers
    fn emit(&self, owner: &EntityId, sensor: &Sensor, value: Value) -> anyhow::Result<()>;

    /// Replace a value on `owner` with one computed from the current value, atomically
    ///
    /// `update` returns None to leave the value as it is; nothing is
    /// published then. Returns true if a new value was published.
    fn modify(
        &self,
        owner: &EntityId,
        sensor: &Sensor,
        update: &mut dyn FnMut(Option<&Value>) -> anyhow::Result<Option<Value>>,
    ) -> anyhow::Result<bool>;

    /// Resolve a deferred configuration value, blocking at most `timeout`
    fn resolve_with_timeout(
        &self,
        expression: &Expression,
        context: &ResolveContext,
        timeout: Duration,
    ) -> Option<Value>;

    /// True if the entity supports members
    fn is_group(&self, entity: &EntityId) -> bool;

    /// Current members of a group (empty for non-groups)
    fn members(&self, group: &EntityId) -> Vec<EntityId>;

    /// Current children of an entity
    fn children(&self, parent: &EntityId) -> Vec<EntityId>;
}
