use super::expression::{Expression, ResolveContext};
use super::metrics::{DeliveryMetrics, MetricsSnapshot};
use super::{Listener, Management, SubscriptionHandle, SubscriptionId};
use crate::entity::EntityId;
use crate::sensor::{Sensor, SensorEvent, CHILD_ADDED, CHILD_REMOVED, MEMBER_ADDED, MEMBER_REMOVED};
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Entity as held by the local management plane
#[derive(Clone, Debug)]
pub struct EntityRecord {
    pub id: EntityId,

    /// Parent in the application tree (None for roots)
    pub parent: Option<EntityId>,

    /// Children in insertion order
    pub children: Vec<EntityId>,

    /// Members; Some only for groups
    pub members: Option<Vec<EntityId>>,

    /// Latest published sensor values
    pub attributes: HashMap<Sensor, Value>,

    /// Last attribute or structure change
    pub last_updated: DateTime<Utc>,
}

impl EntityRecord {
    fn new(id: EntityId, parent: Option<EntityId>, group: bool) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            members: if group { Some(Vec::new()) } else { None },
            attributes: HashMap::new(),
            last_updated: Utc::now(),
        }
    }
}

/// Outcome of publishing one value to the bus
#[derive(Debug, Default)]
pub struct DeliveryReport {
    /// Listeners invoked
    pub delivered: usize,

    /// Errors returned by listeners (delivery continued past each one)
    pub failures: Vec<anyhow::Error>,
}

impl DeliveryReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Scope {
    Entity(EntityId),
    ChildrenOf(EntityId),
}

struct Subscription {
    scope: Scope,
    /// None matches every attribute
    sensor: Option<Sensor>,
    listener: Listener,
}

impl Subscription {
    fn matches(&self, sensor: &Sensor) -> bool {
        match &self.sensor {
            Some(s) => s == sensor,
            None => !sensor.is_membership(),
        }
    }
}

/// In-memory entity tree, group membership and synchronous event bus
///
/// Events are delivered on the publishing thread. Concurrent publishers
/// therefore produce concurrent deliveries, including to the same listener.
pub struct LocalManagement {
    /// Lock-free concurrent map of all managed entities
    entities: Arc<DashMap<EntityId, EntityRecord>>,

    /// Active subscriptions
    subscriptions: DashMap<SubscriptionId, Subscription>,

    metrics: DeliveryMetrics,
}

impl LocalManagement {
    pub fn new() -> Self {
        Self {
            entities: Arc::new(DashMap::new()),
            subscriptions: DashMap::new(),
            metrics: DeliveryMetrics::new(),
        }
    }

    /// Create a plain entity with a generated id
    pub fn create_entity(&self, parent: Option<&EntityId>) -> Result<EntityId> {
        let id = EntityId::generate();
        self.register(id.clone(), parent, false)?;
        Ok(id)
    }

    /// Create a group (an entity that supports members) with a generated id
    pub fn create_group(&self, parent: Option<&EntityId>) -> Result<EntityId> {
        let id = EntityId::generate();
        self.register(id.clone(), parent, true)?;
        Ok(id)
    }

    /// Manage an entity under a caller-chosen id
    ///
    /// Publishes CHILD_ADDED on the parent once the entity is visible.
    pub fn register(&self, id: EntityId, parent: Option<&EntityId>, group: bool) -> Result<()> {
        if self.entities.contains_key(&id) {
            bail!("entity {} is already managed", id);
        }
        if let Some(parent) = parent {
            if !self.entities.contains_key(parent) {
                bail!("parent entity {} is not managed", parent);
            }
        }

        self.entities.insert(
            id.clone(),
            EntityRecord::new(id.clone(), parent.cloned(), group),
        );

        if let Some(parent) = parent {
            if let Some(mut record) = self.entities.get_mut(parent) {
                record.children.push(id.clone());
                record.last_updated = Utc::now();
            }
            self.notify(parent, CHILD_ADDED, Value::String(id.to_string()));
        }

        debug!(entity_id = %id, group = group, "Entity managed");
        Ok(())
    }

    /// Stop managing an entity and its whole subtree
    ///
    /// Emits CHILD_REMOVED on the parent and MEMBER_REMOVED on every group
    /// the entity belonged to.
    pub fn remove_entity(&self, id: &EntityId) -> Option<EntityRecord> {
        let children = self.children(id);
        for child in &children {
            self.remove_entity(child);
        }

        let groups: Vec<EntityId> = self
            .entities
            .iter()
            .filter(|e| e.members.as_ref().is_some_and(|m| m.contains(id)))
            .map(|e| e.id.clone())
            .collect();
        for group in &groups {
            if let Err(e) = self.remove_member(group, id) {
                warn!(entity_id = %id, group = %group, error = %e, "Failed to drop membership");
            }
        }

        let (_, removed) = self.entities.remove(id)?;

        if let Some(parent) = &removed.parent {
            if let Some(mut record) = self.entities.get_mut(parent) {
                record.children.retain(|c| c != id);
                record.last_updated = Utc::now();
            }
            self.notify(parent, CHILD_REMOVED, Value::String(id.to_string()));
        }

        self.subscriptions
            .retain(|_, sub| sub.scope != Scope::Entity(id.clone()));

        info!(entity_id = %id, "Entity removed");
        Some(removed)
    }

    /// Add `member` to `group`; returns false if it was already a member
    pub fn add_member(&self, group: &EntityId, member: &EntityId) -> Result<bool> {
        if !self.entities.contains_key(member) {
            bail!("member entity {} is not managed", member);
        }
        {
            let mut record = self
                .entities
                .get_mut(group)
                .ok_or_else(|| anyhow!("group {} is not managed", group))?;
            let members = record
                .members
                .as_mut()
                .ok_or_else(|| anyhow!("entity {} is not a group", group))?;
            if members.contains(member) {
                return Ok(false);
            }
            members.push(member.clone());
            record.last_updated = Utc::now();
        }

        self.notify(group, MEMBER_ADDED, Value::String(member.to_string()));
        Ok(true)
    }

    /// Remove `member` from `group`; returns false if it was not a member
    pub fn remove_member(&self, group: &EntityId, member: &EntityId) -> Result<bool> {
        {
            let mut record = self
                .entities
                .get_mut(group)
                .ok_or_else(|| anyhow!("group {} is not managed", group))?;
            let members = record
                .members
                .as_mut()
                .ok_or_else(|| anyhow!("entity {} is not a group", group))?;
            let before = members.len();
            members.retain(|m| m != member);
            if members.len() == before {
                return Ok(false);
            }
            record.last_updated = Utc::now();
        }

        self.notify(group, MEMBER_REMOVED, Value::String(member.to_string()));
        Ok(true)
    }

    /// Update a sensor value (core state mutation) and deliver the change
    pub fn set_attribute(
        &self,
        entity: &EntityId,
        sensor: &Sensor,
        value: Value,
    ) -> Result<DeliveryReport> {
        {
            let mut record = self
                .entities
                .get_mut(entity)
                .ok_or_else(|| anyhow!("entity {} is not managed", entity))?;
            record.attributes.insert(sensor.clone(), value.clone());
            record.last_updated = Utc::now();
        }

        let event = SensorEvent::new(entity.clone(), sensor.clone(), value);
        Ok(self.dispatch(&event))
    }

    /// Get a copy of an entity by ID
    pub fn entity(&self, id: &EntityId) -> Option<EntityRecord> {
        self.entities.get(id).map(|e| e.clone())
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.subscriptions.len())
    }

    /// Structural notification: delivered but never stored as an attribute
    fn notify(&self, entity: &EntityId, sensor: Sensor, value: Value) {
        let event = SensorEvent::new(entity.clone(), sensor, value);
        let report = self.dispatch(&event);
        if !report.is_clean() {
            debug!(
                entity_id = %entity,
                sensor = %event.sensor,
                failures = report.failures.len(),
                "Membership listeners reported failures"
            );
        }
    }

    fn dispatch(&self, event: &SensorEvent) -> DeliveryReport {
        self.metrics.record_publish();

        let parent = self
            .entities
            .get(&event.source)
            .and_then(|e| e.parent.clone());

        // Collect first: listeners may subscribe/unsubscribe re-entrantly
        let listeners: Vec<Listener> = self
            .subscriptions
            .iter()
            .filter(|sub| sub.matches(&event.sensor))
            .filter(|sub| match &sub.scope {
                Scope::Entity(id) => *id == event.source,
                Scope::ChildrenOf(p) => parent.as_ref() == Some(p),
            })
            .map(|sub| Arc::clone(&sub.listener))
            .collect();

        let mut report = DeliveryReport::default();
        for listener in listeners {
            let result = listener(event);
            self.metrics.record_delivery(result.is_err());
            report.delivered += 1;
            if let Err(e) = result {
                debug!(
                    entity_id = %event.source,
                    sensor = %event.sensor,
                    error = %e,
                    "Listener failed"
                );
                report.failures.push(e);
            }
        }
        report
    }

    fn insert_subscription(&self, scope: Scope, sensor: Option<&Sensor>, listener: Listener) -> SubscriptionHandle {
        let id = SubscriptionId::new();
        let producer = match &scope {
            Scope::Entity(e) | Scope::ChildrenOf(e) => e.clone(),
        };
        self.subscriptions.insert(
            id,
            Subscription {
                scope,
                sensor: sensor.cloned(),
                listener,
            },
        );
        SubscriptionHandle {
            id,
            producer,
            sensor: sensor.cloned(),
        }
    }

    /// Wait (bounded) for a sensor to take a non-null value
    fn await_attribute(&self, entity: &EntityId, sensor: &Sensor, timeout: Duration) -> Option<Value> {
        let ready = |v: &Value| !v.is_null();
        if let Some(v) = self.current_value(entity, sensor).filter(ready) {
            return Some(v);
        }

        let (tx, rx) = mpsc::sync_channel::<Value>(1);
        let listener: Listener = Arc::new(move |event: &SensorEvent| -> Result<()> {
            if !event.value.is_null() {
                // Full or disconnected means a value already arrived
                let _ = tx.try_send(event.value.clone());
            }
            Ok(())
        });
        let handle = self.subscribe(entity, sensor, listener);

        // Re-check: the value may have landed before the subscription existed
        let value = match self.current_value(entity, sensor).filter(ready) {
            Some(v) => Some(v),
            None => rx.recv_timeout(timeout).ok(),
        };
        self.unsubscribe(&handle);
        value
    }
}

impl Default for LocalManagement {
    fn default() -> Self {
        Self::new()
    }
}

impl Management for LocalManagement {
    fn subscribe(&self, producer: &EntityId, sensor: &Sensor, listener: Listener) -> SubscriptionHandle {
        self.insert_subscription(Scope::Entity(producer.clone()), Some(sensor), listener)
    }

    fn subscribe_to_children(
        &self,
        parent: &EntityId,
        sensor: &Sensor,
        listener: Listener,
    ) -> SubscriptionHandle {
        self.insert_subscription(Scope::ChildrenOf(parent.clone()), Some(sensor), listener)
    }

    fn subscribe_to_all(&self, producer: &EntityId, listener: Listener) -> SubscriptionHandle {
        self.insert_subscription(Scope::Entity(producer.clone()), None, listener)
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.subscriptions.remove(&handle.id).is_some()
    }

    fn current_value(&self, entity: &EntityId, sensor: &Sensor) -> Option<Value> {
        self.entities
            .get(entity)
            .and_then(|e| e.attributes.get(sensor).cloned())
    }

    fn current_values(&self, entity: &EntityId) -> Vec<(Sensor, Value)> {
        let mut values: Vec<(Sensor, Value)> = self
            .entities
            .get(entity)
            .map(|e| {
                e.attributes
                    .iter()
                    .map(|(sensor, value)| (sensor.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        values
    }

    fn emit(&self, owner: &EntityId, sensor: &Sensor, value: Value) -> Result<()> {
        let report = self.set_attribute(owner, sensor, value)?;
        if !report.is_clean() {
            debug!(
                entity_id = %owner,
                sensor = %sensor,
                failures = report.failures.len(),
                "Downstream listeners failed"
            );
        }
        Ok(())
    }

    fn modify(
        &self,
        owner: &EntityId,
        sensor: &Sensor,
        update: &mut dyn FnMut(Option<&Value>) -> Result<Option<Value>>,
    ) -> Result<bool> {
        let value = {
            let mut record = self
                .entities
                .get_mut(owner)
                .ok_or_else(|| anyhow!("entity {} is not managed", owner))?;
            let Some(value) = update(record.attributes.get(sensor))? else {
                return Ok(false);
            };
            record.attributes.insert(sensor.clone(), value.clone());
            record.last_updated = Utc::now();
            value
        };

        let event = SensorEvent::new(owner.clone(), sensor.clone(), value);
        let report = self.dispatch(&event);
        if !report.is_clean() {
            debug!(
                entity_id = %owner,
                sensor = %sensor,
                failures = report.failures.len(),
                "Downstream listeners failed"
            );
        }
        Ok(true)
    }

    fn resolve_with_timeout(
        &self,
        expression: &Expression,
        context: &ResolveContext,
        timeout: Duration,
    ) -> Option<Value> {
        match expression {
            Expression::Value(v) => Some(v.clone()),
            Expression::Attribute { entity, sensor } => {
                let entity = entity.as_ref().unwrap_or(&context.owner);
                self.await_attribute(entity, sensor, timeout)
            }
            Expression::Deferred(f) => {
                let (tx, rx) = mpsc::channel();
                let f = Arc::clone(f);
                let ctx = context.clone();
                let spawned = thread::Builder::new()
                    .name("enricher-resolve".to_string())
                    .spawn(move || {
                        // Receiver gone means the caller already timed out
                        let _ = tx.send(f(&ctx));
                    });
                if let Err(e) = spawned {
                    warn!(error = %e, "Failed to spawn resolver thread");
                    return None;
                }

                match rx.recv_timeout(timeout) {
                    Ok(Ok(v)) => Some(v),
                    Ok(Err(e)) => {
                        debug!(owner = %context.owner, error = %e, "Deferred value failed");
                        None
                    }
                    Err(_) => {
                        debug!(
                            owner = %context.owner,
                            timeout_ms = timeout.as_millis() as u64,
                            "Deferred value not ready in time"
                        );
                        None
                    }
                }
            }
        }
    }

    fn is_group(&self, entity: &EntityId) -> bool {
        self.entities
            .get(entity)
            .map(|e| e.members.is_some())
            .unwrap_or(false)
    }

    fn members(&self, group: &EntityId) -> Vec<EntityId> {
        self.entities
            .get(group)
            .and_then(|e| e.members.clone())
            .unwrap_or_default()
    }

    fn children(&self, parent: &EntityId) -> Vec<EntityId> {
        self.entities
            .get(parent)
            .map(|e| e.children.clone())
            .unwrap_or_default()
    }
}
