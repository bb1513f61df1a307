use super::error::EnricherError;
use crate::entity::EntityId;
use crate::management::{Listener, Management, SubscriptionHandle};
use crate::sensor::{Sensor, SensorEvent};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// State shared by every enricher: owner, bus handle, held subscriptions
///
/// Subscriptions are keyed by the entity they are attached to, so releasing
/// a producer drops exactly the deliveries that producer could trigger.
pub(crate) struct EnricherBase {
    owner: EntityId,
    management: Arc<dyn Management>,
    tag: String,
    suppress_duplicates: bool,
    last_published: Mutex<HashMap<Sensor, Value>>,
    subscriptions: Mutex<HashMap<EntityId, Vec<SubscriptionHandle>>>,
    live: AtomicBool,
}

impl EnricherBase {
    pub(crate) fn new(
        owner: EntityId,
        management: Arc<dyn Management>,
        tag: String,
        suppress_duplicates: bool,
    ) -> Self {
        Self {
            owner,
            management,
            tag,
            suppress_duplicates,
            last_published: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            live: AtomicBool::new(true),
        }
    }

    pub(crate) fn owner(&self) -> &EntityId {
        &self.owner
    }

    pub(crate) fn management(&self) -> &dyn Management {
        self.management.as_ref()
    }

    pub(crate) fn tag(&self) -> &str {
        &self.tag
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribe(&self, producer: &EntityId, sensor: &Sensor, listener: Listener) {
        let handle = self.management.subscribe(producer, sensor, listener);
        self.track(producer.clone(), handle);
    }

    pub(crate) fn subscribe_to_children(&self, parent: &EntityId, sensor: &Sensor, listener: Listener) {
        let handle = self.management.subscribe_to_children(parent, sensor, listener);
        self.track(parent.clone(), handle);
    }

    pub(crate) fn subscribe_to_all(&self, producer: &EntityId, listener: Listener) {
        let handle = self.management.subscribe_to_all(producer, listener);
        self.track(producer.clone(), handle);
    }

    fn track(&self, key: EntityId, handle: SubscriptionHandle) {
        let mut subs = self.lock_subscriptions();
        // Destroyed while subscribing: release instead of leaking
        if !self.is_live() {
            self.management.unsubscribe(&handle);
            return;
        }
        subs.entry(key).or_default().push(handle);
    }

    /// Release every subscription attached to `producer`
    pub(crate) fn release(&self, producer: &EntityId) -> usize {
        let handles = self.lock_subscriptions().remove(producer).unwrap_or_default();
        for handle in &handles {
            self.management.unsubscribe(handle);
        }
        handles.len()
    }

    #[cfg(test)]
    pub(crate) fn subscription_count(&self) -> usize {
        self.lock_subscriptions().values().map(Vec::len).sum()
    }

    /// Stop reacting and release all subscriptions; returns false if already stopped
    pub(crate) fn destroy(&self) -> bool {
        if !self.live.swap(false, Ordering::SeqCst) {
            return false;
        }
        let released: Vec<SubscriptionHandle> = self
            .lock_subscriptions()
            .drain()
            .flat_map(|(_, handles)| handles)
            .collect();
        for handle in &released {
            self.management.unsubscribe(handle);
        }
        info!(tag = %self.tag, released = released.len(), "Enricher destroyed");
        true
    }

    /// Publish on the owner, honouring duplicate suppression
    ///
    /// Only a successful publication counts as the last published value.
    pub(crate) fn emit(&self, sensor: &Sensor, value: Value) -> Result<()> {
        if !self.is_live() {
            return Ok(());
        }
        if self.suppress_duplicates && self.lock_last_published().get(sensor) == Some(&value) {
            debug!(tag = %self.tag, sensor = %sensor, "Suppressing duplicate value");
            return Ok(());
        }
        self.management.emit(&self.owner, sensor, value.clone())?;
        self.lock_last_published().insert(sensor.clone(), value);
        Ok(())
    }

    /// Atomically rewrite a sensor on the owner; true if a value was published
    pub(crate) fn modify(
        &self,
        sensor: &Sensor,
        update: &mut dyn FnMut(Option<&Value>) -> Result<Option<Value>>,
    ) -> Result<bool> {
        if !self.is_live() {
            return Ok(false);
        }
        self.management.modify(&self.owner, sensor, update)
    }

    /// Log a failed computation at the unit; the error is handed back for propagation
    pub(crate) fn computation_failed(&self, error: anyhow::Error) -> anyhow::Error {
        warn!(tag = %self.tag, owner = %self.owner, error = %error, "Enricher computation failed");
        anyhow::Error::new(EnricherError::Computation {
            tag: self.tag.clone(),
            source: error,
        })
    }

    fn lock_last_published(&self) -> MutexGuard<'_, HashMap<Sensor, Value>> {
        self.last_published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, HashMap<EntityId, Vec<SubscriptionHandle>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for EnricherBase {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Build a bus listener that forwards to `unit` without keeping it alive
pub(crate) fn bind_listener<U, F>(unit: &Arc<U>, handler: F) -> Listener
where
    U: Send + Sync + 'static,
    F: Fn(&Arc<U>, &SensorEvent) -> Result<()> + Send + Sync + 'static,
{
    let weak = Arc::downgrade(unit);
    Arc::new(move |event: &SensorEvent| -> Result<()> {
        match weak.upgrade() {
            Some(unit) => handler(&unit, event),
            None => Ok(()),
        }
    })
}
