use crate::entity::EntityId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Last known input value per tracked producer
///
/// A producer has an entry exactly while it is tracked. Every operation
/// takes the single lock, so a computation never observes a half-updated
/// map.
#[derive(Debug, Default)]
pub struct ValueStore {
    values: Mutex<HashMap<EntityId, Value>>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `producer`; false (and no change) if already tracked
    #[cfg(test)]
    pub fn seed(&self, producer: EntityId, initial: Value) -> bool {
        let mut values = self.lock();
        if values.contains_key(&producer) {
            return false;
        }
        values.insert(producer, initial);
        true
    }

    /// Like `seed`, but computes the initial value under the lock
    ///
    /// An update racing with the seed is then either rejected before the
    /// initial value is read, or applied after it is stored.
    pub fn seed_with(&self, producer: EntityId, initial: impl FnOnce() -> Value) -> bool {
        let mut values = self.lock();
        if values.contains_key(&producer) {
            return false;
        }
        values.insert(producer, initial());
        true
    }

    /// Recompute a tracked producer's value under the lock; false if untracked
    pub fn refresh_with(&self, producer: &EntityId, current: impl FnOnce() -> Value) -> bool {
        match self.lock().get_mut(producer) {
            Some(slot) => {
                *slot = current();
                true
            }
            None => false,
        }
    }

    /// Overwrite the value of a tracked producer; false if untracked
    pub fn update(&self, producer: &EntityId, value: Value) -> bool {
        match self.lock().get_mut(producer) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Stop tracking `producer`, returning its last value
    pub fn remove(&self, producer: &EntityId) -> Option<Value> {
        self.lock().remove(producer)
    }

    pub fn contains(&self, producer: &EntityId) -> bool {
        self.lock().contains_key(producer)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn get(&self, producer: &EntityId) -> Option<Value> {
        self.lock().get(producer).cloned()
    }

    pub fn producers(&self) -> Vec<EntityId> {
        self.lock().keys().cloned().collect()
    }

    /// Run `f` over the current values while holding the lock
    pub fn with_values<R>(&self, f: impl FnOnce(&HashMap<EntityId, Value>) -> R) -> R {
        let values = self.lock();
        f(&values)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EntityId, Value>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
