use super::base::{bind_listener, EnricherBase};
use super::error::ConfigError;
use crate::entity::EntityId;
use crate::management::Management;
use crate::sensor::{Sensor, SensorEvent, CHILD_ADDED, CHILD_REMOVED, MEMBER_ADDED, MEMBER_REMOVED};
use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Predicate deciding whether a member or child becomes a producer
pub type EntityFilter = Arc<dyn Fn(&EntityId) -> bool + Send + Sync>;

/// Which entities feed an aggregating enricher, as configured
#[derive(Clone, Default)]
pub struct ProducerSelection {
    /// Single producer whose members or children are tracked; defaults to the owner
    pub producer: Option<EntityId>,
    /// Fixed producer list; excludes every other option
    pub hardcoded: Option<Vec<EntityId>>,
    pub from_members: Option<bool>,
    pub from_children: Option<bool>,
    pub entity_filter: Option<EntityFilter>,
}

impl fmt::Debug for ProducerSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerSelection")
            .field("producer", &self.producer)
            .field("hardcoded", &self.hardcoded)
            .field("from_members", &self.from_members)
            .field("from_children", &self.from_children)
            .field("entity_filter", &self.entity_filter.is_some())
            .finish()
    }
}

/// Resolved producer-set strategy; fixed for the lifetime of the enricher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerMode {
    Hardcoded(Vec<EntityId>),
    Members(EntityId),
    Children(EntityId),
}

impl ProducerMode {
    /// Decide the mode once, at attach time
    ///
    /// Precedence: hardcoded, explicit members, explicit children, then
    /// members if the producer is a group and children otherwise.
    pub fn resolve(
        selection: &ProducerSelection,
        owner: &EntityId,
        management: &dyn Management,
    ) -> Result<Self, ConfigError> {
        let from_members = selection.from_members == Some(true);
        let from_children = selection.from_children == Some(true);

        if let Some(hardcoded) = &selection.hardcoded {
            if selection.producer.is_some() || from_members || from_children {
                return Err(ConfigError::ConflictingProducers);
            }
            return Ok(ProducerMode::Hardcoded(hardcoded.clone()));
        }

        let producer = selection.producer.clone().unwrap_or_else(|| owner.clone());
        if from_members {
            if !management.is_group(&producer) {
                return Err(ConfigError::NotAGroup(producer));
            }
            return Ok(ProducerMode::Members(producer));
        }
        if from_children {
            return Ok(ProducerMode::Children(producer));
        }
        if management.is_group(&producer) {
            Ok(ProducerMode::Members(producer))
        } else {
            Ok(ProducerMode::Children(producer))
        }
    }
}

impl fmt::Display for ProducerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProducerMode::Hardcoded(list) => write!(f, "hardcoded({})", list.len()),
            ProducerMode::Members(group) => write!(f, "members of {}", group),
            ProducerMode::Children(parent) => write!(f, "children of {}", parent),
        }
    }
}

/// Computation side of an enricher driven by a dynamic producer set
pub(crate) trait ProducerUnit: Send + Sync + 'static {
    fn base(&self) -> &EnricherBase;
    fn tracker(&self) -> &ProducerTracker;
    fn source_sensor(&self) -> &Sensor;
    fn is_tracking(&self, producer: &EntityId) -> bool;
    /// Start tracking; false if the producer was already tracked
    fn on_producer_added(&self, producer: &EntityId) -> bool;
    /// Re-read the current value of a tracked producer
    fn refresh_producer(&self, producer: &EntityId);
    /// Stop tracking, then recompute
    fn on_producer_removed(&self, producer: &EntityId) -> Result<()>;
    fn on_event(&self, event: &SensorEvent) -> Result<()>;
    /// Recompute and emit from the current inputs
    fn on_updated(&self) -> Result<()>;
}

/// Keeps the producer set of a unit in step with the entity tree
pub(crate) struct ProducerTracker {
    mode: ProducerMode,
    filter: Option<EntityFilter>,
}

impl ProducerTracker {
    pub(crate) fn new(mode: ProducerMode, filter: Option<EntityFilter>) -> Self {
        Self { mode, filter }
    }

    pub(crate) fn mode(&self) -> &ProducerMode {
        &self.mode
    }

    fn accepts(&self, entity: &EntityId) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(entity))
    }

    /// Subscribe to structural changes and seed the initial producers
    ///
    /// Structural subscriptions come first so that nothing added while
    /// seeding is missed; seeding is idempotent.
    pub(crate) fn start<U: ProducerUnit>(&self, unit: &Arc<U>) -> Result<()> {
        let base = unit.base();
        match &self.mode {
            ProducerMode::Hardcoded(producers) => {
                for producer in producers {
                    if self.accepts(producer) {
                        self.add_producer_hardcoded(unit, producer)?;
                    }
                }
            }
            ProducerMode::Members(group) => {
                for sensor in [&MEMBER_ADDED, &MEMBER_REMOVED] {
                    base.subscribe(group, sensor, bind_listener(unit, on_structural_event::<U>));
                }
                for member in base.management().members(group) {
                    if self.accepts(&member) {
                        self.add_producer_member(unit, &member)?;
                    }
                }
            }
            ProducerMode::Children(parent) => {
                for sensor in [&CHILD_ADDED, &CHILD_REMOVED] {
                    base.subscribe(parent, sensor, bind_listener(unit, on_structural_event::<U>));
                }
                base.subscribe_to_children(
                    parent,
                    unit.source_sensor(),
                    bind_listener(unit, |unit: &Arc<U>, event: &SensorEvent| unit.on_event(event)),
                );
                for child in base.management().children(parent) {
                    if self.accepts(&child) {
                        self.add_producer_child(unit, &child)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn add_producer_hardcoded<U: ProducerUnit>(&self, unit: &Arc<U>, producer: &EntityId) -> Result<()> {
        self.subscribe_and_add(unit, producer)
    }

    pub(crate) fn add_producer_member<U: ProducerUnit>(&self, unit: &Arc<U>, producer: &EntityId) -> Result<()> {
        self.subscribe_and_add(unit, producer)
    }

    /// Children share the bulk subscription made at start
    pub(crate) fn add_producer_child<U: ProducerUnit>(&self, unit: &Arc<U>, producer: &EntityId) -> Result<()> {
        if !unit.on_producer_added(producer) {
            debug!(tag = %unit.base().tag(), producer = %producer, "Producer already tracked");
            return Ok(());
        }
        unit.on_updated()
    }

    /// Reserve the producer in the unit, then subscribe
    ///
    /// The reservation comes first so that a removal delivered while the
    /// subscription is being made always finds the producer. Whatever the
    /// producer published in that window is picked up by `refresh_producer`.
    fn subscribe_and_add<U: ProducerUnit>(&self, unit: &Arc<U>, producer: &EntityId) -> Result<()> {
        if !unit.on_producer_added(producer) {
            debug!(tag = %unit.base().tag(), producer = %producer, "Producer already tracked");
            return Ok(());
        }
        unit.base().subscribe(
            producer,
            unit.source_sensor(),
            bind_listener(unit, |unit: &Arc<U>, event: &SensorEvent| unit.on_event(event)),
        );
        if !unit.is_tracking(producer) {
            debug!(tag = %unit.base().tag(), producer = %producer, "Producer removed while subscribing");
            unit.base().release(producer);
            return Ok(());
        }
        if !self.still_present(unit.base().management(), producer) {
            debug!(tag = %unit.base().tag(), producer = %producer, "Producer left before tracking completed");
            return self.remove_producer(unit, producer);
        }
        unit.refresh_producer(producer);
        unit.on_updated()
    }

    /// Membership check for producers whose removal may have been delivered first
    fn still_present(&self, management: &dyn Management, producer: &EntityId) -> bool {
        match &self.mode {
            ProducerMode::Hardcoded(_) => true,
            ProducerMode::Members(group) => management.members(group).contains(producer),
            ProducerMode::Children(parent) => management.children(parent).contains(producer),
        }
    }

    /// Release the producer's subscription, drop its value and recompute
    pub(crate) fn remove_producer<U: ProducerUnit>(&self, unit: &Arc<U>, producer: &EntityId) -> Result<()> {
        unit.base().release(producer);
        unit.on_producer_removed(producer)
    }
}

fn on_structural_event<U: ProducerUnit>(unit: &Arc<U>, event: &SensorEvent) -> Result<()> {
    if !unit.base().is_live() {
        return Ok(());
    }
    let Some(entity) = event.affected_entity() else {
        warn!(tag = %unit.base().tag(), sensor = %event.sensor, "Structural event without entity id");
        return Ok(());
    };

    let tracker = unit.tracker();
    if event.sensor == MEMBER_ADDED {
        if tracker.accepts(&entity) {
            return tracker.add_producer_member(unit, &entity);
        }
    } else if event.sensor == CHILD_ADDED {
        if tracker.accepts(&entity) {
            return tracker.add_producer_child(unit, &entity);
        }
    } else if event.sensor == MEMBER_REMOVED || event.sensor == CHILD_REMOVED {
        // Only tracked producers have anything to release
        if unit.is_tracking(&entity) {
            return tracker.remove_producer(unit, &entity);
        }
    }
    debug!(tag = %unit.base().tag(), entity = %entity, sensor = %event.sensor, "Ignoring structural event");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::management::LocalManagement;

    fn setup() -> (Arc<LocalManagement>, EntityId) {
        let mgmt = Arc::new(LocalManagement::new());
        let owner = mgmt.create_entity(None).unwrap();
        (mgmt, owner)
    }

    #[test]
    fn test_resolve_defaults_to_children_for_plain_entity() {
        let (mgmt, owner) = setup();
        let mode = ProducerMode::resolve(&ProducerSelection::default(), &owner, mgmt.as_ref()).unwrap();
        assert_eq!(mode, ProducerMode::Children(owner));
    }

    #[test]
    fn test_resolve_defaults_to_members_for_group() {
        let mgmt = Arc::new(LocalManagement::new());
        let group = mgmt.create_group(None).unwrap();
        let mode = ProducerMode::resolve(&ProducerSelection::default(), &group, mgmt.as_ref()).unwrap();
        assert_eq!(mode, ProducerMode::Members(group));
    }

    #[test]
    fn test_resolve_hardcoded_wins() {
        let (mgmt, owner) = setup();
        let selection = ProducerSelection {
            hardcoded: Some(vec![EntityId::from("p1")]),
            ..Default::default()
        };
        let mode = ProducerMode::resolve(&selection, &owner, mgmt.as_ref()).unwrap();
        assert_eq!(mode, ProducerMode::Hardcoded(vec![EntityId::from("p1")]));
    }

    #[test]
    fn test_resolve_hardcoded_with_producer_conflicts() {
        let (mgmt, owner) = setup();
        let selection = ProducerSelection {
            producer: Some(owner.clone()),
            hardcoded: Some(vec![]),
            ..Default::default()
        };
        let err = ProducerMode::resolve(&selection, &owner, mgmt.as_ref()).unwrap_err();
        assert_eq!(err, ConfigError::ConflictingProducers);
    }

    #[test]
    fn test_resolve_members_requires_group() {
        let (mgmt, owner) = setup();
        let selection = ProducerSelection {
            from_members: Some(true),
            ..Default::default()
        };
        let err = ProducerMode::resolve(&selection, &owner, mgmt.as_ref()).unwrap_err();
        assert_eq!(err, ConfigError::NotAGroup(owner));
    }

    #[test]
    fn test_resolve_explicit_children_on_group() {
        let mgmt = Arc::new(LocalManagement::new());
        let group = mgmt.create_group(None).unwrap();
        let selection = ProducerSelection {
            from_children: Some(true),
            ..Default::default()
        };
        let mode = ProducerMode::resolve(&selection, &group, mgmt.as_ref()).unwrap();
        assert_eq!(mode, ProducerMode::Children(group));
    }

    #[test]
    fn test_resolve_explicit_members_beats_children() {
        let mgmt = Arc::new(LocalManagement::new());
        let group = mgmt.create_group(None).unwrap();
        let selection = ProducerSelection {
            from_members: Some(true),
            from_children: Some(true),
            ..Default::default()
        };
        let mode = ProducerMode::resolve(&selection, &group, mgmt.as_ref()).unwrap();
        assert_eq!(mode, ProducerMode::Members(group));
    }

    #[test]
    fn test_resolve_uses_explicit_producer() {
        let mgmt = Arc::new(LocalManagement::new());
        let owner = mgmt.create_entity(None).unwrap();
        let group = mgmt.create_group(None).unwrap();
        let selection = ProducerSelection {
            producer: Some(group.clone()),
            ..Default::default()
        };
        let mode = ProducerMode::resolve(&selection, &owner, mgmt.as_ref()).unwrap();
        assert_eq!(mode, ProducerMode::Members(group));
    }
}
