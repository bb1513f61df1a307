use super::base::{bind_listener, EnricherBase};
use super::error::{ConfigError, EnricherError};
use super::transformer::ValueFn;
use super::{Enricher, EnricherKind};
use crate::config::EnrichmentSettings;
use crate::entity::EntityId;
use crate::management::Management;
use crate::sensor::{Sensor, SensorEvent};
use anyhow::{bail, Result};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Configuration for an updating map
#[derive(Clone, Default)]
pub struct UpdatingMapConfig {
    pub source_sensor: Option<Sensor>,
    /// Map-valued sensor on the owner
    pub target_sensor: Option<Sensor>,
    /// Entry maintained in the map; defaults to the source sensor name
    pub key: Option<String>,
    /// Value stored for the key; the source value itself when unset.
    /// `None` leaves the map untouched.
    pub computing: Option<ValueFn>,
    /// Drop the entry when the computed value is null (default true)
    pub removing_if_result_is_null: Option<bool>,
    pub unique_tag: Option<String>,
}

impl fmt::Debug for UpdatingMapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdatingMapConfig")
            .field("source_sensor", &self.source_sensor)
            .field("target_sensor", &self.target_sensor)
            .field("key", &self.key)
            .field("computing", &self.computing.is_some())
            .field("removing_if_result_is_null", &self.removing_if_result_is_null)
            .finish_non_exhaustive()
    }
}

/// Maintains one entry of a map-valued sensor on the owner from another of its sensors
///
/// Several updating maps may share a target; each owns only its key.
pub struct UpdatingMap {
    base: EnricherBase,
    source_sensor: Sensor,
    target_sensor: Sensor,
    key: String,
    computing: Option<ValueFn>,
    removing_if_null: bool,
}

impl UpdatingMap {
    pub fn attach(
        config: UpdatingMapConfig,
        owner: &EntityId,
        management: Arc<dyn Management>,
        _settings: &EnrichmentSettings,
    ) -> Result<Arc<Self>, EnricherError> {
        let source_sensor = config.source_sensor.ok_or(ConfigError::EmptySourceSensors)?;
        let target_sensor = config.target_sensor.ok_or(ConfigError::MissingTargetSensor)?;
        let key = config
            .key
            .unwrap_or_else(|| source_sensor.name().to_string());

        let tag = config
            .unique_tag
            .unwrap_or_else(|| format!("updating:{}<-{}", target_sensor, source_sensor));

        let map = Arc::new(Self {
            // Unchanged maps are never republished
            base: EnricherBase::new(owner.clone(), management, tag, false),
            source_sensor,
            target_sensor,
            key,
            computing: config.computing,
            removing_if_null: config.removing_if_result_is_null.unwrap_or(true),
        });

        if map.source_sensor == map.target_sensor {
            error!(
                tag = %map.base.tag(),
                owner = %owner,
                "Updating map would publish onto its own source; not subscribing"
            );
            map.base.destroy();
            return Ok(map);
        }

        map.base.subscribe(
            owner,
            &map.source_sensor,
            bind_listener(&map, |m: &Arc<Self>, event: &SensorEvent| m.on_event(event)),
        );

        if let Some(current) = map.base.management().current_value(owner, &map.source_sensor) {
            if let Err(e) = map.apply(&current) {
                debug!(tag = %map.base.tag(), error = %e, "Initial map update failed");
            }
        }

        info!(
            tag = %map.base.tag(),
            owner = %owner,
            key = %map.key,
            "Updating map attached"
        );
        Ok(map)
    }

    pub fn on_event(&self, event: &SensorEvent) -> Result<()> {
        if !self.base.is_live() {
            return Ok(());
        }
        self.apply(&event.value)
    }

    /// Compute the entry for `source` and republish the map if it changed
    ///
    /// The map is rewritten atomically, so updating maps sharing a target
    /// never drop each other's entries.
    fn apply(&self, source: &Value) -> Result<()> {
        let computed = match &self.computing {
            Some(f) => f(source).map_err(|e| self.base.computation_failed(e))?,
            None => Some(source.clone()),
        };
        let Some(computed) = computed else {
            return Ok(());
        };

        let target = &self.target_sensor;
        let key = &self.key;
        let removing = computed.is_null() && self.removing_if_null;
        let mut update = |current: Option<&Value>| -> Result<Option<Value>> {
            let mut map = match current {
                None | Some(Value::Null) => Map::new(),
                Some(Value::Object(map)) => map.clone(),
                Some(other) => bail!("target {} holds {}, not a map", target, other),
            };
            let changed = if removing {
                map.remove(key).is_some()
            } else {
                map.insert(key.clone(), computed.clone()).as_ref() != Some(&computed)
            };
            Ok(changed.then_some(Value::Object(map)))
        };

        let published = self
            .base
            .modify(target, &mut update)
            .map_err(|e| self.base.computation_failed(e))?;
        if !published {
            debug!(tag = %self.base.tag(), key = %self.key, "Map entry unchanged");
        }
        Ok(())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn target_sensor(&self) -> &Sensor {
        &self.target_sensor
    }
}

impl Enricher for UpdatingMap {
    fn tag(&self) -> &str {
        self.base.tag()
    }

    fn kind(&self) -> EnricherKind {
        EnricherKind::UpdatingMap
    }

    fn owner(&self) -> &EntityId {
        self.base.owner()
    }

    fn is_live(&self) -> bool {
        self.base.is_live()
    }

    fn destroy(&self) {
        self.base.destroy();
    }
}
