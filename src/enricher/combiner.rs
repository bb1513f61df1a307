use super::base::{bind_listener, EnricherBase};
use super::error::{ConfigError, EnricherError};
use super::functions::{AggregateFn, Aggregation, NumericDefaults, ValueFilter};
use super::{Enricher, EnricherKind};
use crate::config::EnrichmentSettings;
use crate::entity::EntityId;
use crate::management::Management;
use crate::sensor::{Sensor, SensorEvent};
use anyhow::Result;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info};

/// Configuration for a combiner
#[derive(Clone, Default)]
pub struct CombinerConfig {
    /// Entity whose sensors are combined; defaults to the owner
    pub producer: Option<EntityId>,
    pub source_sensors: Vec<Sensor>,
    pub target_sensor: Option<Sensor>,
    pub value_filter: ValueFilter,
    /// Stands in for sources that have not reported yet
    pub default_value_for_unreported: Option<Value>,
    /// Result of sum/average when no input remains
    pub value_to_report_if_no_sensors: Option<Value>,
    pub transformation_name: Option<String>,
    pub transformation: Option<AggregateFn>,
    pub suppress_duplicates: Option<bool>,
    pub unique_tag: Option<String>,
}

impl fmt::Debug for CombinerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CombinerConfig")
            .field("producer", &self.producer)
            .field("source_sensors", &self.source_sensors)
            .field("target_sensor", &self.target_sensor)
            .field("value_filter", &self.value_filter)
            .field("transformation_name", &self.transformation_name)
            .field("transformation", &self.transformation.is_some())
            .finish_non_exhaustive()
    }
}

/// Applies an aggregation to several sensors of one producer
///
/// Unlike the reducer, the combiner keeps the last value seen for each
/// source and applies the value filter and numeric defaults of an
/// aggregator.
pub struct Combiner {
    base: EnricherBase,
    producer: EntityId,
    source_sensors: Vec<Sensor>,
    target_sensor: Sensor,
    /// Last value per source, in source order
    values: Mutex<Vec<Value>>,
    value_filter: ValueFilter,
    default_value: Option<Value>,
    aggregation: Aggregation,
    defaults: NumericDefaults,
}

impl Combiner {
    pub fn attach(
        config: CombinerConfig,
        owner: &EntityId,
        management: Arc<dyn Management>,
        settings: &EnrichmentSettings,
    ) -> Result<Arc<Self>, EnricherError> {
        if config.source_sensors.is_empty() {
            return Err(ConfigError::EmptySourceSensors.into());
        }
        let target_sensor = config.target_sensor.ok_or(ConfigError::MissingTargetSensor)?;
        let aggregation = Aggregation::resolve(
            config.transformation_name.as_deref(),
            config.transformation,
        )?;
        let producer = config.producer.unwrap_or_else(|| owner.clone());

        let mut source_sensors: Vec<Sensor> = Vec::with_capacity(config.source_sensors.len());
        for sensor in config.source_sensors {
            if !source_sensors.contains(&sensor) {
                source_sensors.push(sensor);
            }
        }

        let tag = config
            .unique_tag
            .unwrap_or_else(|| format!("combiner:{}", target_sensor));
        let suppress = config
            .suppress_duplicates
            .unwrap_or(settings.suppress_duplicates);

        let combiner = Arc::new(Self {
            base: EnricherBase::new(owner.clone(), management, tag, suppress),
            producer,
            values: Mutex::new(vec![Value::Null; source_sensors.len()]),
            source_sensors,
            target_sensor,
            value_filter: config.value_filter,
            defaults: NumericDefaults {
                value_if_null: config.default_value_for_unreported.clone(),
                value_if_none: config.value_to_report_if_no_sensors,
            },
            default_value: config.default_value_for_unreported,
            aggregation,
        });

        if combiner.producer == *owner && combiner.source_sensors.contains(&combiner.target_sensor) {
            error!(
                tag = %combiner.base.tag(),
                owner = %owner,
                "Combiner would publish onto one of its own sources; not subscribing"
            );
            combiner.base.destroy();
            return Ok(combiner);
        }

        for sensor in &combiner.source_sensors {
            combiner.base.subscribe(
                &combiner.producer,
                sensor,
                bind_listener(&combiner, |c: &Arc<Self>, event: &SensorEvent| c.on_event(event)),
            );
        }

        // Seed after subscribing; anything published meanwhile is already current
        let reported = combiner.seed();
        if reported {
            if let Err(e) = combiner.on_updated() {
                debug!(tag = %combiner.base.tag(), error = %e, "Initial combination failed");
            }
        }

        info!(
            tag = %combiner.base.tag(),
            owner = %owner,
            producer = %combiner.producer,
            sensors = combiner.source_sensors.len(),
            "Combiner attached"
        );
        Ok(combiner)
    }

    /// Load current values; true if any source has reported
    fn seed(&self) -> bool {
        let management = self.base.management();
        let mut values = self.lock_values();
        let mut reported = false;
        for (slot, sensor) in values.iter_mut().zip(&self.source_sensors) {
            let current = management.current_value(&self.producer, sensor);
            reported |= current.is_some();
            *slot = current
                .filter(|v| !v.is_null())
                .or_else(|| self.default_value.clone())
                .unwrap_or(Value::Null);
        }
        reported
    }

    /// Apply the filter and aggregation to the last value of each source
    pub fn compute(&self) -> Result<Option<Value>> {
        let values = self.lock_values();
        let filtered: Vec<Value> = values
            .iter()
            .filter(|v| self.value_filter.accepts(v))
            .cloned()
            .collect();
        self.aggregation.apply(&filtered, &self.defaults)
    }

    pub fn on_event(&self, event: &SensorEvent) -> Result<()> {
        if !self.base.is_live() {
            return Ok(());
        }
        let Some(index) = self.source_sensors.iter().position(|s| *s == event.sensor) else {
            return Ok(());
        };
        self.lock_values()[index] = event.value.clone();
        self.on_updated()
    }

    fn on_updated(&self) -> Result<()> {
        match self.compute() {
            Ok(Some(value)) => self
                .base
                .emit(&self.target_sensor, value)
                .map_err(|e| self.base.computation_failed(e)),
            Ok(None) => Ok(()),
            Err(e) => Err(self.base.computation_failed(e)),
        }
    }

    pub fn source_sensors(&self) -> &[Sensor] {
        &self.source_sensors
    }

    pub fn target_sensor(&self) -> &Sensor {
        &self.target_sensor
    }

    fn lock_values(&self) -> MutexGuard<'_, Vec<Value>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Enricher for Combiner {
    fn tag(&self) -> &str {
        self.base.tag()
    }

    fn kind(&self) -> EnricherKind {
        EnricherKind::Combiner
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
