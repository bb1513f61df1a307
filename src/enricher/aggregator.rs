use super::base::EnricherBase;
use super::error::{ConfigError, EnricherError};
use super::functions::{AggregateFn, Aggregation, NumericDefaults, ValueFilter};
use super::producers::{ProducerMode, ProducerSelection, ProducerTracker, ProducerUnit};
use super::value_store::ValueStore;
use super::{Enricher, EnricherKind};
use crate::config::EnrichmentSettings;
use crate::entity::EntityId;
use crate::management::Management;
use crate::sensor::{Sensor, SensorEvent};
use anyhow::Result;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Configuration for an aggregator
#[derive(Clone, Default)]
pub struct AggregatorConfig {
    pub producers: ProducerSelection,
    pub source_sensor: Option<Sensor>,
    pub target_sensor: Option<Sensor>,
    pub value_filter: ValueFilter,
    /// Seed for producers that have not reported yet
    pub default_member_value: Option<Value>,
    /// Result of sum/average when no input remains
    pub value_to_report_if_no_sensors: Option<Value>,
    pub transformation_name: Option<String>,
    pub transformation: Option<AggregateFn>,
    pub suppress_duplicates: Option<bool>,
    pub unique_tag: Option<String>,
}

impl fmt::Debug for AggregatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatorConfig")
            .field("producers", &self.producers)
            .field("source_sensor", &self.source_sensor)
            .field("target_sensor", &self.target_sensor)
            .field("value_filter", &self.value_filter)
            .field("default_member_value", &self.default_member_value)
            .field("transformation_name", &self.transformation_name)
            .field("transformation", &self.transformation.is_some())
            .finish_non_exhaustive()
    }
}

/// Combines one sensor across a dynamic set of producers into one sensor on the owner
pub struct Aggregator {
    base: EnricherBase,
    tracker: ProducerTracker,
    source_sensor: Sensor,
    target_sensor: Sensor,
    values: ValueStore,
    value_filter: ValueFilter,
    default_member_value: Option<Value>,
    aggregation: Aggregation,
    defaults: NumericDefaults,
}

impl Aggregator {
    /// Validate the configuration, subscribe and seed the initial producers
    ///
    /// Failures of the initial computation are logged; the aggregator is
    /// still returned live.
    pub fn attach(
        config: AggregatorConfig,
        owner: &EntityId,
        management: Arc<dyn Management>,
        settings: &EnrichmentSettings,
    ) -> Result<Arc<Self>, EnricherError> {
        let source_sensor = config.source_sensor.ok_or(ConfigError::EmptySourceSensors)?;
        let target_sensor = config.target_sensor.ok_or(ConfigError::MissingTargetSensor)?;
        let mode = ProducerMode::resolve(&config.producers, owner, management.as_ref())?;
        let aggregation = Aggregation::resolve(
            config.transformation_name.as_deref(),
            config.transformation,
        )?;

        let tag = config
            .unique_tag
            .unwrap_or_else(|| format!("aggregator:{}", target_sensor));
        let suppress = config
            .suppress_duplicates
            .unwrap_or(settings.suppress_duplicates);

        let aggregator = Arc::new(Self {
            base: EnricherBase::new(owner.clone(), management, tag, suppress),
            tracker: ProducerTracker::new(mode, config.producers.entity_filter),
            source_sensor,
            target_sensor,
            values: ValueStore::new(),
            value_filter: config.value_filter,
            defaults: NumericDefaults {
                value_if_null: config.default_member_value.clone(),
                value_if_none: config.value_to_report_if_no_sensors,
            },
            default_member_value: config.default_member_value,
            aggregation,
        });

        if let Err(e) = aggregator.tracker.start(&aggregator) {
            debug!(tag = %aggregator.base.tag(), error = %e, "Initial aggregation failed");
        }

        info!(
            tag = %aggregator.base.tag(),
            owner = %owner,
            mode = %aggregator.tracker.mode(),
            producers = aggregator.values.len(),
            "Aggregator attached"
        );
        Ok(aggregator)
    }

    /// Apply the filter and aggregation to the current values
    ///
    /// Runs under the value store lock, so it sees one consistent state.
    pub fn compute(&self) -> Result<Option<Value>> {
        self.values.with_values(|values| {
            let filtered: Vec<Value> = values
                .values()
                .filter(|v| self.value_filter.accepts(v))
                .cloned()
                .collect();
            self.aggregation.apply(&filtered, &self.defaults)
        })
    }

    pub fn tracked_producers(&self) -> Vec<EntityId> {
        self.values.producers()
    }

    pub fn source_sensor(&self) -> &Sensor {
        &self.source_sensor
    }

    pub fn target_sensor(&self) -> &Sensor {
        &self.target_sensor
    }

    pub fn mode(&self) -> &ProducerMode {
        self.tracker.mode()
    }

    fn initial_value(&self, producer: &EntityId) -> Value {
        self.base
            .management()
            .current_value(producer, &self.source_sensor)
            .filter(|v| !v.is_null())
            .or_else(|| self.default_member_value.clone())
            .unwrap_or(Value::Null)
    }
}

impl ProducerUnit for Aggregator {
    fn base(&self) -> &EnricherBase {
        &self.base
    }

    fn tracker(&self) -> &ProducerTracker {
        &self.tracker
    }

    fn source_sensor(&self) -> &Sensor {
        &self.source_sensor
    }

    fn is_tracking(&self, producer: &EntityId) -> bool {
        self.values.contains(producer)
    }

    fn on_producer_added(&self, producer: &EntityId) -> bool {
        let added = self
            .values
            .seed_with(producer.clone(), || self.initial_value(producer));
        if added {
            debug!(tag = %self.base.tag(), producer = %producer, "Tracking producer");
        }
        added
    }

    fn refresh_producer(&self, producer: &EntityId) {
        self.values
            .refresh_with(producer, || self.initial_value(producer));
    }

    fn on_producer_removed(&self, producer: &EntityId) -> Result<()> {
        if self.values.remove(producer).is_some() {
            debug!(tag = %self.base.tag(), producer = %producer, "Stopped tracking producer");
        }
        self.on_updated()
    }

    fn on_event(&self, event: &SensorEvent) -> Result<()> {
        if !self.base.is_live() {
            return Ok(());
        }
        if !self.values.update(&event.source, event.value.clone()) {
            debug!(
                tag = %self.base.tag(),
                producer = %event.source,
                "Ignoring event from untracked producer"
            );
            return Ok(());
        }
        self.on_updated()
    }

    fn on_updated(&self) -> Result<()> {
        if !self.base.is_live() {
            return Ok(());
        }
        match self.compute() {
            Ok(Some(value)) => self
                .base
                .emit(&self.target_sensor, value)
                .map_err(|e| self.base.computation_failed(e)),
            Ok(None) => Ok(()),
            Err(e) => Err(self.base.computation_failed(e)),
        }
    }
}

impl Enricher for Aggregator {
    fn tag(&self) -> &str {
        self.base.tag()
    }

    fn kind(&self) -> EnricherKind {
        EnricherKind::Aggregator
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
