use super::base::{bind_listener, EnricherBase};
use super::error::{ConfigError, EnricherError};
use super::functions::{ReduceFn, Reduction};
use super::{Enricher, EnricherKind};
use crate::config::EnrichmentSettings;
use crate::entity::EntityId;
use crate::management::{Expression, Management, ResolveContext};
use crate::sensor::{Sensor, SensorEvent};
use anyhow::Result;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// A source sensor given directly or as an expression naming one
#[derive(Clone, Debug)]
pub enum SensorSource {
    Sensor(Sensor),
    /// Must resolve to a sensor name within the sensor resolve timeout
    Expression(Expression),
}

impl From<Sensor> for SensorSource {
    fn from(sensor: Sensor) -> Self {
        SensorSource::Sensor(sensor)
    }
}

impl From<Expression> for SensorSource {
    fn from(expression: Expression) -> Self {
        SensorSource::Expression(expression)
    }
}

/// Configuration for a reducer
#[derive(Clone, Default)]
pub struct ReducerConfig {
    /// Entity whose sensors are combined; defaults to the owner
    pub producer: Option<EntityId>,
    pub source_sensors: Vec<SensorSource>,
    pub target_sensor: Option<Sensor>,
    pub function: Option<ReduceFn>,
    pub function_name: Option<String>,
    /// Parameters of the named function (`format`, `separator`)
    pub parameters: Map<String, Value>,
    pub suppress_duplicates: Option<bool>,
    pub unique_tag: Option<String>,
}

impl fmt::Debug for ReducerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReducerConfig")
            .field("producer", &self.producer)
            .field("source_sensors", &self.source_sensors)
            .field("target_sensor", &self.target_sensor)
            .field("function", &self.function.is_some())
            .field("function_name", &self.function_name)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// Combines several sensors of one producer into one sensor on the owner
pub struct Reducer {
    base: EnricherBase,
    producer: EntityId,
    source_sensors: Vec<Sensor>,
    target_sensor: Sensor,
    reduction: Reduction,
}

impl Reducer {
    /// Resolve the source sensors, then subscribe to each of them
    ///
    /// Nothing is published until the first event arrives.
    pub fn attach(
        config: ReducerConfig,
        owner: &EntityId,
        management: Arc<dyn Management>,
        settings: &EnrichmentSettings,
    ) -> Result<Arc<Self>, EnricherError> {
        if config.source_sensors.is_empty() {
            return Err(ConfigError::EmptySourceSensors.into());
        }
        let target_sensor = config.target_sensor.ok_or(ConfigError::MissingTargetSensor)?;
        let reduction = Reduction::resolve(
            config.function_name.as_deref(),
            config.function,
            &config.parameters,
        )?;
        let producer = config.producer.unwrap_or_else(|| owner.clone());

        let context = ResolveContext::for_owner(owner.clone());
        let mut source_sensors: Vec<Sensor> = Vec::with_capacity(config.source_sensors.len());
        for source in &config.source_sensors {
            let sensor = resolve_sensor(source, management.as_ref(), &context, settings)?;
            if !source_sensors.contains(&sensor) {
                source_sensors.push(sensor);
            }
        }

        let tag = config.unique_tag.unwrap_or_else(|| {
            let names: Vec<&str> = source_sensors.iter().map(Sensor::name).collect();
            format!("reducer:[{}]", names.join(","))
        });
        let suppress = config
            .suppress_duplicates
            .unwrap_or(settings.suppress_duplicates);

        let reducer = Arc::new(Self {
            base: EnricherBase::new(owner.clone(), management, tag, suppress),
            producer,
            source_sensors,
            target_sensor,
            reduction,
        });

        for sensor in &reducer.source_sensors {
            reducer.base.subscribe(
                &reducer.producer,
                sensor,
                bind_listener(&reducer, |r: &Arc<Self>, event: &SensorEvent| r.on_event(event)),
            );
        }

        info!(
            tag = %reducer.base.tag(),
            owner = %owner,
            producer = %reducer.producer,
            sensors = reducer.source_sensors.len(),
            "Reducer attached"
        );
        Ok(reducer)
    }

    /// Current value of every source sensor, null where unset
    pub fn current_values(&self) -> Vec<Value> {
        let management = self.base.management();
        self.source_sensors
            .iter()
            .map(|sensor| {
                management
                    .current_value(&self.producer, sensor)
                    .unwrap_or(Value::Null)
            })
            .collect()
    }

    /// Re-read all sources and publish the reduction
    ///
    /// The triggering event only signals that something changed.
    pub fn on_event(&self, event: &SensorEvent) -> Result<()> {
        if !self.base.is_live() {
            return Ok(());
        }
        debug!(tag = %self.base.tag(), sensor = %event.sensor, "Reducing");
        let values = self.current_values();
        match self.reduction.apply(&values) {
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
}

fn resolve_sensor(
    source: &SensorSource,
    management: &dyn Management,
    context: &ResolveContext,
    settings: &EnrichmentSettings,
) -> Result<Sensor, ConfigError> {
    let expression = match source {
        SensorSource::Sensor(sensor) => return Ok(sensor.clone()),
        SensorSource::Expression(expression) => expression,
    };
    let resolved = management
        .resolve_with_timeout(expression, context, settings.sensor_resolve_timeout())
        .ok_or_else(|| ConfigError::UnresolvedSourceSensor(format!("{:?} timed out", expression)))?;
    let name = resolved.as_str().ok_or_else(|| {
        ConfigError::UnresolvedSourceSensor(format!("{} is not a sensor name", resolved))
    })?;
    Sensor::parse(name).map_err(|e| ConfigError::UnresolvedSourceSensor(e.to_string()))
}

impl Enricher for Reducer {
    fn tag(&self) -> &str {
        self.base.tag()
    }

    fn kind(&self) -> EnricherKind {
        EnricherKind::Reducer
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
