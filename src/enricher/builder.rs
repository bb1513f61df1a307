use super::aggregator::{Aggregator, AggregatorConfig};
use super::combiner::{Combiner, CombinerConfig};
use super::error::EnricherError;
use super::functions::{QuorumCheck, ValueFilter, ValuePredicate};
use super::joiner::{joiner_config, JoinOptions};
use super::propagator::{Propagator, PropagatorConfig};
use super::reducer::{Reducer, ReducerConfig, SensorSource};
use super::transformer::{Transformer, TransformerConfig};
use super::updating_map::{UpdatingMap, UpdatingMapConfig};
use super::{Enricher, EnricherKind};
use crate::config::EnrichmentSettings;
use crate::entity::EntityId;
use crate::management::{Expression, Management};
use crate::sensor::{Sensor, SensorEvent};
use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;

/// Entry point of the fluent configuration API
///
/// ```ignore
/// let spec = Enrichers::builder()
///     .aggregating(Sensor::new("load"))
///     .publishing(Sensor::new("load.total"))
///     .computing_sum()
///     .build();
/// let enricher = spec.attach(&cluster, management, &settings)?;
/// ```
pub struct Enrichers;

impl Enrichers {
    pub fn builder() -> EnricherBuilder {
        EnricherBuilder
    }
}

/// Chooses the kind of enricher being configured
pub struct EnricherBuilder;

impl EnricherBuilder {
    pub fn aggregating(self, sensor: Sensor) -> AggregatorBuilder {
        AggregatorBuilder {
            config: AggregatorConfig {
                source_sensor: Some(sensor),
                ..Default::default()
            },
        }
    }

    pub fn transforming(self, sensor: Sensor) -> TransformerBuilder {
        TransformerBuilder {
            config: TransformerConfig {
                source_sensor: Some(sensor),
                ..Default::default()
            },
        }
    }

    pub fn reducing<I, S>(self, sensors: I) -> ReducerBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<SensorSource>,
    {
        ReducerBuilder {
            config: ReducerConfig {
                source_sensors: sensors.into_iter().map(Into::into).collect(),
                ..Default::default()
            },
        }
    }

    /// Copy sensors under their own names
    pub fn propagating<I: IntoIterator<Item = Sensor>>(self, sensors: I) -> PropagatorBuilder {
        self.propagating_as(sensors.into_iter().map(|s| (s.clone(), s)))
    }

    /// Copy sensors under new names: `(source, target)` pairs
    pub fn propagating_as<I: IntoIterator<Item = (Sensor, Sensor)>>(self, mapping: I) -> PropagatorBuilder {
        PropagatorBuilder {
            config: PropagatorConfig {
                mapping: mapping.into_iter().collect(),
                ..Default::default()
            },
        }
    }

    /// Copy every attribute of the producer under its own name
    pub fn propagating_all(self) -> PropagatorBuilder {
        self.propagating_all_but(Vec::new())
    }

    /// Copy every attribute of the producer except `excluded`
    pub fn propagating_all_but<I: IntoIterator<Item = Sensor>>(self, excluded: I) -> PropagatorBuilder {
        PropagatorBuilder {
            config: PropagatorConfig {
                propagating_all: true,
                excluding: excluded.into_iter().collect(),
                ..Default::default()
            },
        }
    }

    /// Aggregate several sensors of a single producer
    pub fn combining<I: IntoIterator<Item = Sensor>>(self, sensors: I) -> CombinerBuilder {
        CombinerBuilder {
            config: CombinerConfig {
                source_sensors: sensors.into_iter().collect(),
                ..Default::default()
            },
        }
    }

    /// Maintain one entry of the map-valued `target` on the owner
    pub fn updating_map(self, target: Sensor) -> UpdatingMapBuilder {
        UpdatingMapBuilder {
            config: UpdatingMapConfig {
                target_sensor: Some(target),
                ..Default::default()
            },
        }
    }

    pub fn joining(self, sensor: Sensor) -> JoinerBuilder {
        JoinerBuilder {
            producer: None,
            source: sensor,
            target: None,
            options: JoinOptions::default(),
        }
    }
}

pub struct AggregatorBuilder {
    config: AggregatorConfig,
}

impl AggregatorBuilder {
    pub fn publishing(mut self, sensor: Sensor) -> Self {
        self.config.target_sensor = Some(sensor);
        self
    }

    pub fn from(mut self, producer: EntityId) -> Self {
        self.config.producers.producer = Some(producer);
        self
    }

    pub fn from_members(mut self) -> Self {
        self.config.producers.from_members = Some(true);
        self
    }

    pub fn from_children(mut self) -> Self {
        self.config.producers.from_children = Some(true);
        self
    }

    pub fn from_hardcoded_producers<I: IntoIterator<Item = EntityId>>(mut self, producers: I) -> Self {
        self.config.producers.hardcoded = Some(producers.into_iter().collect());
        self
    }

    pub fn entity_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&EntityId) -> bool + Send + Sync + 'static,
    {
        self.config.producers.entity_filter = Some(Arc::new(filter));
        self
    }

    pub fn value_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        let predicate: ValuePredicate = Arc::new(filter);
        self.config.value_filter = ValueFilter::Custom(predicate);
        self
    }

    pub fn excluding_blank(mut self) -> Self {
        self.config.value_filter = ValueFilter::ExcludeBlank;
        self
    }

    pub fn default_value_for_unreported_sensors(mut self, value: Value) -> Self {
        self.config.default_member_value = Some(value);
        self
    }

    pub fn value_to_report_if_no_sensors(mut self, value: Value) -> Self {
        self.config.value_to_report_if_no_sensors = Some(value);
        self
    }

    pub fn computing<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.config.transformation = Some(Arc::new(f));
        self
    }

    /// Named transformation: `list`, `sum` or `average`
    pub fn transformation(mut self, name: &str) -> Self {
        self.config.transformation_name = Some(name.to_string());
        self
    }

    pub fn computing_sum(self) -> Self {
        self.transformation("sum")
    }

    pub fn computing_average(self) -> Self {
        self.transformation("average")
    }

    pub fn computing_list(self) -> Self {
        self.transformation("list")
    }

    /// Publish whether enough producers report `true`
    pub fn computing_quorate(mut self, check: QuorumCheck, total_size: Option<usize>) -> Self {
        self.config.transformation = Some(check.computing(total_size));
        self
    }

    pub fn suppress_duplicates(mut self, suppress: bool) -> Self {
        self.config.suppress_duplicates = Some(suppress);
        self
    }

    pub fn unique_tag(mut self, tag: impl Into<String>) -> Self {
        self.config.unique_tag = Some(tag.into());
        self
    }

    pub fn build(self) -> EnricherSpec {
        EnricherSpec::Aggregator(self.config)
    }
}

pub struct TransformerBuilder {
    config: TransformerConfig,
}

impl TransformerBuilder {
    pub fn publishing(mut self, sensor: Sensor) -> Self {
        self.config.target_sensor = Some(sensor);
        self
    }

    pub fn from(mut self, producer: EntityId) -> Self {
        self.config.producer = Some(producer);
        self
    }

    /// Transform the event value
    pub fn computing<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.config.from_value = Some(Arc::new(f));
        self
    }

    pub fn computing_from_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&SensorEvent) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.config.from_event = Some(Arc::new(f));
        self
    }

    pub fn target_value(mut self, expression: impl Into<Expression>) -> Self {
        self.config.target_value = Some(expression.into());
        self
    }

    pub fn allow_cyclic_publishing(mut self) -> Self {
        self.config.allow_cyclic_publishing = true;
        self
    }

    pub fn suppress_duplicates(mut self, suppress: bool) -> Self {
        self.config.suppress_duplicates = Some(suppress);
        self
    }

    pub fn unique_tag(mut self, tag: impl Into<String>) -> Self {
        self.config.unique_tag = Some(tag.into());
        self
    }

    pub fn build(self) -> EnricherSpec {
        EnricherSpec::Transformer(self.config)
    }
}

pub struct ReducerBuilder {
    config: ReducerConfig,
}

impl ReducerBuilder {
    pub fn publishing(mut self, sensor: Sensor) -> Self {
        self.config.target_sensor = Some(sensor);
        self
    }

    pub fn from(mut self, producer: EntityId) -> Self {
        self.config.producer = Some(producer);
        self
    }

    pub fn computing<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.config.function = Some(Arc::new(f));
        self
    }

    /// Named function: `joiner`, `sum` or `list`
    pub fn function(mut self, name: &str) -> Self {
        self.config.function_name = Some(name.to_string());
        self
    }

    pub fn parameter(mut self, key: &str, value: Value) -> Self {
        self.config.parameters.insert(key.to_string(), value);
        self
    }

    pub fn suppress_duplicates(mut self, suppress: bool) -> Self {
        self.config.suppress_duplicates = Some(suppress);
        self
    }

    pub fn unique_tag(mut self, tag: impl Into<String>) -> Self {
        self.config.unique_tag = Some(tag.into());
        self
    }

    pub fn build(self) -> EnricherSpec {
        EnricherSpec::Reducer(self.config)
    }
}

pub struct PropagatorBuilder {
    config: PropagatorConfig,
}

impl PropagatorBuilder {
    pub fn from(mut self, producer: EntityId) -> Self {
        self.config.producer = Some(producer);
        self
    }

    pub fn allow_cyclic_publishing(mut self) -> Self {
        self.config.allow_cyclic_publishing = true;
        self
    }

    pub fn suppress_duplicates(mut self, suppress: bool) -> Self {
        self.config.suppress_duplicates = Some(suppress);
        self
    }

    pub fn unique_tag(mut self, tag: impl Into<String>) -> Self {
        self.config.unique_tag = Some(tag.into());
        self
    }

    pub fn build(self) -> EnricherSpec {
        EnricherSpec::Propagator(self.config)
    }
}

pub struct CombinerBuilder {
    config: CombinerConfig,
}

impl CombinerBuilder {
    pub fn publishing(mut self, sensor: Sensor) -> Self {
        self.config.target_sensor = Some(sensor);
        self
    }

    pub fn from(mut self, producer: EntityId) -> Self {
        self.config.producer = Some(producer);
        self
    }

    pub fn value_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        let predicate: ValuePredicate = Arc::new(filter);
        self.config.value_filter = ValueFilter::Custom(predicate);
        self
    }

    pub fn excluding_blank(mut self) -> Self {
        self.config.value_filter = ValueFilter::ExcludeBlank;
        self
    }

    pub fn default_value_for_unreported_sensors(mut self, value: Value) -> Self {
        self.config.default_value_for_unreported = Some(value);
        self
    }

    pub fn value_to_report_if_no_sensors(mut self, value: Value) -> Self {
        self.config.value_to_report_if_no_sensors = Some(value);
        self
    }

    pub fn computing<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.config.transformation = Some(Arc::new(f));
        self
    }

    /// Named transformation: `list`, `sum` or `average`
    pub fn transformation(mut self, name: &str) -> Self {
        self.config.transformation_name = Some(name.to_string());
        self
    }

    pub fn computing_sum(self) -> Self {
        self.transformation("sum")
    }

    pub fn computing_average(self) -> Self {
        self.transformation("average")
    }

    pub fn computing_quorate(mut self, check: QuorumCheck, total_size: Option<usize>) -> Self {
        self.config.transformation = Some(check.computing(total_size));
        self
    }

    pub fn suppress_duplicates(mut self, suppress: bool) -> Self {
        self.config.suppress_duplicates = Some(suppress);
        self
    }

    pub fn unique_tag(mut self, tag: impl Into<String>) -> Self {
        self.config.unique_tag = Some(tag.into());
        self
    }

    pub fn build(self) -> EnricherSpec {
        EnricherSpec::Combiner(self.config)
    }
}

pub struct UpdatingMapBuilder {
    config: UpdatingMapConfig,
}

impl UpdatingMapBuilder {
    pub fn from(mut self, sensor: Sensor) -> Self {
        self.config.source_sensor = Some(sensor);
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.config.key = Some(key.into());
        self
    }

    /// Value stored under the key; returning `None` leaves the map as is
    pub fn computing<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.config.computing = Some(Arc::new(f));
        self
    }

    pub fn removing_if_result_is_null(mut self, removing: bool) -> Self {
        self.config.removing_if_result_is_null = Some(removing);
        self
    }

    pub fn unique_tag(mut self, tag: impl Into<String>) -> Self {
        self.config.unique_tag = Some(tag.into());
        self
    }

    pub fn build(self) -> EnricherSpec {
        EnricherSpec::UpdatingMap(self.config)
    }
}

pub struct JoinerBuilder {
    producer: Option<EntityId>,
    source: Sensor,
    target: Option<Sensor>,
    options: JoinOptions,
}

impl JoinerBuilder {
    pub fn publishing(mut self, sensor: Sensor) -> Self {
        self.target = Some(sensor);
        self
    }

    pub fn from(mut self, producer: EntityId) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.options.separator = separator.into();
        self
    }

    pub fn quote(mut self, quote: bool) -> Self {
        self.options.quote = quote;
        self
    }

    pub fn minimum(mut self, minimum: usize) -> Self {
        self.options.minimum = Some(minimum);
        self
    }

    pub fn maximum(mut self, maximum: usize) -> Self {
        self.options.maximum = Some(maximum);
        self
    }

    pub fn build(self) -> EnricherSpec {
        EnricherSpec::Transformer(joiner_config(
            self.producer,
            self.source,
            self.target,
            self.options,
        ))
    }
}

/// A fully configured enricher, ready to attach to an owner
#[derive(Clone, Debug)]
pub enum EnricherSpec {
    Aggregator(AggregatorConfig),
    Transformer(TransformerConfig),
    Reducer(ReducerConfig),
    Propagator(PropagatorConfig),
    Combiner(CombinerConfig),
    UpdatingMap(UpdatingMapConfig),
}

impl EnricherSpec {
    pub fn kind(&self) -> EnricherKind {
        match self {
            EnricherSpec::Aggregator(_) => EnricherKind::Aggregator,
            EnricherSpec::Transformer(_) => EnricherKind::Transformer,
            EnricherSpec::Reducer(_) => EnricherKind::Reducer,
            EnricherSpec::Propagator(_) => EnricherKind::Propagator,
            EnricherSpec::Combiner(_) => EnricherKind::Combiner,
            EnricherSpec::UpdatingMap(_) => EnricherKind::UpdatingMap,
        }
    }

    pub fn attach(
        self,
        owner: &EntityId,
        management: Arc<dyn Management>,
        settings: &EnrichmentSettings,
    ) -> Result<Arc<dyn Enricher>, EnricherError> {
        let enricher: Arc<dyn Enricher> = match self {
            EnricherSpec::Aggregator(config) => {
                Aggregator::attach(config, owner, management, settings)?
            }
            EnricherSpec::Transformer(config) => {
                Transformer::attach(config, owner, management, settings)?
            }
            EnricherSpec::Reducer(config) => Reducer::attach(config, owner, management, settings)?,
            EnricherSpec::Propagator(config) => {
                Propagator::attach(config, owner, management, settings)?
            }
            EnricherSpec::Combiner(config) => Combiner::attach(config, owner, management, settings)?,
            EnricherSpec::UpdatingMap(config) => {
                UpdatingMap::attach(config, owner, management, settings)?
            }
        };
        Ok(enricher)
    }
}
