use super::base::{bind_listener, EnricherBase};
use super::error::{ConfigError, EnricherError};
use super::{Enricher, EnricherKind};
use crate::config::EnrichmentSettings;
use crate::entity::EntityId;
use crate::management::{Expression, Management, ResolveContext};
use crate::sensor::{Sensor, SensorEvent};
use anyhow::Result;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Maps a whole event to a new value; None means "no change"
pub type EventFn = Arc<dyn Fn(&SensorEvent) -> Result<Option<Value>> + Send + Sync>;

/// Maps the event value to a new value; None means "no change"
pub type ValueFn = Arc<dyn Fn(&Value) -> Result<Option<Value>> + Send + Sync>;

/// Configuration for a transformer; exactly one strategy must be set
#[derive(Clone, Default)]
pub struct TransformerConfig {
    /// Entity to watch; defaults to the owner
    pub producer: Option<EntityId>,
    pub source_sensor: Option<Sensor>,
    /// Sensor to publish on the owner; defaults to the source sensor
    pub target_sensor: Option<Sensor>,
    pub from_event: Option<EventFn>,
    pub from_value: Option<ValueFn>,
    /// Resolved afresh for every event, bounded by the resolve timeout
    pub target_value: Option<Expression>,
    /// Permit publishing onto the sensor being watched
    pub allow_cyclic_publishing: bool,
    pub suppress_duplicates: Option<bool>,
    pub unique_tag: Option<String>,
}

impl fmt::Debug for TransformerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformerConfig")
            .field("producer", &self.producer)
            .field("source_sensor", &self.source_sensor)
            .field("target_sensor", &self.target_sensor)
            .field("from_event", &self.from_event.is_some())
            .field("from_value", &self.from_value.is_some())
            .field("target_value", &self.target_value)
            .field("allow_cyclic_publishing", &self.allow_cyclic_publishing)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
enum Strategy {
    FromEvent(EventFn),
    FromValue(ValueFn),
    TargetValue(Expression),
}

impl Strategy {
    fn select(config: &TransformerConfig) -> Result<Self, ConfigError> {
        let set = [
            config.from_event.is_some(),
            config.from_value.is_some(),
            config.target_value.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();

        match (&config.from_event, &config.from_value, &config.target_value) {
            (Some(f), None, None) => Ok(Strategy::FromEvent(f.clone())),
            (None, Some(f), None) => Ok(Strategy::FromValue(f.clone())),
            (None, None, Some(expr)) => Ok(Strategy::TargetValue(expr.clone())),
            _ => Err(ConfigError::TransformationCount(set)),
        }
    }
}

/// Republishes one sensor of a producer, transformed, on the owner
pub struct Transformer {
    base: EnricherBase,
    producer: EntityId,
    source_sensor: Sensor,
    target_sensor: Sensor,
    strategy: Strategy,
    resolve_timeout: Duration,
}

impl Transformer {
    /// Validate, subscribe, and publish once if the producer already has a value
    ///
    /// Watching and publishing the same sensor on the owner is refused
    /// unless cyclic publishing is allowed: the transformer is returned
    /// inert instead.
    pub fn attach(
        config: TransformerConfig,
        owner: &EntityId,
        management: Arc<dyn Management>,
        settings: &EnrichmentSettings,
    ) -> Result<Arc<Self>, EnricherError> {
        let strategy = Strategy::select(&config)?;
        let source_sensor = config.source_sensor.ok_or(ConfigError::EmptySourceSensors)?;
        let target_sensor = config.target_sensor.unwrap_or_else(|| source_sensor.clone());
        let producer = config.producer.unwrap_or_else(|| owner.clone());

        let tag = config
            .unique_tag
            .unwrap_or_else(|| format!("transformer:{}", target_sensor));
        let suppress = config
            .suppress_duplicates
            .unwrap_or(settings.suppress_duplicates);

        let transformer = Arc::new(Self {
            base: EnricherBase::new(owner.clone(), management, tag, suppress),
            producer,
            source_sensor,
            target_sensor,
            strategy,
            resolve_timeout: settings.resolve_timeout(),
        });

        if transformer.is_self_referencing() && !config.allow_cyclic_publishing {
            error!(
                tag = %transformer.base.tag(),
                owner = %owner,
                sensor = %transformer.source_sensor,
                "Transformer would publish onto its own source sensor; not subscribing"
            );
            transformer.base.destroy();
            return Ok(transformer);
        }

        transformer.base.subscribe(
            &transformer.producer,
            &transformer.source_sensor,
            bind_listener(&transformer, |t: &Arc<Self>, event: &SensorEvent| t.on_event(event)),
        );

        let current = transformer
            .base
            .management()
            .current_value(&transformer.producer, &transformer.source_sensor);
        if let Some(value) = current.filter(|v| !v.is_null()) {
            let event = SensorEvent::new(
                transformer.producer.clone(),
                transformer.source_sensor.clone(),
                value,
            );
            if let Err(e) = transformer.on_event(&event) {
                debug!(tag = %transformer.base.tag(), error = %e, "Initial transform failed");
            }
        }

        info!(
            tag = %transformer.base.tag(),
            owner = %owner,
            producer = %transformer.producer,
            "Transformer attached"
        );
        Ok(transformer)
    }

    fn is_self_referencing(&self) -> bool {
        self.producer == *self.base.owner() && self.target_sensor == self.source_sensor
    }

    /// Value to publish for `event`; None means nothing is published
    pub fn compute(&self, event: &SensorEvent) -> Result<Option<Value>> {
        match &self.strategy {
            Strategy::FromEvent(f) => f(event),
            Strategy::FromValue(f) => f(&event.value),
            Strategy::TargetValue(expression) => {
                let context = ResolveContext::with_event(self.base.owner().clone(), event.clone());
                let resolved = self.base.management().resolve_with_timeout(
                    expression,
                    &context,
                    self.resolve_timeout,
                );
                if resolved.is_none() {
                    debug!(tag = %self.base.tag(), "Target value did not resolve in time");
                }
                Ok(resolved)
            }
        }
    }

    pub fn on_event(&self, event: &SensorEvent) -> Result<()> {
        if !self.base.is_live() {
            return Ok(());
        }
        match self.compute(event) {
            Ok(Some(value)) => self
                .base
                .emit(&self.target_sensor, value)
                .map_err(|e| self.base.computation_failed(e)),
            Ok(None) => Ok(()),
            Err(e) => Err(self.base.computation_failed(e)),
        }
    }

    pub fn producer(&self) -> &EntityId {
        &self.producer
    }

    pub fn target_sensor(&self) -> &Sensor {
        &self.target_sensor
    }
}

impl Enricher for Transformer {
    fn tag(&self) -> &str {
        self.base.tag()
    }

    fn kind(&self) -> EnricherKind {
        EnricherKind::Transformer
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
