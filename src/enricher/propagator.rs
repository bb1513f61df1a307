use super::base::{bind_listener, EnricherBase};
use super::error::{ConfigError, EnricherError};
use super::{Enricher, EnricherKind};
use crate::config::EnrichmentSettings;
use crate::entity::EntityId;
use crate::management::Management;
use crate::sensor::{Sensor, SensorEvent};
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Configuration for a propagator
#[derive(Clone, Debug, Default)]
pub struct PropagatorConfig {
    /// Entity whose sensors are copied; defaults to the owner
    pub producer: Option<EntityId>,
    /// Source sensor on the producer, target sensor on the owner
    pub mapping: Vec<(Sensor, Sensor)>,
    /// Copy every attribute of the producer under its own name
    pub propagating_all: bool,
    /// Attributes left out when propagating all
    pub excluding: Vec<Sensor>,
    pub allow_cyclic_publishing: bool,
    pub suppress_duplicates: Option<bool>,
    pub unique_tag: Option<String>,
}

#[derive(Debug)]
enum Selection {
    Mapped(Vec<(Sensor, Sensor)>),
    All { excluding: Vec<Sensor> },
}

impl Selection {
    fn from_config(config: &PropagatorConfig) -> Result<Self, ConfigError> {
        match (config.propagating_all, config.mapping.is_empty()) {
            (true, true) => Ok(Selection::All {
                excluding: config.excluding.clone(),
            }),
            (true, false) => Err(ConfigError::ConflictingPropagation),
            (false, _) if !config.excluding.is_empty() => Err(ConfigError::ConflictingPropagation),
            (false, true) => Err(ConfigError::EmptySourceSensors),
            (false, false) => Ok(Selection::Mapped(config.mapping.clone())),
        }
    }

    fn summary(&self) -> String {
        match self {
            Selection::Mapped(mapping) => {
                let names: Vec<String> = mapping
                    .iter()
                    .map(|(source, target)| {
                        if source == target {
                            source.to_string()
                        } else {
                            format!("{}->{}", source, target)
                        }
                    })
                    .collect();
                names.join(",")
            }
            Selection::All { excluding } if excluding.is_empty() => "ALL".to_string(),
            Selection::All { excluding } => {
                let names: Vec<&str> = excluding.iter().map(|s| s.name()).collect();
                format!("ALL_BUT:{}", names.join(","))
            }
        }
    }

    /// Targets for a value of `source`; empty if it is not propagated
    fn targets_for<'a>(&'a self, source: &'a Sensor) -> Vec<&'a Sensor> {
        match self {
            Selection::Mapped(mapping) => mapping
                .iter()
                .filter(|(s, _)| s == source)
                .map(|(_, target)| target)
                .collect(),
            Selection::All { excluding } if excluding.contains(source) => Vec::new(),
            Selection::All { .. } => vec![source],
        }
    }
}

/// Copies sensors of a producer onto the owner, optionally renamed
///
/// Either an explicit mapping, or every attribute of the producer minus
/// an exclusion list. Membership notifications are never propagated.
pub struct Propagator {
    base: EnricherBase,
    producer: EntityId,
    selection: Selection,
}

impl Propagator {
    pub fn attach(
        config: PropagatorConfig,
        owner: &EntityId,
        management: Arc<dyn Management>,
        settings: &EnrichmentSettings,
    ) -> Result<Arc<Self>, EnricherError> {
        let selection = Selection::from_config(&config)?;
        let producer = config.producer.unwrap_or_else(|| owner.clone());

        let tag = config
            .unique_tag
            .unwrap_or_else(|| format!("propagating[{}:{}]", producer, selection.summary()));
        let suppress = config
            .suppress_duplicates
            .unwrap_or(settings.suppress_duplicates);

        let propagator = Arc::new(Self {
            base: EnricherBase::new(owner.clone(), management, tag, suppress),
            producer,
            selection,
        });

        let cyclic = propagator.producer == *owner
            && match &propagator.selection {
                Selection::Mapped(mapping) => mapping.iter().any(|(source, target)| source == target),
                Selection::All { .. } => true,
            };
        if cyclic && !config.allow_cyclic_publishing {
            error!(
                tag = %propagator.base.tag(),
                owner = %owner,
                "Propagator would republish a sensor onto itself; not subscribing"
            );
            propagator.base.destroy();
            return Ok(propagator);
        }

        let listener = |p: &Arc<Self>, event: &SensorEvent| p.on_event(event);
        match &propagator.selection {
            Selection::Mapped(mapping) => {
                for (source, _) in mapping {
                    propagator.base.subscribe(
                        &propagator.producer,
                        source,
                        bind_listener(&propagator, listener),
                    );
                }
            }
            Selection::All { .. } => {
                propagator
                    .base
                    .subscribe_to_all(&propagator.producer, bind_listener(&propagator, listener));
            }
        }

        let current: Vec<(Sensor, serde_json::Value)> = match &propagator.selection {
            Selection::Mapped(mapping) => mapping
                .iter()
                .filter_map(|(source, _)| {
                    propagator
                        .base
                        .management()
                        .current_value(&propagator.producer, source)
                        .map(|value| (source.clone(), value))
                })
                .collect(),
            Selection::All { .. } => propagator
                .base
                .management()
                .current_values(&propagator.producer)
                .into_iter()
                .filter(|(source, _)| !source.is_membership())
                .collect(),
        };
        let mut sensors = 0;
        for (source, value) in current {
            for target in propagator.selection.targets_for(&source) {
                sensors += 1;
                if let Err(e) = propagator.base.emit(target, value.clone()) {
                    debug!(tag = %propagator.base.tag(), error = %e, "Initial propagation failed");
                }
            }
        }

        info!(
            tag = %propagator.base.tag(),
            owner = %owner,
            producer = %propagator.producer,
            initial = sensors,
            "Propagator attached"
        );
        Ok(propagator)
    }

    pub fn on_event(&self, event: &SensorEvent) -> Result<()> {
        if !self.base.is_live() || event.sensor.is_membership() {
            return Ok(());
        }
        for target in self.selection.targets_for(&event.sensor) {
            self.base
                .emit(target, event.value.clone())
                .map_err(|e| self.base.computation_failed(e))?;
        }
        Ok(())
    }

    /// True when every attribute of the producer is copied
    pub fn is_propagating_all(&self) -> bool {
        matches!(self.selection, Selection::All { .. })
    }
}

impl Enricher for Propagator {
    fn tag(&self) -> &str {
        self.base.tag()
    }

    fn kind(&self) -> EnricherKind {
        EnricherKind::Propagator
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
