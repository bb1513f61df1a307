use crate::entity::EntityId;
use std::fmt;

/// Configuration problems detected while attaching an enricher
///
/// Any of these prevents the enricher from becoming live.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Hardcoded producers combined with a producer or dynamic tracking
    ConflictingProducers,
    /// Member tracking requested on an entity without members
    NotAGroup(EntityId),
    /// Transformer needs exactly one strategy; carries how many were set
    TransformationCount(usize),
    /// Both a named and a custom function were supplied
    ConflictingTransformation(String),
    /// Named function not known
    UnknownTransformation(String),
    /// Reducer or propagator without any source sensor
    EmptySourceSensors,
    /// Source sensor expression did not resolve to a valid sensor name
    UnresolvedSourceSensor(String),
    /// No target sensor configured
    MissingTargetSensor,
    /// Propagating all sensors combined with an explicit mapping, or
    /// exclusions given without propagating all
    ConflictingPropagation,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ConflictingProducers => write!(
                f,
                "hardcoded producers cannot be combined with a producer or member/child tracking"
            ),
            ConfigError::NotAGroup(id) => {
                write!(f, "member tracking requested but {} is not a group", id)
            }
            ConfigError::TransformationCount(n) => write!(
                f,
                "exactly one of from-event, from-value or target-value must be set, got {}",
                n
            ),
            ConfigError::ConflictingTransformation(name) => write!(
                f,
                "named transformation '{}' conflicts with a custom transformation",
                name
            ),
            ConfigError::UnknownTransformation(name) => {
                write!(f, "unknown transformation '{}'", name)
            }
            ConfigError::EmptySourceSensors => write!(f, "at least one source sensor is required"),
            ConfigError::UnresolvedSourceSensor(reason) => {
                write!(f, "source sensor could not be resolved: {}", reason)
            }
            ConfigError::MissingTargetSensor => write!(f, "target sensor is required"),
            ConfigError::ConflictingPropagation => write!(
                f,
                "propagate either all sensors (with optional exclusions) or an explicit mapping"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Errors surfaced by enrichers
#[derive(Debug)]
pub enum EnricherError {
    /// Fatal at attachment
    Config(ConfigError),
    /// A transformation or emission failed; the enricher stays live
    Computation { tag: String, source: anyhow::Error },
}

impl fmt::Display for EnricherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnricherError::Config(e) => write!(f, "invalid enricher configuration: {}", e),
            EnricherError::Computation { tag, source } => {
                write!(f, "enricher {} failed to compute: {}", tag, source)
            }
        }
    }
}

impl std::error::Error for EnricherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EnricherError::Config(e) => Some(e),
            EnricherError::Computation { source, .. } => Some(&**source),
        }
    }
}

impl From<ConfigError> for EnricherError {
    fn from(e: ConfigError) -> Self {
        EnricherError::Config(e)
    }
}

impl EnricherError {
    pub fn config(&self) -> Option<&ConfigError> {
        match self {
            EnricherError::Config(e) => Some(e),
            EnricherError::Computation { .. } => None,
        }
    }

    /// Tag of the enricher whose computation failed
    pub fn tag(&self) -> Option<&str> {
        match self {
            EnricherError::Config(_) => None,
            EnricherError::Computation { tag, .. } => Some(tag),
        }
    }
}
