use crate::entity::EntityId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;

mod validation;

pub use validation::{validate_sensor_name, SensorNameError};

/// Published when an entity joins a group; value is the member's id
pub const MEMBER_ADDED: Sensor = Sensor::from_static("group.members.added");

/// Published when an entity leaves a group; value is the member's id
pub const MEMBER_REMOVED: Sensor = Sensor::from_static("group.members.removed");

/// Published when a child is attached under an entity; value is the child's id
pub const CHILD_ADDED: Sensor = Sensor::from_static("entity.children.added");

/// Published when a child is detached from an entity; value is the child's id
pub const CHILD_REMOVED: Sensor = Sensor::from_static("entity.children.removed");

/// Named, observable attribute of an entity
///
/// Identity is the name alone. Values are untyped JSON; `Value::Null`
/// means "explicitly absent".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sensor {
    name: Cow<'static, str>,
}

impl Sensor {
    /// Create a sensor without validating its name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
        }
    }

    pub const fn from_static(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
        }
    }

    /// Create a sensor from a name supplied at runtime (config, resolved expressions)
    pub fn parse(name: &str) -> Result<Self, SensorNameError> {
        validate_sensor_name(name)?;
        Ok(Self::new(name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True for the four structural notifications emitted by the entity tree
    pub fn is_membership(&self) -> bool {
        *self == MEMBER_ADDED
            || *self == MEMBER_REMOVED
            || *self == CHILD_ADDED
            || *self == CHILD_REMOVED
    }
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Notification that a sensor on an entity took a new value
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorEvent {
    /// Entity whose sensor changed
    pub source: EntityId,

    /// The sensor that changed
    pub sensor: Sensor,

    /// New value (`Null` when cleared)
    pub value: Value,

    /// When the value was published
    pub timestamp: DateTime<Utc>,
}

impl SensorEvent {
    pub fn new(source: EntityId, sensor: Sensor, value: Value) -> Self {
        Self {
            source,
            sensor,
            value,
            timestamp: Utc::now(),
        }
    }

    /// Entity carried by a membership notification
    ///
    /// Returns None for ordinary sensor events or malformed payloads.
    pub fn affected_entity(&self) -> Option<EntityId> {
        if !self.sensor.is_membership() {
            return None;
        }
        self.value
            .as_str()
            .and_then(|raw| EntityId::parse(raw).ok())
    }
}
