// Configuration
pub mod config;

// Entity identity
pub mod entity;

// Sensors and sensor events
pub mod sensor;

// Entity tree, subscriptions and deferred values
pub mod management;

// Aggregators, transformers, reducers, propagators
pub mod enricher;

pub use config::{EnricherConfig, EnrichmentSettings};
pub use enricher::{ConfigError, Enricher, EnricherError, EnricherKind, EnricherSpec, Enrichers};
pub use entity::EntityId;
pub use management::{LocalManagement, Management};
pub use sensor::{Sensor, SensorEvent};
