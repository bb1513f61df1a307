// Enrichers: derived sensors computed from other sensors

mod aggregator;
mod base;
mod builder;
mod combiner;
mod error;
mod functions;
mod joiner;
mod producers;
mod propagator;
mod reducer;
mod transformer;
mod updating_map;
mod value_store;

pub use aggregator::{Aggregator, AggregatorConfig};
pub use builder::{
    AggregatorBuilder, CombinerBuilder, EnricherBuilder, EnricherSpec, Enrichers, JoinerBuilder,
    PropagatorBuilder, ReducerBuilder, TransformerBuilder, UpdatingMapBuilder,
};
pub use combiner::{Combiner, CombinerConfig};
pub use error::{ConfigError, EnricherError};
pub use functions::{
    average, sum, AggregateFn, Aggregation, NumericDefaults, QuorumCheck, ReduceFn, Reduction,
    ValueFilter, ValuePredicate,
};
pub use joiner::{join_values, JoinOptions};
pub use producers::{EntityFilter, ProducerMode, ProducerSelection};
pub use propagator::{Propagator, PropagatorConfig};
pub use reducer::{Reducer, ReducerConfig, SensorSource};
pub use transformer::{EventFn, Transformer, TransformerConfig, ValueFn};
pub use updating_map::{UpdatingMap, UpdatingMapConfig};
pub use value_store::ValueStore;

use crate::entity::EntityId;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnricherKind {
    Aggregator,
    Transformer,
    Reducer,
    Propagator,
    Combiner,
    UpdatingMap,
}

impl fmt::Display for EnricherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnricherKind::Aggregator => "aggregator",
            EnricherKind::Transformer => "transformer",
            EnricherKind::Reducer => "reducer",
            EnricherKind::Propagator => "propagator",
            EnricherKind::Combiner => "combiner",
            EnricherKind::UpdatingMap => "updating_map",
        };
        f.write_str(name)
    }
}

/// An attached enricher
///
/// Dropping the last handle has the same effect as `destroy`: listeners
/// hold only weak references and go quiet once the unit is gone.
pub trait Enricher: Send + Sync {
    /// Identifier, unique per owner by convention
    fn tag(&self) -> &str;

    fn kind(&self) -> EnricherKind;

    fn owner(&self) -> &EntityId;

    /// False once destroyed, or if attach refused to subscribe
    fn is_live(&self) -> bool;

    /// Release all subscriptions; nothing is emitted afterwards
    fn destroy(&self);
}
