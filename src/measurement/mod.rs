//! Turning raw meter samples into recorded values.

pub mod aggregate;
pub mod leveling;

pub use aggregate::{
    ScalarAggregator, ScalarReading, SampleParsePolicy, VectorAggregator, VectorReading,
    ZeroOffset,
};
pub use leveling::PowerLeveler;
