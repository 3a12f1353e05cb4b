//! Capture-index aggregation engine

pub mod aggregate;
pub mod audit;
pub mod binsearch;
pub mod breaker;
pub mod config;
pub mod merge;
pub mod metrics;
pub mod server;
pub mod source;

pub use aggregate::{Aggregator, NamedSource, SourceSequence};
pub use config::AggregatorConfig;
