//! Shared types and utilities for cdxfed
//!
//! This crate contains the capture record model, the index query contract and
//! the small utilities (timestamps, SURT canonicalization, link-format parsing)
//! used by every index source and by the aggregation engine.

pub mod error;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use error::{ErrorMap, IndexError};
pub use types::{capture::*, output::OutputFormat, query::*};
