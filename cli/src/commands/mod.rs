pub mod query;
pub mod sources;

use anyhow::{Context, Result};
use cdxfed_aggregator::{Aggregator, AggregatorConfig};
use std::path::Path;

/// Load a config file and build its source tree.
pub fn load_aggregator(path: &Path) -> Result<Aggregator> {
    let config = AggregatorConfig::load(path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    config.build().context("Invalid source configuration")
}
