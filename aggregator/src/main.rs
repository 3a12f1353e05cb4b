//! Aggregator service
//!
//! Loads a source tree from a TOML file and serves capture-index queries over
//! HTTP. The config path comes from the first argument or `CDXFED_CONFIG`.

use anyhow::{Context, Result};
use cdxfed_aggregator::{config::AggregatorConfig, server::http};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("CDXFED_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config() -> Result<AggregatorConfig> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var("CDXFED_CONFIG").ok().map(PathBuf::from));

    match path {
        Some(path) => AggregatorConfig::load(&path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(AggregatorConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = load_config()?;
    let aggregator = config.build().context("Invalid source configuration")?;
    if aggregator.is_empty() {
        tracing::warn!("No sources configured; every query will return nothing");
    }
    for source in aggregator.sources() {
        info!(name = %source.name, kind = source.kind, "source ready");
    }

    let addr = config
        .listen_addr
        .parse()
        .context("Invalid listen address")?;
    info!("Starting cdxfed aggregator on {}", addr);

    http::serve(addr, Arc::new(aggregator))
        .await
        .context("HTTP server error")?;

    Ok(())
}
