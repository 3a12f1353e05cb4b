//! Aggregator configuration
//!
//! The source tree is declared in TOML; every node is tagged with its `type`:
//!
//! ```toml
//! listen_addr = "0.0.0.0:8080"
//! timeout = "5s"
//! t_count = 3
//! t_duration = "20s"
//!
//! [[sources]]
//! name = "local"
//! type = "file"
//! path = "indexes/local.cdxj"
//!
//! [[sources]]
//! name = "ia"
//! type = "remote_cdx"
//! api_url = "http://web.archive.org/cdx/search/cdx"
//! timeout = "2s"
//! ```
//!
//! Scalar settings default from `CDXFED_*` environment variables.

use crate::aggregate::{Aggregator, NamedSource, SourceSequence};
use crate::breaker::BreakerPolicy;
use crate::source::{
    ClusterIndexSource, FileIndexSource, IndexSource, KeyValueIndexSource, LiveIndexSource,
    MatchMode, MementoIndexSource, MemorySortedSet, RemoteCdxIndexSource, SortedSetStore,
};
use cdxfed_shared::utils::parse_duration;
use cdxfed_shared::IndexError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration {value:?} for {field}")]
    Duration { field: String, value: String },

    #[error("invalid breaker threshold: t_count must be at least 1")]
    Threshold,

    #[error("invalid source name {0:?}")]
    InvalidName(String),

    #[error("duplicate source name {0:?}")]
    DuplicateName(String),

    #[error("source {name:?}: {error}")]
    Source {
        name: String,
        #[source]
        error: IndexError,
    },

    #[error("source {0:?} needs a build with the redis-store feature")]
    RedisUnavailable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Listen address for the HTTP server (queries and admin endpoints)
    pub listen_addr: String,

    /// Default per-source timeout
    pub timeout: String,

    /// Failures within `t_duration` that open a source's breaker
    pub t_count: usize,
    pub t_duration: String,

    pub sources: Vec<SourceConfig>,

    /// Directory relative source paths resolve against
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    #[serde(flatten)]
    pub kind: SourceKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    File {
        path: PathBuf,
        #[serde(default)]
        block_size: Option<u64>,
    },
    Cluster {
        summary: PathBuf,
        #[serde(default)]
        locations: Option<PathBuf>,
        #[serde(default)]
        page_size: Option<usize>,
    },
    RemoteCdx {
        api_url: String,
        #[serde(default)]
        replay_url: Option<String>,
        #[serde(default)]
        match_mode: MatchMode,
    },
    Memento {
        timegate_url: String,
        timemap_url: String,
        #[serde(default)]
        replay_url: Option<String>,
    },
    KeyValue {
        keys: Vec<String>,
        #[serde(default)]
        redis_url: Option<String>,
        /// In-memory store only: set key -> index file to load at startup
        #[serde(default)]
        seed: BTreeMap<String, PathBuf>,
    },
    Live,
    Aggregator {
        sources: Vec<SourceConfig>,
        #[serde(default)]
        t_count: Option<usize>,
        #[serde(default)]
        t_duration: Option<String>,
    },
    Sequence {
        sources: Vec<SourceConfig>,
    },
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: std::env::var("CDXFED_LISTEN")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            timeout: std::env::var("CDXFED_TIMEOUT").unwrap_or_else(|_| "5s".to_string()),
            t_count: std::env::var("CDXFED_T_COUNT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            t_duration: std::env::var("CDXFED_T_DURATION").unwrap_or_else(|_| "20s".to_string()),
            sources: Vec::new(),
            base_dir: None,
        }
    }
}

impl AggregatorConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a file; relative source paths resolve against its directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&text)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    pub fn default_timeout(&self) -> Result<Duration, ConfigError> {
        duration("timeout", &self.timeout)
    }

    pub fn breaker_policy(&self) -> Result<BreakerPolicy, ConfigError> {
        if self.t_count == 0 {
            return Err(ConfigError::Threshold);
        }
        Ok(BreakerPolicy {
            t_count: self.t_count,
            t_duration: duration("t_duration", &self.t_duration)?,
        })
    }

    /// Construct the configured source tree.
    pub fn build(&self) -> Result<Aggregator, ConfigError> {
        let defaults = Defaults {
            timeout: self.default_timeout()?,
            policy: self.breaker_policy()?,
            base_dir: self.base_dir.clone(),
        };
        let sources = build_sources(&self.sources, &defaults)?;
        Ok(Aggregator::with_policy(sources, defaults.policy))
    }
}

fn duration(field: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).map_err(|_| ConfigError::Duration {
        field: field.to_string(),
        value: value.to_string(),
    })
}

#[derive(Clone)]
struct Defaults {
    timeout: Duration,
    policy: BreakerPolicy,
    base_dir: Option<PathBuf>,
}

impl Defaults {
    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

fn build_sources(configs: &[SourceConfig], defaults: &Defaults) -> Result<Vec<NamedSource>, ConfigError> {
    let mut seen = HashSet::new();
    for cfg in configs {
        if cfg.name.is_empty() || cfg.name.contains(':') || cfg.name.contains(',') {
            return Err(ConfigError::InvalidName(cfg.name.clone()));
        }
        if !seen.insert(cfg.name.as_str()) {
            return Err(ConfigError::DuplicateName(cfg.name.clone()));
        }
    }
    configs.iter().map(|cfg| build_source(cfg, defaults)).collect()
}

fn build_source(cfg: &SourceConfig, defaults: &Defaults) -> Result<NamedSource, ConfigError> {
    let timeout = match &cfg.timeout {
        Some(t) => duration(&format!("{}.timeout", cfg.name), t)?,
        None => defaults.timeout,
    };
    let err = |error: IndexError| ConfigError::Source {
        name: cfg.name.clone(),
        error,
    };

    let source: Arc<dyn IndexSource> = match &cfg.kind {
        SourceKind::File { path, block_size } => {
            let mut source = FileIndexSource::new(defaults.resolve(path)).map_err(err)?;
            if let Some(block_size) = block_size {
                source = source.with_block_size(*block_size);
            }
            Arc::new(source)
        }
        SourceKind::Cluster {
            summary,
            locations,
            page_size,
        } => {
            let locations = locations.as_deref().map(|p| defaults.resolve(p));
            let mut source =
                ClusterIndexSource::new(defaults.resolve(summary), locations.as_deref()).map_err(err)?;
            if let Some(page_size) = page_size {
                source = source.with_page_size(*page_size);
            }
            Arc::new(source)
        }
        SourceKind::RemoteCdx {
            api_url,
            replay_url,
            match_mode,
        } => {
            let mut source = RemoteCdxIndexSource::new(api_url.clone()).with_match_mode(*match_mode);
            if let Some(template) = replay_url {
                source = source.with_replay_url(template.clone());
            }
            Arc::new(source)
        }
        SourceKind::Memento {
            timegate_url,
            timemap_url,
            replay_url,
        } => {
            let mut source =
                MementoIndexSource::new(timegate_url.clone(), timemap_url.clone()).map_err(err)?;
            if let Some(template) = replay_url {
                source = source.with_replay_url(template.clone());
            }
            Arc::new(source)
        }
        SourceKind::KeyValue {
            keys,
            redis_url,
            seed,
        } => {
            let store = kv_store(cfg, redis_url.as_deref(), seed, defaults)?;
            Arc::new(KeyValueIndexSource::new(store, keys.clone()))
        }
        SourceKind::Live => Arc::new(LiveIndexSource::new()),
        SourceKind::Aggregator {
            sources,
            t_count,
            t_duration,
        } => {
            let policy = BreakerPolicy {
                t_count: t_count.unwrap_or(defaults.policy.t_count).max(1),
                t_duration: match t_duration {
                    Some(d) => duration(&format!("{}.t_duration", cfg.name), d)?,
                    None => defaults.policy.t_duration,
                },
            };
            let nested = Defaults {
                policy,
                ..defaults.clone()
            };
            Arc::new(Aggregator::with_policy(build_sources(sources, &nested)?, policy))
        }
        SourceKind::Sequence { sources } => Arc::new(SourceSequence::with_policy(
            build_sources(sources, defaults)?,
            defaults.policy,
        )),
    };

    Ok(NamedSource::from_arc(cfg.name.clone(), source).with_timeout(timeout))
}

fn kv_store(
    cfg: &SourceConfig,
    redis_url: Option<&str>,
    seed: &BTreeMap<String, PathBuf>,
    defaults: &Defaults,
) -> Result<Arc<dyn SortedSetStore>, ConfigError> {
    match redis_url {
        #[cfg(feature = "redis-store")]
        Some(url) => {
            let store = crate::source::kv::RedisSortedSet::new(url).map_err(|error| ConfigError::Source {
                name: cfg.name.clone(),
                error,
            })?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-store"))]
        Some(_) => Err(ConfigError::RedisUnavailable(cfg.name.clone())),
        None => {
            let store = MemorySortedSet::new();
            for (key, path) in seed {
                let path = defaults.resolve(path);
                let text = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Read { path, source })?;
                store.load_lines(key, &text);
            }
            Ok(Arc::new(store))
        }
    }
}
