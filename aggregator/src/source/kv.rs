//! Sorted-set (key-value) index source
//!
//! Index lines are members of lexicographically ordered sets, queried with a
//! range-by-lex lookup. Set keys come from templates such as `cdxj:{coll}`
//! whose placeholders are filled from query parameters; several keys are
//! queried and unioned.

use super::{read_records, IndexSource, QueryContext, RecordLines, SourceResult};
use async_trait::async_trait;
use cdxfed_shared::{IndexError, IndexQuery};
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Backend holding sorted sets of index lines.
#[async_trait]
pub trait SortedSetStore: Send + Sync {
    /// Members of `key` in `[start, end)`, ascending.
    async fn range(&self, key: &str, start: &str, end: &str, db: Option<i64>)
        -> Result<Vec<String>, IndexError>;
}

/// In-process sorted-set store.
#[derive(Default)]
pub struct MemorySortedSet {
    sets: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl MemorySortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: &str, member: impl Into<String>) {
        let mut sets = self.sets.write().unwrap_or_else(|e| e.into_inner());
        sets.entry(key.to_string()).or_default().insert(member.into());
    }

    /// Add every non-empty line of `text` to `key`.
    pub fn load_lines(&self, key: &str, text: &str) {
        let mut sets = self.sets.write().unwrap_or_else(|e| e.into_inner());
        let set = sets.entry(key.to_string()).or_default();
        set.extend(
            text.lines()
                .map(str::trim_end)
                .filter(|l| !l.is_empty())
                .map(str::to_string),
        );
    }
}

#[async_trait]
impl SortedSetStore for MemorySortedSet {
    async fn range(&self, key: &str, start: &str, end: &str, _db: Option<i64>) -> Result<Vec<String>, IndexError> {
        let sets = self.sets.read().unwrap_or_else(|e| e.into_inner());
        let Some(set) = sets.get(key) else {
            return Ok(Vec::new());
        };
        let bounds = (Bound::Included(start.to_string()), Bound::Excluded(end.to_string()));
        Ok(set.range::<String, _>(bounds).cloned().collect())
    }
}

#[cfg(feature = "redis-store")]
pub use self::redis_store::RedisSortedSet;

#[cfg(feature = "redis-store")]
mod redis_store {
    use super::SortedSetStore;
    use async_trait::async_trait;
    use cdxfed_shared::IndexError;

    /// Redis-backed store using `ZRANGEBYLEX`.
    pub struct RedisSortedSet {
        client: redis::Client,
    }

    impl RedisSortedSet {
        pub fn new(url: &str) -> Result<Self, IndexError> {
            let client = redis::Client::open(url)
                .map_err(|e| IndexError::source(format!("redis {}: {}", url, e)))?;
            Ok(Self { client })
        }
    }

    fn redis_err(e: redis::RedisError) -> IndexError {
        IndexError::source(format!("redis: {}", e))
    }

    #[async_trait]
    impl SortedSetStore for RedisSortedSet {
        async fn range(&self, key: &str, start: &str, end: &str, db: Option<i64>) -> Result<Vec<String>, IndexError> {
            let mut conn = self.client.get_async_connection().await.map_err(redis_err)?;
            if let Some(db) = db {
                redis::cmd("SELECT")
                    .arg(db)
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(redis_err)?;
            }
            redis::cmd("ZRANGEBYLEX")
                .arg(key)
                .arg(format!("[{}", start))
                .arg(format!("({}", end))
                .query_async(&mut conn)
                .await
                .map_err(redis_err)
        }
    }
}

pub struct KeyValueIndexSource {
    store: Arc<dyn SortedSetStore>,
    key_templates: Vec<String>,
}

impl KeyValueIndexSource {
    pub fn new(store: Arc<dyn SortedSetStore>, key_templates: Vec<String>) -> Self {
        Self { store, key_templates }
    }

    /// Expand every `{name}` placeholder from the query parameters.
    fn keys(&self, query: &IndexQuery) -> Result<Vec<String>, IndexError> {
        self.key_templates
            .iter()
            .map(|template| fill_key(template, query))
            .collect()
    }
}

fn fill_key(template: &str, query: &IndexQuery) -> Result<String, IndexError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else {
            break;
        };
        let name = &rest[open + 1..open + close];
        let value = query
            .param(name)
            .ok_or_else(|| IndexError::source(format!("key template {:?} needs param {:?}", template, name)))?;
        out.push_str(&rest[..open]);
        out.push_str(value);
        rest = &rest[open + close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[async_trait]
impl IndexSource for KeyValueIndexSource {
    fn kind(&self) -> &'static str {
        "key_value"
    }

    async fn query(&self, query: &IndexQuery, _ctx: &QueryContext) -> Result<SourceResult, IndexError> {
        let range = query.search_range()?;
        let keys = self.keys(query)?;
        let db = query
            .param("db")
            .map(|v| v.parse::<i64>().map_err(|_| IndexError::bad_query(format!("invalid db: {:?}", v))))
            .transpose()?;

        let mut lines = Vec::new();
        for key in &keys {
            debug!(key = %key, start = %range.start, "sorted-set range lookup");
            lines.extend(self.store.range(key, &range.start, &range.end, db).await?);
        }
        if keys.len() > 1 {
            lines.sort();
        }

        let lines = lines.into_iter().map(Ok);
        let records = read_records(RecordLines::new(lines, keys.join(",")))?;
        Ok(SourceResult::from_vec(records))
    }
}
