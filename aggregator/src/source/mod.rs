//! Index sources
//!
//! Every source answers an `IndexQuery` with a stream of capture records
//! sorted by `(urlkey, timestamp)` ascending. That ordering is the precondition
//! the k-way merge relies on; sources whose backend is not naturally ordered
//! sort before returning.

pub mod cluster;
pub mod file;
pub mod kv;
pub mod live;
pub mod memento;
pub mod remote;

pub use cluster::ClusterIndexSource;
pub use file::FileIndexSource;
pub use kv::{KeyValueIndexSource, MemorySortedSet, SortedSetStore};
pub use live::LiveIndexSource;
pub use memento::MementoIndexSource;
pub use remote::{MatchMode, RemoteCdxIndexSource};

use async_trait::async_trait;
use cdxfed_shared::{CaptureRecord, ErrorMap, IndexError, IndexQuery};
use serde::Serialize;
use std::io;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Lazy, single-pass record sequence.
pub type CaptureStream = Box<dyn Iterator<Item = CaptureRecord> + Send>;

/// What a source hands back: its records plus failures of any nested sources.
pub struct SourceResult {
    pub records: CaptureStream,
    pub errors: ErrorMap,
}

impl SourceResult {
    pub fn new(records: CaptureStream) -> Self {
        Self {
            records,
            errors: ErrorMap::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Box::new(std::iter::empty()))
    }

    pub fn from_vec(records: Vec<CaptureRecord>) -> Self {
        Self::new(Box::new(records.into_iter()))
    }
}

impl std::fmt::Debug for SourceResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceResult")
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}

/// Deadline and cancellation handed to a source call.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Child context whose deadline is the earlier of the parent's and
    /// `now + timeout`. Cancelling the parent cancels the child.
    pub fn child(&self, timeout: Duration) -> Self {
        let own = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < own => parent,
            _ => own,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.child_token(),
        }
    }

    /// Time left before the deadline, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Number of block pages a paged query would produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageCount {
    pub pages: usize,
    #[serde(rename = "pageSize")]
    pub page_size: usize,
    pub blocks: usize,
}

/// Introspection entry for one configured source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub name: String,
    pub kind: &'static str,
    pub timeout_ms: u64,
    pub breaker: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SourceInfo>,
}

#[async_trait]
pub trait IndexSource: Send + Sync {
    /// Type tag reported by introspection (`file`, `cluster`, ...).
    fn kind(&self) -> &'static str;

    async fn query(&self, query: &IndexQuery, ctx: &QueryContext)
        -> Result<SourceResult, IndexError>;

    /// Page count for block-paged sources; `None` when paging is unsupported.
    async fn page_count(
        &self,
        _query: &IndexQuery,
        _ctx: &QueryContext,
    ) -> Result<Option<PageCount>, IndexError> {
        Ok(None)
    }

    /// Nested sources, for composite sources.
    fn children(&self) -> Vec<SourceInfo> {
        Vec::new()
    }
}

/// Parses index lines into records, skipping malformed lines.
///
/// A read error ends iteration and is kept for `read_records` to report.
pub struct RecordLines<I> {
    lines: I,
    source: String,
    malformed: usize,
    error: Option<io::Error>,
}

impl<I> RecordLines<I>
where
    I: Iterator<Item = io::Result<String>>,
{
    pub fn new(lines: I, source: impl Into<String>) -> Self {
        Self {
            lines,
            source: source.into(),
            malformed: 0,
            error: None,
        }
    }
}

impl<I> Iterator for RecordLines<I>
where
    I: Iterator<Item = io::Result<String>>,
{
    type Item = CaptureRecord;

    fn next(&mut self) -> Option<CaptureRecord> {
        if self.error.is_some() {
            return None;
        }
        loop {
            match self.lines.next()? {
                Err(e) => {
                    self.error = Some(e);
                    return None;
                }
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => match CaptureRecord::parse(&line) {
                    Ok(record) => return Some(record),
                    Err(e) => {
                        self.malformed += 1;
                        warn!(source = %self.source, error = %e, "skipping malformed index line");
                    }
                },
            }
        }
    }
}

/// Read every record of a scan.
///
/// Malformed lines are tolerated unless they are all the source produced. A
/// read or decode error fails the whole call, so a partial answer is never
/// passed off as complete.
pub(crate) fn read_records<I>(mut records: RecordLines<I>) -> Result<Vec<CaptureRecord>, IndexError>
where
    I: Iterator<Item = io::Result<String>>,
{
    let parsed: Vec<CaptureRecord> = records.by_ref().collect();
    if let Some(e) = records.error.take() {
        return Err(IndexError::source(format!(
            "{}: read failed after {} records: {}",
            records.source,
            parsed.len(),
            e
        )));
    }
    if parsed.is_empty() && records.malformed > 0 {
        return Err(IndexError::source(format!(
            "{}: {} malformed lines and no valid records",
            records.source, records.malformed
        )));
    }
    Ok(parsed)
}

/// Fill a replay URL template: `{timestamp}` and `{url}` are substituted.
/// A template without `{url}` gets `timestamp/url` appended.
pub(crate) fn fill_replay_template(template: &str, timestamp: &str, url: &str) -> String {
    if template.contains("{url}") {
        template
            .replace("{timestamp}", timestamp)
            .replace("{url}", url)
    } else {
        let sep = if template.ends_with('/') { "" } else { "/" };
        format!("{}{}{}/{}", template, sep, timestamp, url)
    }
}
