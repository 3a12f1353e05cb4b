//! Federated aggregation over named index sources
//!
//! `Aggregator` dispatches a query to every selected source concurrently, each
//! under its own timeout and circuit breaker, and merges whatever came back.
//! `SourceSequence` tries sources one at a time and returns the first
//! non-empty answer. Both are themselves index sources and nest freely.

use crate::audit;
use crate::breaker::{BreakerPolicy, BreakerState, CircuitBreaker};
use crate::merge::{merge_streams, post_process};
use crate::metrics::{BREAKER_SKIPS, QUERY_DURATION, QUERY_TOTAL, SOURCE_DURATION, SOURCE_ERRORS};
use crate::source::{CaptureStream, IndexSource, PageCount, QueryContext, SourceInfo, SourceResult};
use async_trait::async_trait;
use cdxfed_shared::{ErrorMap, IndexError, IndexQuery};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(5);

/// A source registered under a unique name.
#[derive(Clone)]
pub struct NamedSource {
    pub name: String,
    pub source: Arc<dyn IndexSource>,
    pub timeout: Duration,
}

impl NamedSource {
    pub fn new(name: impl Into<String>, source: impl IndexSource + 'static) -> Self {
        Self::from_arc(name, Arc::new(source))
    }

    pub fn from_arc(name: impl Into<String>, source: Arc<dyn IndexSource>) -> Self {
        Self {
            name: name.into(),
            source,
            timeout: DEFAULT_SOURCE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

struct Slot {
    named: NamedSource,
    breaker: CircuitBreaker,
}

impl Slot {
    fn new(named: NamedSource, policy: BreakerPolicy) -> Self {
        let breaker = CircuitBreaker::new(named.name.clone(), policy);
        Self { named, breaker }
    }

    fn info(&self) -> SourceInfo {
        SourceInfo {
            name: self.named.name.clone(),
            kind: self.named.source.kind(),
            timeout_ms: self.named.timeout.as_millis() as u64,
            breaker: match self.breaker.state() {
                BreakerState::Closed => "closed",
                BreakerState::Open => "open",
            },
            children: self.named.source.children(),
        }
    }

    /// One source call under its timeout and breaker.
    async fn run(&self, query: IndexQuery, ctx: &QueryContext) -> Result<SourceResult, IndexError> {
        let name = self.named.name.as_str();
        if !self.breaker.allow() {
            debug!(source = %name, "breaker open, skipping");
            BREAKER_SKIPS.with_label_values(&[name]).inc();
            return Err(IndexError::Timeout);
        }

        let child = ctx.child(self.named.timeout);
        let timeout = child.remaining().unwrap_or(self.named.timeout);
        let source = self.named.source.clone();
        let task_ctx = child.clone();
        let timer = SOURCE_DURATION.with_label_values(&[name]).start_timer();

        let mut handle = tokio::spawn(async move { source.query(&query, &task_ctx).await });
        let outcome = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(IndexError::source(format!("source task failed: {}", e))),
            Err(_) => {
                child.cancel.cancel();
                handle.abort();
                Err(IndexError::Timeout)
            }
        };
        timer.observe_duration();

        match &outcome {
            Ok(_) | Err(IndexError::NotFound(_)) => self.breaker.record_success(),
            Err(IndexError::BadQuery(_)) | Err(IndexError::AccessDenied(_)) => {}
            Err(_) => self.breaker.record_failure(),
        }
        if let Err(e) = &outcome {
            SOURCE_ERRORS.with_label_values(&[name, e.kind()]).inc();
            debug!(source = %name, error = %e, "source failed");
        }
        outcome
    }
}

/// Resolve the `sources` filter to slot indexes (in configured order) and the
/// nested selection each slot should receive.
fn select(slots: &[Slot], query: &IndexQuery) -> Result<Vec<(usize, Option<Vec<String>>)>, IndexError> {
    let Some(names) = &query.sources else {
        return Ok((0..slots.len()).map(|i| (i, None)).collect());
    };

    let mut picked: Vec<(usize, Option<Vec<String>>)> = Vec::new();
    for name in names {
        let (top, inner) = match name.split_once(':') {
            Some((top, inner)) => (top, Some(inner)),
            None => (name.as_str(), None),
        };
        let idx = slots
            .iter()
            .position(|s| s.named.name == top)
            .ok_or_else(|| IndexError::bad_query(format!("unknown source: {}", top)))?;

        match picked.iter_mut().find(|(i, _)| *i == idx) {
            Some((_, selection)) => match inner {
                None => *selection = None,
                Some(inner) => {
                    if let Some(list) = selection {
                        list.push(inner.to_string());
                    }
                }
            },
            None => picked.push((idx, inner.map(|i| vec![i.to_string()]))),
        }
    }
    picked.sort_by_key(|(i, _)| *i);
    Ok(picked)
}

/// Folds per-source outcomes into tagged streams and the error map.
struct Outcomes {
    errors: ErrorMap,
    answered: usize,
    failed: usize,
    bad_query: Option<IndexError>,
    only_bad_queries: bool,
}

impl Outcomes {
    fn new() -> Self {
        Self {
            errors: ErrorMap::new(),
            answered: 0,
            failed: 0,
            bad_query: None,
            only_bad_queries: true,
        }
    }

    /// Record one outcome; returns the source's records tagged with its name.
    fn add(&mut self, name: &str, outcome: Result<SourceResult, IndexError>) -> Option<CaptureStream> {
        match outcome {
            Ok(result) => {
                self.answered += 1;
                for (inner, message) in result.errors {
                    self.errors.insert(format!("{}:{}", name, inner), message);
                }
                let tag = name.to_string();
                Some(Box::new(result.records.map(move |mut r| {
                    r.tag_source(&tag);
                    r
                })))
            }
            Err(e @ IndexError::NotFound(_)) => {
                self.answered += 1;
                self.errors.insert(name.to_string(), e.to_string());
                None
            }
            Err(IndexError::AllSourcesFailed(inner)) => {
                self.failed += 1;
                self.only_bad_queries = false;
                for (inner, message) in inner {
                    self.errors.insert(format!("{}:{}", name, inner), message);
                }
                None
            }
            Err(e) => {
                self.failed += 1;
                self.errors.insert(name.to_string(), e.to_string());
                if matches!(e, IndexError::BadQuery(_)) {
                    self.bad_query.get_or_insert(e);
                } else {
                    self.only_bad_queries = false;
                }
                None
            }
        }
    }

    /// Fails when nothing answered and at least one source failed. A query
    /// every source rejected as malformed surfaces as that `BadQuery`.
    fn finish(self, url: &str) -> Result<ErrorMap, IndexError> {
        if self.answered == 0 && self.failed > 0 {
            if self.only_bad_queries {
                if let Some(e) = self.bad_query {
                    return Err(e);
                }
            }
            audit::all_sources_failed(url, self.failed);
            return Err(IndexError::AllSourcesFailed(self.errors));
        }
        Ok(self.errors)
    }
}

fn child_query(query: &IndexQuery, selection: Option<Vec<String>>) -> IndexQuery {
    let mut child = query.clone();
    child.sources = selection;
    child
}

/// Largest page count among the selected sources that support paging.
async fn page_count_of(
    slots: &[Slot],
    query: &IndexQuery,
    ctx: &QueryContext,
) -> Result<Option<PageCount>, IndexError> {
    let mut best: Option<PageCount> = None;
    for (idx, selection) in select(slots, query)? {
        let slot = &slots[idx];
        let child = ctx.child(slot.named.timeout);
        let q = child_query(query, selection);
        let timeout = child.remaining().unwrap_or(slot.named.timeout);
        match tokio::time::timeout(timeout, slot.named.source.page_count(&q, &child)).await {
            Ok(Ok(Some(count))) => {
                if best.map_or(true, |b| count.pages > b.pages) {
                    best = Some(count);
                }
            }
            Ok(Ok(None)) => {}
            Ok(Err(e @ IndexError::BadQuery(_))) => return Err(e),
            Ok(Err(e)) => warn!(source = %slot.named.name, error = %e, "page count failed"),
            Err(_) => warn!(source = %slot.named.name, "page count timed out"),
        }
    }
    Ok(best)
}

/// Concurrent fan-out over named sources.
pub struct Aggregator {
    slots: Vec<Slot>,
}

impl Aggregator {
    pub fn new(sources: Vec<NamedSource>) -> Self {
        Self::with_policy(sources, BreakerPolicy::default())
    }

    pub fn with_policy(sources: Vec<NamedSource>, policy: BreakerPolicy) -> Self {
        Self {
            slots: sources.into_iter().map(|s| Slot::new(s, policy)).collect(),
        }
    }

    /// Configured sources with their types and breaker states.
    pub fn sources(&self) -> Vec<SourceInfo> {
        self.slots.iter().map(Slot::info).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Full lookup: dispatch, merge, then the post-merge pipeline.
    pub async fn search(&self, query: &IndexQuery) -> Result<SourceResult, IndexError> {
        let result = self.dispatch(query, &QueryContext::new()).await;
        let status = match &result {
            Ok(r) if r.errors.is_empty() => "ok",
            Ok(_) => "partial",
            Err(e) => e.kind(),
        };
        QUERY_TOTAL.with_label_values(&[status]).inc();

        let SourceResult { records, errors } = result?;
        Ok(SourceResult {
            records: post_process(records, query),
            errors,
        })
    }

    /// Page count for `showNumPages`.
    pub async fn num_pages(&self, query: &IndexQuery) -> Result<Option<PageCount>, IndexError> {
        query.validate()?;
        page_count_of(&self.slots, query, &QueryContext::new()).await
    }

    async fn dispatch(&self, query: &IndexQuery, ctx: &QueryContext) -> Result<SourceResult, IndexError> {
        query.validate()?;
        let selection = select(&self.slots, query)?;
        debug!(url = %query.url, sources = selection.len(), "dispatching query");

        let timer = QUERY_DURATION.start_timer();
        let calls = selection.into_iter().map(|(idx, selection)| {
            let slot = &self.slots[idx];
            let q = child_query(query, selection);
            async move { (slot, slot.run(q, ctx).await) }
        });
        let results = futures::future::join_all(calls).await;
        timer.observe_duration();

        let mut outcomes = Outcomes::new();
        let mut streams = Vec::with_capacity(results.len());
        for (slot, outcome) in results {
            if let Some(records) = outcomes.add(&slot.named.name, outcome) {
                streams.push(records);
            }
        }
        let errors = outcomes.finish(&query.url)?;

        Ok(SourceResult {
            records: merge_streams(streams),
            errors,
        })
    }
}

#[async_trait]
impl IndexSource for Aggregator {
    fn kind(&self) -> &'static str {
        "aggregator"
    }

    /// Merged but otherwise unprocessed: the outermost aggregator runs the pipeline.
    async fn query(&self, query: &IndexQuery, ctx: &QueryContext) -> Result<SourceResult, IndexError> {
        self.dispatch(query, ctx).await
    }

    async fn page_count(&self, query: &IndexQuery, ctx: &QueryContext) -> Result<Option<PageCount>, IndexError> {
        page_count_of(&self.slots, query, ctx).await
    }

    fn children(&self) -> Vec<SourceInfo> {
        self.sources()
    }
}

/// Ordered fallback: the first source with a non-empty answer wins.
pub struct SourceSequence {
    slots: Vec<Slot>,
}

impl SourceSequence {
    pub fn new(sources: Vec<NamedSource>) -> Self {
        Self::with_policy(sources, BreakerPolicy::default())
    }

    pub fn with_policy(sources: Vec<NamedSource>, policy: BreakerPolicy) -> Self {
        Self {
            slots: sources.into_iter().map(|s| Slot::new(s, policy)).collect(),
        }
    }

    pub fn sources(&self) -> Vec<SourceInfo> {
        self.slots.iter().map(Slot::info).collect()
    }

    /// Full lookup with the post-merge pipeline applied.
    pub async fn search(&self, query: &IndexQuery) -> Result<SourceResult, IndexError> {
        query.validate()?;
        let SourceResult { records, errors } = self.query(query, &QueryContext::new()).await?;
        Ok(SourceResult {
            records: post_process(records, query),
            errors,
        })
    }
}

#[async_trait]
impl IndexSource for SourceSequence {
    fn kind(&self) -> &'static str {
        "sequence"
    }

    async fn query(&self, query: &IndexQuery, ctx: &QueryContext) -> Result<SourceResult, IndexError> {
        let mut outcomes = Outcomes::new();
        for (idx, selection) in select(&self.slots, query)? {
            let slot = &self.slots[idx];
            let outcome = slot.run(child_query(query, selection), ctx).await;
            if let Some(records) = outcomes.add(&slot.named.name, outcome) {
                let mut records = records.peekable();
                if records.peek().is_some() {
                    debug!(source = %slot.named.name, "sequence answered");
                    return Ok(SourceResult {
                        records: Box::new(records),
                        errors: outcomes.errors,
                    });
                }
            }
        }
        let errors = outcomes.finish(&query.url)?;
        Ok(SourceResult {
            records: Box::new(std::iter::empty()),
            errors,
        })
    }

    async fn page_count(&self, query: &IndexQuery, ctx: &QueryContext) -> Result<Option<PageCount>, IndexError> {
        page_count_of(&self.slots, query, ctx).await
    }

    fn children(&self) -> Vec<SourceInfo> {
        self.sources()
    }
}
