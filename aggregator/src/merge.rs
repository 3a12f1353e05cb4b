//! K-way merge of per-source streams and the post-merge pipeline
//!
//! Each input stream is sorted by `(urlkey, timestamp)`; the merge yields a
//! single sorted stream, breaking ties by dispatch order. The pipeline then
//! applies, in order: revisit resolution, field filters, `from`/`to`, the
//! `timestamp` prefix, collapsing, and finally one of closest-sort, reverse
//! or plain limit.

use crate::source::CaptureStream;
use cdxfed_shared::utils::time::timestamp_to_secs;
use cdxfed_shared::{CaptureRecord, ClosestTie, IndexQuery, ORIG_FILENAME, ORIG_LENGTH, ORIG_OFFSET};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};

struct HeapEntry {
    record: CaptureRecord,
    stream: usize,
}

impl HeapEntry {
    fn cmp_key(&self) -> (&str, &str, usize) {
        (&self.record.urlkey, &self.record.timestamp, self.stream)
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_key() == other.cmp_key()
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap is a max-heap: invert so the smallest key pops first
    fn cmp(&self, other: &Self) -> Ordering {
        other.cmp_key().cmp(&self.cmp_key())
    }
}

/// Lazy k-way merge. Holds at most one pending record per input.
pub struct MergedStream {
    streams: Vec<CaptureStream>,
    heap: BinaryHeap<HeapEntry>,
}

impl MergedStream {
    pub fn new(mut streams: Vec<CaptureStream>) -> Self {
        let mut heap = BinaryHeap::with_capacity(streams.len());
        for (stream, records) in streams.iter_mut().enumerate() {
            if let Some(record) = records.next() {
                heap.push(HeapEntry { record, stream });
            }
        }
        Self { streams, heap }
    }
}

impl Iterator for MergedStream {
    type Item = CaptureRecord;

    fn next(&mut self) -> Option<CaptureRecord> {
        let HeapEntry { record, stream } = self.heap.pop()?;
        if let Some(next) = self.streams[stream].next() {
            self.heap.push(HeapEntry { record: next, stream });
        }
        Some(record)
    }
}

/// Merge sorted streams; the index of a stream in `streams` is its dispatch order.
pub fn merge_streams(mut streams: Vec<CaptureStream>) -> CaptureStream {
    match streams.len() {
        0 => Box::new(std::iter::empty()),
        1 => streams.remove(0),
        _ => Box::new(MergedStream::new(streams)),
    }
}

#[derive(Debug, Clone)]
struct OriginalPayload {
    filename: Option<String>,
    offset: Option<u64>,
    length: Option<u64>,
    status: Option<String>,
}

/// Annotates revisit records with the location of the original payload,
/// looked up by `(urlkey, digest)` among records already seen.
pub struct ResolveRevisits {
    inner: CaptureStream,
    originals: HashMap<(String, String), OriginalPayload>,
}

impl ResolveRevisits {
    pub fn new(inner: CaptureStream) -> Self {
        Self {
            inner,
            originals: HashMap::new(),
        }
    }
}

impl Iterator for ResolveRevisits {
    type Item = CaptureRecord;

    fn next(&mut self) -> Option<CaptureRecord> {
        let mut record = self.inner.next()?;
        let Some(digest) = record.digest.clone() else {
            return Some(record);
        };
        let key = (record.urlkey.clone(), digest);

        if !record.is_revisit() {
            self.originals.entry(key).or_insert_with(|| OriginalPayload {
                filename: record.filename.clone(),
                offset: record.offset,
                length: record.length,
                status: record.status.clone(),
            });
        } else if let Some(orig) = self.originals.get(&key) {
            if let Some(filename) = &orig.filename {
                record.set_extra(ORIG_FILENAME, filename.clone());
            }
            if let Some(offset) = orig.offset {
                record.set_extra(ORIG_OFFSET, offset.to_string());
            }
            if let Some(length) = orig.length {
                record.set_extra(ORIG_LENGTH, length.to_string());
            }
            if record.status.is_none() {
                record.status = orig.status.clone();
            }
        }
        Some(record)
    }
}

/// Drops records whose `(urlkey, timestamp[..digits])` repeats the previous one.
pub struct Collapse {
    inner: CaptureStream,
    digits: usize,
    last: Option<(String, String)>,
}

impl Collapse {
    pub fn new(inner: CaptureStream, digits: usize) -> Self {
        Self {
            inner,
            digits,
            last: None,
        }
    }
}

impl Iterator for Collapse {
    type Item = CaptureRecord;

    fn next(&mut self) -> Option<CaptureRecord> {
        loop {
            let record = self.inner.next()?;
            let prefix: String = record.timestamp.chars().take(self.digits).collect();
            let token = (record.urlkey.clone(), prefix);
            if self.last.as_ref() == Some(&token) {
                continue;
            }
            self.last = Some(token);
            return Some(record);
        }
    }
}

/// Stable sort by absolute distance to `closest`, with `tie` deciding between
/// captures equally far before and after. Unparseable timestamps sort last.
pub fn closest_sort(
    records: impl Iterator<Item = CaptureRecord>,
    closest: &str,
    tie: ClosestTie,
    limit: Option<usize>,
) -> Vec<CaptureRecord> {
    let target = timestamp_to_secs(closest).ok();
    let mut keyed: Vec<(u64, i8, CaptureRecord)> = records
        .map(|record| {
            let (distance, side) = match (target, timestamp_to_secs(&record.timestamp)) {
                (Some(t), Ok(secs)) => {
                    let side = match secs.cmp(&t) {
                        Ordering::Less => -1,
                        Ordering::Equal => 0,
                        Ordering::Greater => 1,
                    };
                    (secs.abs_diff(t), side)
                }
                _ => (u64::MAX, 0),
            };
            let side = match tie {
                ClosestTie::PreferEarlier => side,
                ClosestTie::PreferLater => -side,
            };
            (distance, side, record)
        })
        .collect();

    keyed.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    if let Some(limit) = limit {
        keyed.truncate(limit);
    }
    keyed.into_iter().map(|(_, _, record)| record).collect()
}

/// The last `limit` records (all when `None`), newest first.
pub fn reverse_bounded(records: impl Iterator<Item = CaptureRecord>, limit: Option<usize>) -> Vec<CaptureRecord> {
    let mut tail: VecDeque<CaptureRecord> = VecDeque::new();
    for record in records {
        if limit == Some(0) {
            break;
        }
        tail.push_back(record);
        if let Some(limit) = limit {
            if tail.len() > limit {
                tail.pop_front();
            }
        }
    }
    tail.into_iter().rev().collect()
}

/// Apply the post-merge pipeline for `query` to a merged, sorted stream.
pub fn post_process(records: CaptureStream, query: &IndexQuery) -> CaptureStream {
    let mut records = records;

    if query.resolve_revisits {
        records = Box::new(ResolveRevisits::new(records));
    }

    if !query.filters.is_empty() {
        let filters = query.filters.clone();
        records = Box::new(records.filter(move |r| filters.iter().all(|f| f.matches(r))));
    }

    if query.from.is_some() || query.to.is_some() {
        let from = query.from.clone();
        let to = query.to.clone();
        records = Box::new(records.filter(move |r| {
            from.as_deref().map_or(true, |f| r.timestamp.as_str() >= f)
                && to.as_deref().map_or(true, |t| r.timestamp.as_str() <= t)
        }));
    }

    if let Some(prefix) = query.timestamp.clone() {
        records = Box::new(records.filter(move |r| r.timestamp.starts_with(&prefix)));
    }

    if let Some(digits) = query.collapse_time {
        records = Box::new(Collapse::new(records, digits));
    }

    if let Some(closest) = &query.closest {
        Box::new(closest_sort(records, closest, query.closest_tie, query.limit).into_iter())
    } else if query.reverse {
        Box::new(reverse_bounded(records, query.limit).into_iter())
    } else if let Some(limit) = query.limit {
        Box::new(records.take(limit))
    } else {
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdxfed_shared::types::filter::FieldFilter;

    fn rec(urlkey: &str, ts: &str) -> CaptureRecord {
        CaptureRecord::new(urlkey, ts)
    }

    fn stream(records: Vec<CaptureRecord>) -> CaptureStream {
        Box::new(records.into_iter())
    }

    fn tagged(urlkey: &str, ts: &str, source: &str) -> CaptureRecord {
        let mut r = rec(urlkey, ts);
        r.source = Some(source.to_string());
        r
    }

    fn keys(records: &[CaptureRecord]) -> Vec<(String, String)> {
        records
            .iter()
            .map(|r| (r.urlkey.clone(), r.timestamp.clone()))
            .collect()
    }

    #[test]
    fn test_merge_is_sorted_and_complete() {
        let a = vec![rec("a", "2014"), rec("b", "2014"), rec("d", "2014")];
        let b = vec![rec("a", "2013"), rec("c", "2014")];
        let c = vec![];
        let merged: Vec<_> = merge_streams(vec![stream(a), stream(b), stream(c)]).collect();
        assert_eq!(merged.len(), 5);
        let ks = keys(&merged);
        let mut sorted = ks.clone();
        sorted.sort();
        assert_eq!(ks, sorted);
    }

    #[test]
    fn test_merge_ties_follow_dispatch_order() {
        let merged: Vec<_> = merge_streams(vec![
            stream(vec![tagged("a", "2014", "first")]),
            stream(vec![tagged("a", "2014", "second")]),
        ])
        .collect();
        assert_eq!(merged[0].source.as_deref(), Some("first"));
        assert_eq!(merged[1].source.as_deref(), Some("second"));
    }

    #[test]
    fn test_merge_order_independent_up_to_ties() {
        let x = || vec![rec("a", "2011"), rec("b", "2015"), rec("c", "2012")];
        let y = || vec![rec("a", "2012"), rec("b", "2013")];
        let xy: Vec<_> = merge_streams(vec![stream(x()), stream(y())]).collect();
        let yx: Vec<_> = merge_streams(vec![stream(y()), stream(x())]).collect();
        assert_eq!(keys(&xy), keys(&yx));
    }

    fn capture(ts: &str, mime: &str, digest: &str) -> CaptureRecord {
        let mut r = rec("com,example)/", ts);
        r.mime = Some(mime.to_string());
        r.digest = Some(digest.to_string());
        r
    }

    #[test]
    fn test_revisit_resolution() {
        let mut original = capture("20140101000000", "text/html", "AAA");
        original.filename = Some("a.warc.gz".into());
        original.offset = Some(100);
        original.length = Some(2000);
        original.status = Some("200".into());
        let revisit = capture("20150101000000", "warc/revisit", "AAA");
        let orphan = capture("20160101000000", "warc/revisit", "BBB");

        let out: Vec<_> = ResolveRevisits::new(stream(vec![original, revisit, orphan])).collect();
        assert_eq!(out[1].extra_str(ORIG_FILENAME), Some("a.warc.gz"));
        assert_eq!(out[1].extra_str(ORIG_OFFSET), Some("100"));
        assert_eq!(out[1].extra_str(ORIG_LENGTH), Some("2000"));
        assert_eq!(out[1].status.as_deref(), Some("200"));
        assert!(out[1].is_revisit());
        assert_eq!(out[2].extra_str(ORIG_FILENAME), None);
    }

    #[test]
    fn test_collapse() {
        let out: Vec<_> = Collapse::new(
            stream(vec![
                rec("a", "20140101000000"),
                rec("a", "20140105000000"),
                rec("a", "20150101000000"),
                rec("b", "20150101000000"),
            ]),
            4,
        )
        .collect();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_closest_sort_and_tie_policy() {
        let records = || {
            vec![
                rec("a", "20140101000000"),
                rec("a", "20140101000010"),
                rec("a", "20140101000020"),
                rec("a", "20140101000100"),
            ]
        };
        let out = closest_sort(records().into_iter(), "20140101000010", ClosestTie::PreferEarlier, None);
        let ts: Vec<_> = out.iter().map(|r| r.timestamp.as_str()).collect();
        assert_eq!(
            ts,
            vec!["20140101000010", "20140101000000", "20140101000020", "20140101000100"]
        );

        let out = closest_sort(records().into_iter(), "20140101000010", ClosestTie::PreferLater, Some(2));
        let ts: Vec<_> = out.iter().map(|r| r.timestamp.as_str()).collect();
        assert_eq!(ts, vec!["20140101000010", "20140101000020"]);
    }

    #[test]
    fn test_reverse_bounded() {
        let records = vec![rec("a", "1"), rec("a", "2"), rec("a", "3"), rec("a", "4")];
        let out = reverse_bounded(records.clone().into_iter(), Some(2));
        assert_eq!(keys(&out), vec![("a".into(), "4".into()), ("a".into(), "3".into())]);
        assert_eq!(reverse_bounded(records.clone().into_iter(), None).len(), 4);
        assert!(reverse_bounded(records.into_iter(), Some(0)).is_empty());
    }

    #[test]
    fn test_post_process_order() {
        let mut q = IndexQuery::new("http://example.com/").unwrap();
        q.from = Some("20140101000000".into());
        q.to = Some("20161231235959".into());
        q.filters.push(FieldFilter::parse("!mime:warc/revisit").unwrap());
        q.limit = Some(2);

        let mut records = vec![
            capture("20130101000000", "text/html", "A"),
            capture("20140101000000", "text/html", "B"),
            capture("20150101000000", "warc/revisit", "B"),
            capture("20150601000000", "text/html", "C"),
            capture("20160101000000", "text/html", "D"),
            capture("20170101000000", "text/html", "E"),
        ];
        records.iter_mut().for_each(|r| r.urlkey = "com,example)/".into());
        let out: Vec<_> = post_process(stream(records), &q).collect();
        let ts: Vec<_> = out.iter().map(|r| r.timestamp.as_str()).collect();
        assert_eq!(ts, vec!["20140101000000", "20150601000000"]);
    }

    #[test]
    fn test_timestamp_prefix_filter() {
        let mut q = IndexQuery::new("http://example.com/").unwrap();
        q.timestamp = Some("2015".into());
        let out: Vec<_> = post_process(
            stream(vec![rec("a", "20141231000000"), rec("a", "20150101000000")]),
            &q,
        )
        .collect();
        assert_eq!(out.len(), 1);
    }
}
