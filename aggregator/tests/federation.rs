//! End-to-end federation: local index files, remote CDX servers and the live
//! web queried together through one aggregator.

mod common;

use cdxfed_aggregator::breaker::BreakerPolicy;
use cdxfed_aggregator::source::{FileIndexSource, LiveIndexSource, RemoteCdxIndexSource};
use cdxfed_aggregator::{Aggregator, NamedSource, SourceSequence};
use cdxfed_shared::{IndexError, IndexQuery, IS_LIVE, ORIG_FILENAME, ORIG_OFFSET};
use common::{cdxj, spawn_server, write_index, Reply};
use hyper::StatusCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn query(params: &[(&str, &str)]) -> IndexQuery {
    let pairs: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    IndexQuery::from_params(&pairs).unwrap()
}

fn local_lines() -> Vec<String> {
    vec![
        cdxj("/", "20140101000000", r#""mime": "text/html", "status": "200", "digest": "AAA", "filename": "a.warc.gz", "offset": "100", "length": "2000""#),
        cdxj("/", "20160101000000", r#""mime": "warc/revisit", "digest": "AAA""#),
        cdxj("/about", "20150101000000", r#""mime": "text/html", "status": "200""#),
    ]
}

/// Remote CDX server answering JSON rows for example.com/, optionally slowly.
async fn remote(delay: Option<Duration>) -> String {
    let addr = spawn_server(move |_req| {
        let body = r#"[["urlkey","timestamp","original","mimetype","statuscode"],
            ["com,example)/","20150601000000","http://example.com/","text/html","200"]]"#;
        let reply = Reply::ok(body);
        match delay {
            Some(d) => reply.delayed(d),
            None => reply,
        }
    })
    .await;
    format!("http://{}/cdx", addr)
}

#[tokio::test]
async fn concurrent_sources_merge_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_index(dir.path(), "local.cdxj", &local_lines());

    let aggregator = Aggregator::new(vec![
        NamedSource::new("local", FileIndexSource::new(&path).unwrap()),
        NamedSource::new("remote", RemoteCdxIndexSource::new(remote(None).await)),
        NamedSource::new("live", LiveIndexSource::new()),
    ]);

    let result = aggregator.search(&query(&[("url", "http://example.com/")])).await.unwrap();
    assert!(result.errors.is_empty());
    let records: Vec<_> = result.records.collect();
    let stamps: Vec<_> = records.iter().map(|r| r.timestamp.as_str()).collect();
    assert_eq!(records.len(), 4);
    assert_eq!(&stamps[..3], &["20140101000000", "20150601000000", "20160101000000"]);
    assert_eq!(records[1].source.as_deref(), Some("remote"));
    assert_eq!(records[3].source.as_deref(), Some("live"));
    assert_eq!(records[3].extra_str(IS_LIVE), Some("true"));
}

#[tokio::test]
async fn slow_source_times_out_without_blocking_others() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_index(dir.path(), "local.cdxj", &local_lines());

    let aggregator = Aggregator::new(vec![
        NamedSource::new("local", FileIndexSource::new(&path).unwrap()),
        NamedSource::new("slow", RemoteCdxIndexSource::new(remote(Some(Duration::from_secs(3))).await))
            .with_timeout(Duration::from_millis(200)),
    ]);

    let started = std::time::Instant::now();
    let result = aggregator.search(&query(&[("url", "http://example.com/")])).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(result.errors.get("slow").map(String::as_str), Some("timeout"));
    assert_eq!(result.records.count(), 2);
}

#[tokio::test]
async fn sequence_falls_through_to_the_next_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_index(dir.path(), "local.cdxj", &local_lines());

    let sequence = SourceSequence::new(vec![
        NamedSource::new("local", FileIndexSource::new(&path).unwrap()),
        NamedSource::new("remote", RemoteCdxIndexSource::new(remote(None).await)),
    ]);

    // Answered locally; the remote is never consulted
    let result = sequence.search(&query(&[("url", "http://example.com/about")])).await.unwrap();
    let records: Vec<_> = result.records.collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].source.as_deref(), Some("local"));

    // Nothing local under this key, so the remote answers
    let result = sequence.search(&query(&[("url", "http://example.com/contact")])).await;
    let records: Vec<_> = result.unwrap().records.collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].source.as_deref(), Some("remote"));
}

#[tokio::test]
async fn revisits_resolve_across_the_merged_stream() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_index(dir.path(), "local.cdxj", &local_lines());
    let aggregator = Aggregator::new(vec![NamedSource::new("local", FileIndexSource::new(&path).unwrap())]);

    let q = query(&[("url", "http://example.com/"), ("resolveRevisits", "true")]);
    let records: Vec<_> = aggregator.search(&q).await.unwrap().records.collect();
    assert_eq!(records.len(), 2);
    let revisit = &records[1];
    assert!(revisit.is_revisit());
    assert_eq!(revisit.status.as_deref(), Some("200"));
    assert_eq!(revisit.extra_str(ORIG_FILENAME), Some("a.warc.gz"));
    assert_eq!(revisit.extra_str(ORIG_OFFSET), Some("100"));
}

#[tokio::test]
async fn breaker_stops_calling_a_failing_source() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let addr = spawn_server(move |_req| {
        counter.fetch_add(1, Ordering::SeqCst);
        Reply::status(StatusCode::INTERNAL_SERVER_ERROR, "down")
    })
    .await;

    let policy = BreakerPolicy {
        t_count: 2,
        t_duration: Duration::from_secs(60),
    };
    let aggregator = Aggregator::with_policy(
        vec![
            NamedSource::new("flaky", RemoteCdxIndexSource::new(format!("http://{}/cdx", addr))),
            NamedSource::new("live", LiveIndexSource::new()),
        ],
        policy,
    );
    let q = query(&[("url", "http://example.com/")]);

    for _ in 0..2 {
        let result = aggregator.search(&q).await.unwrap();
        assert!(result.errors["flaky"].starts_with("source error"));
    }
    assert_eq!(aggregator.sources()[0].breaker, "open");

    let result = aggregator.search(&q).await.unwrap();
    assert_eq!(result.errors["flaky"], "timeout");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn every_source_failing_is_an_error() {
    let addr = spawn_server(|_req| Reply::status(StatusCode::BAD_GATEWAY, "")).await;
    let aggregator = Aggregator::new(vec![
        NamedSource::new("a", RemoteCdxIndexSource::new(format!("http://{}/a", addr))),
        NamedSource::new("b", RemoteCdxIndexSource::new(format!("http://{}/b", addr))),
    ]);

    match aggregator.search(&query(&[("url", "http://example.com/")])).await {
        Err(IndexError::AllSourcesFailed(errors)) => {
            assert_eq!(errors.len(), 2);
            assert!(errors.contains_key("a") && errors.contains_key("b"));
        }
        other => panic!("expected AllSourcesFailed, got {:?}", other.map(|_| ())),
    }
}

/// A local index holding one capture, a remote archive that has nothing and
/// the live web, asked for the capture closest to the start of its day.
async fn one_local_capture(dir: &std::path::Path) -> [NamedSource; 3] {
    let path = write_index(
        dir,
        "local.cdxj",
        &[cdxj("/", "20140126200624", r#""mime": "text/html", "status": "200""#)],
    );
    let addr = spawn_server(|_req| Reply::status(StatusCode::NOT_FOUND, "")).await;
    [
        NamedSource::new("local", FileIndexSource::new(&path).unwrap()),
        NamedSource::new("remote", RemoteCdxIndexSource::new(format!("http://{}/cdx", addr))),
        NamedSource::new("live", LiveIndexSource::new()),
    ]
}

#[tokio::test]
async fn concurrent_lookup_tags_every_answer() {
    let dir = tempfile::tempdir().unwrap();
    let aggregator = Aggregator::new(one_local_capture(dir.path()).await.into());
    let q = query(&[("url", "http://example.com/"), ("closest", "20140126000000")]);

    let result = aggregator.search(&q).await.unwrap();
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors["remote"].starts_with("not found"));

    let records: Vec<_> = result.records.collect();
    let sources: Vec<_> = records.iter().map(|r| r.source.as_deref()).collect();
    assert_eq!(sources, vec![Some("local"), Some("live")]);
    assert_eq!(records[0].timestamp, "20140126200624");
    assert_eq!(records[1].extra_str(IS_LIVE), Some("true"));
}

#[tokio::test]
async fn sequential_lookup_stops_at_the_local_answer() {
    let dir = tempfile::tempdir().unwrap();
    let sequence = SourceSequence::new(one_local_capture(dir.path()).await.into());
    let q = query(&[("url", "http://example.com/"), ("closest", "20140126000000")]);

    let result = sequence.search(&q).await.unwrap();
    assert!(!result.errors.contains_key("live"));
    let records: Vec<_> = result.records.collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].source.as_deref(), Some("local"));
    assert_eq!(records[0].timestamp, "20140126200624");
}
