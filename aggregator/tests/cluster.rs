//! Cluster index paging over real gzipped shards.

mod common;

use cdxfed_aggregator::source::ClusterIndexSource;
use cdxfed_aggregator::{Aggregator, NamedSource};
use cdxfed_shared::{IndexError, IndexQuery};
use common::cdxj;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::Path;

const BLOCKS: usize = 38;

/// One shard of `BLOCKS` gzip members, two captures per block, plus its
/// summary and location files.
fn build_cluster(dir: &Path) {
    build_shard(dir, BLOCKS, None);
}

/// `blocks` gzip members; the deflate payload of block `corrupt` is inverted.
fn build_shard(dir: &Path, blocks: usize, corrupt: Option<usize>) {
    let mut shard = Vec::new();
    let mut summary = String::new();
    for i in 0..blocks {
        let path = format!("/page{:02}", i);
        let lines = [
            cdxj(&path, "20140101000000", r#""status": "200""#),
            cdxj(&path, "20150101000000", r#""status": "200""#),
        ];
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all((lines.join("\n") + "\n").as_bytes()).unwrap();
        let mut block = encoder.finish().unwrap();
        if corrupt == Some(i) {
            let body_end = block.len() - 8;
            for byte in &mut block[10..body_end] {
                *byte ^= 0xFF;
            }
        }

        summary.push_str(&format!(
            "com,example){} 20140101000000\tpart-00\t{}\t{}\t{}\n",
            path,
            shard.len(),
            block.len(),
            i * 2
        ));
        shard.extend_from_slice(&block);
    }
    std::fs::write(dir.join("part-00.cdxj.gz"), shard).unwrap();
    std::fs::write(dir.join("index.summary"), summary).unwrap();
    std::fs::write(dir.join("index.loc"), "part-00\tpart-00.cdxj.gz\n").unwrap();
}

fn aggregator(dir: &Path) -> Aggregator {
    let source = ClusterIndexSource::new(dir.join("index.summary"), Some(&dir.join("index.loc")))
        .unwrap()
        .with_page_size(4);
    Aggregator::new(vec![NamedSource::new("cluster", source)])
}

fn query(params: &[(&str, &str)]) -> IndexQuery {
    let mut pairs = vec![("url".to_string(), "http://example.com/page*".to_string())];
    pairs.extend(params.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    IndexQuery::from_params(&pairs).unwrap()
}

#[tokio::test]
async fn page_count_covers_every_block() {
    let dir = tempfile::tempdir().unwrap();
    build_cluster(dir.path());
    let agg = aggregator(dir.path());

    let count = agg.num_pages(&query(&[])).await.unwrap().unwrap();
    assert_eq!((count.pages, count.page_size, count.blocks), (10, 4, BLOCKS));
}

#[tokio::test]
async fn pages_select_blocks() {
    let dir = tempfile::tempdir().unwrap();
    build_cluster(dir.path());
    let agg = aggregator(dir.path());

    let first: Vec<_> = agg.search(&query(&[("page", "0")])).await.unwrap().records.collect();
    assert_eq!(first.len(), 8);
    assert_eq!(first[0].urlkey, "com,example)/page00");
    assert_eq!(first[7].urlkey, "com,example)/page03");

    let last: Vec<_> = agg.search(&query(&[("page", "9")])).await.unwrap().records.collect();
    assert_eq!(last.len(), 4);
    assert_eq!(last[3].urlkey, "com,example)/page37");

    match agg.search(&query(&[("page", "10")])).await {
        Err(IndexError::BadQuery(msg)) => assert_eq!(msg, "page 10 invalid, last page is 9"),
        other => panic!("expected bad query, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn reverse_pages_count_from_the_end() {
    let dir = tempfile::tempdir().unwrap();
    build_cluster(dir.path());
    let agg = aggregator(dir.path());

    let page: Vec<_> = agg
        .search(&query(&[("page", "0"), ("reverse", "true")]))
        .await
        .unwrap()
        .records
        .collect();
    assert_eq!(page.len(), 8);
    assert_eq!(page[0].urlkey, "com,example)/page37");
    assert_eq!(page[0].timestamp, "20150101000000");
    assert_eq!(page[7].urlkey, "com,example)/page34");
}

#[tokio::test]
async fn unpaged_lookup_reads_only_matching_lines() {
    let dir = tempfile::tempdir().unwrap();
    build_cluster(dir.path());
    let agg = aggregator(dir.path());

    let pairs = vec![("url".to_string(), "http://example.com/page17".to_string())];
    let q = IndexQuery::from_params(&pairs).unwrap();
    let records: Vec<_> = agg.search(&q).await.unwrap().records.collect();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.urlkey == "com,example)/page17"));
    assert_eq!(records[0].source.as_deref(), Some("cluster"));
}

#[tokio::test]
async fn corrupt_block_fails_the_source() {
    let dir = tempfile::tempdir().unwrap();
    build_shard(dir.path(), 3, Some(1));
    let agg = aggregator(dir.path());

    match agg.search(&query(&[])).await {
        Err(IndexError::AllSourcesFailed(errors)) => {
            assert!(errors["cluster"].contains("read failed"));
        }
        other => panic!("expected the cluster to fail, got {:?}", other.map(|r| r.records.count())),
    }

    // Blocks before the corrupt one are still readable on their own
    let pairs = vec![("url".to_string(), "http://example.com/page00".to_string())];
    let q = IndexQuery::from_params(&pairs).unwrap();
    assert_eq!(agg.search(&q).await.unwrap().records.count(), 2);
}

#[tokio::test]
async fn truncated_shard_is_a_short_read() {
    let dir = tempfile::tempdir().unwrap();
    build_shard(dir.path(), 3, None);
    let shard = dir.path().join("part-00.cdxj.gz");
    let bytes = std::fs::read(&shard).unwrap();
    std::fs::write(&shard, &bytes[..bytes.len() / 2]).unwrap();
    let agg = aggregator(dir.path());

    match agg.search(&query(&[])).await {
        Err(IndexError::AllSourcesFailed(errors)) => assert!(errors["cluster"].contains("short read")),
        other => panic!("expected a short read, got {:?}", other.map(|r| r.records.count())),
    }
}
