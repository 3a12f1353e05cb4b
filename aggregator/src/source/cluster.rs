//! Compressed cluster ("zipnum") index source
//!
//! A cluster index is a set of shard files made of independently gzipped
//! blocks of sorted index lines, plus:
//!
//! * a summary file with one line per block,
//!   `first-key \t part \t offset \t length [\t lineno]`, itself sorted
//! * an optional location file mapping `part \t path-or-url`
//!
//! A lookup binary-searches the summary (including the block before the first
//! matching key, which may hold the start of the range), optionally pages over
//! the matched blocks, then fetches and decompresses only those blocks.
//! A block that fails to decompress fails the lookup rather than truncating it.

use super::{read_records, IndexSource, PageCount, QueryContext, RecordLines, SourceResult};
use crate::binsearch::BinarySearchReader;
use async_trait::async_trait;
use cdxfed_shared::{CaptureRecord, IndexError, IndexQuery, SearchRange};
use flate2::read::MultiGzDecoder;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Cursor};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

pub const DEFAULT_PAGE_SIZE: usize = 10;

/// One summary entry: a compressed block in a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRef {
    pub key: String,
    pub part: String,
    pub offset: u64,
    pub length: u64,
}

impl BlockRef {
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split('\t');
        let key = fields.next()?.to_string();
        let part = fields.next()?.to_string();
        let offset = fields.next()?.trim().parse().ok()?;
        let length = fields.next()?.trim().parse().ok()?;
        Some(Self { key, part, offset, length })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Location {
    Local(PathBuf),
    Remote(String),
}

impl Location {
    fn parse(spec: &str, base: &Path) -> Self {
        if spec.starts_with("http://") || spec.starts_with("https://") {
            Location::Remote(spec.to_string())
        } else {
            let path = Path::new(spec);
            if path.is_absolute() {
                Location::Local(path.to_path_buf())
            } else {
                Location::Local(base.join(path))
            }
        }
    }
}

/// Contiguous byte span covering one or more adjacent blocks of a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FetchSpan {
    part: String,
    offset: u64,
    length: u64,
}

pub struct ClusterIndexSource {
    summary: PathBuf,
    locations: HashMap<String, Location>,
    base_dir: PathBuf,
    page_size: usize,
    client: reqwest::Client,
}

impl ClusterIndexSource {
    /// Open a cluster index from its summary file and optional location file.
    /// Without a location file, parts resolve relative to the summary's directory.
    pub fn new(summary: impl Into<PathBuf>, locations: Option<&Path>) -> Result<Self, IndexError> {
        let summary = summary.into();
        if !summary.is_file() {
            return Err(IndexError::NotFound(format!(
                "cluster summary {} does not exist",
                summary.display()
            )));
        }
        let base_dir = summary
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let locations = match locations {
            Some(path) => load_locations(path, &base_dir)?,
            None => HashMap::new(),
        };

        Ok(Self {
            summary,
            locations,
            base_dir,
            page_size: DEFAULT_PAGE_SIZE,
            client: reqwest::Client::new(),
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn location(&self, part: &str) -> Location {
        self.locations
            .get(part)
            .cloned()
            .unwrap_or_else(|| Location::parse(part, &self.base_dir))
    }

    /// Blocks whose lines may fall in `range`, in summary order.
    async fn blocks(&self, range: &SearchRange) -> Result<Vec<BlockRef>, IndexError> {
        let summary = self.summary.clone();
        let range = range.clone();
        tokio::task::spawn_blocking(move || read_blocks(&summary, &range))
            .await
            .map_err(|e| IndexError::source(format!("summary scan task failed: {}", e)))?
    }

    async fn fetch(&self, span: &FetchSpan, ctx: &QueryContext) -> Result<Vec<u8>, IndexError> {
        match self.location(&span.part) {
            Location::Local(path) => {
                let mut file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| IndexError::source(format!("{}: {}", path.display(), e)))?;
                file.seek(std::io::SeekFrom::Start(span.offset)).await?;
                // The summary's length is untrusted; read at most that much
                let mut buf = Vec::new();
                file.take(span.length).read_to_end(&mut buf).await?;
                if (buf.len() as u64) < span.length {
                    return Err(IndexError::source(format!(
                        "{}: short read at offset {} ({} of {} bytes)",
                        path.display(),
                        span.offset,
                        buf.len(),
                        span.length
                    )));
                }
                Ok(buf)
            }
            Location::Remote(url) => {
                let end = span.offset + span.length.saturating_sub(1);
                let mut request = self
                    .client
                    .get(&url)
                    .header(reqwest::header::RANGE, format!("bytes={}-{}", span.offset, end));
                if let Some(remaining) = ctx.remaining() {
                    request = request.timeout(remaining);
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| IndexError::source(format!("{}: {}", url, e)))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(IndexError::source(format!("{}: HTTP {}", url, status)));
                }
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| IndexError::source(format!("{}: {}", url, e)))?;
                if status == reqwest::StatusCode::PARTIAL_CONTENT {
                    Ok(body.to_vec())
                } else {
                    // Range ignored: slice the full body
                    let start = span.offset as usize;
                    let stop = start + span.length as usize;
                    body.get(start..stop)
                        .map(<[u8]>::to_vec)
                        .ok_or_else(|| IndexError::source(format!("{}: short shard", url)))
                }
            }
        }
    }
}

fn load_locations(path: &Path, base_dir: &Path) -> Result<HashMap<String, Location>, IndexError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        IndexError::NotFound(format!("cluster location file {}: {}", path.display(), e))
    })?;
    let mut locations = HashMap::new();
    for line in text.lines() {
        let mut fields = line.split('\t');
        let (Some(part), Some(loc)) = (fields.next(), fields.next()) else {
            continue;
        };
        // Several locations may be listed; the first one wins
        locations
            .entry(part.trim().to_string())
            .or_insert_with(|| Location::parse(loc.trim(), base_dir));
    }
    Ok(locations)
}

fn read_blocks(summary: &Path, range: &SearchRange) -> Result<Vec<BlockRef>, IndexError> {
    let reader = BinarySearchReader::open(summary)
        .map_err(|e| IndexError::source(format!("{}: {}", summary.display(), e)))?;
    // The block just before the first key >= start may contain the start of the
    // range. The scan stops at the first block whose key is past the end, so a
    // range ending on a block's last line never pulls in the next block.
    let mut blocks = Vec::new();
    for line in reader.iter_range_with_prev(&range.start, &range.end, 1)? {
        let line = line?;
        match BlockRef::parse(&line) {
            Some(block) => blocks.push(block),
            None => warn!(summary = %summary.display(), line = %line, "skipping malformed summary line"),
        }
    }
    Ok(blocks)
}

/// Select the blocks for `page`. Pages count from the end when `reverse` is set;
/// the selected blocks are always returned in ascending order.
pub fn select_page(
    blocks: &[BlockRef],
    page: usize,
    page_size: usize,
    reverse: bool,
) -> Result<&[BlockRef], IndexError> {
    let total = blocks.len();
    if total == 0 {
        return Ok(blocks);
    }
    let pages = total.div_ceil(page_size);
    if page >= pages {
        return Err(IndexError::bad_query(format!(
            "page {} invalid, last page is {}",
            page,
            pages - 1
        )));
    }
    let (start, end) = if reverse {
        let end = total - page * page_size;
        (end.saturating_sub(page_size), end)
    } else {
        (page * page_size, ((page + 1) * page_size).min(total))
    };
    Ok(&blocks[start..end])
}

/// Coalesce adjacent blocks of the same part into single reads.
fn fetch_spans(blocks: &[BlockRef]) -> Vec<FetchSpan> {
    let mut spans: Vec<FetchSpan> = Vec::new();
    for block in blocks {
        if let Some(last) = spans.last_mut() {
            if last.part == block.part && last.offset + last.length == block.offset {
                last.length += block.length;
                continue;
            }
        }
        spans.push(FetchSpan {
            part: block.part.clone(),
            offset: block.offset,
            length: block.length,
        });
    }
    spans
}

/// Decompress fetched spans and keep only lines in `range`. A corrupt block
/// fails the whole lookup.
fn decode_blocks(chunks: Vec<Vec<u8>>, range: &SearchRange, label: &str) -> Result<Vec<CaptureRecord>, IndexError> {
    let start = range.start.as_str();
    let lines = chunks
        .into_iter()
        .flat_map(|chunk| BufReader::new(MultiGzDecoder::new(Cursor::new(chunk))).lines())
        .skip_while(|line| matches!(line, Ok(l) if l.as_str() < start))
        .take_while(|line| !matches!(line, Ok(l) if range.is_past(l)));
    read_records(RecordLines::new(lines, label))
}

#[async_trait]
impl IndexSource for ClusterIndexSource {
    fn kind(&self) -> &'static str {
        "cluster"
    }

    async fn query(&self, query: &IndexQuery, ctx: &QueryContext) -> Result<SourceResult, IndexError> {
        let range = query.search_range()?;
        let all_blocks = self.blocks(&range).await?;

        let blocks = match query.page {
            Some(page) => {
                let page_size = query.page_size.unwrap_or(self.page_size);
                select_page(&all_blocks, page, page_size, query.reverse)?
            }
            None => &all_blocks[..],
        };
        if blocks.is_empty() {
            return Ok(SourceResult::empty());
        }

        let spans = fetch_spans(blocks);
        debug!(
            summary = %self.summary.display(),
            blocks = blocks.len(),
            reads = spans.len(),
            "fetching cluster blocks"
        );

        let fetches = futures::future::try_join_all(spans.iter().map(|span| self.fetch(span, ctx)));
        let chunks = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(IndexError::Timeout),
            chunks = fetches => chunks?,
        };

        let label = self.summary.display().to_string();
        let records = tokio::task::spawn_blocking(move || decode_blocks(chunks, &range, &label))
            .await
            .map_err(|e| IndexError::source(format!("block decode task failed: {}", e)))??;
        Ok(SourceResult::from_vec(records))
    }

    async fn page_count(&self, query: &IndexQuery, _ctx: &QueryContext) -> Result<Option<PageCount>, IndexError> {
        let range = query.search_range()?;
        let blocks = self.blocks(&range).await?.len();
        let page_size = query.page_size.unwrap_or(self.page_size);
        Ok(Some(PageCount {
            pages: blocks.div_ceil(page_size),
            page_size,
            blocks,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(key: &str, part: &str, offset: u64, length: u64) -> BlockRef {
        BlockRef {
            key: key.to_string(),
            part: part.to_string(),
            offset,
            length,
        }
    }

    fn blocks(n: usize) -> Vec<BlockRef> {
        (0..n)
            .map(|i| block(&format!("k{:03}", i), "part-00", i as u64 * 100, 100))
            .collect()
    }

    #[test]
    fn test_parse_summary_line() {
        let b = BlockRef::parse("com,example)/ 20140101000000\tpart-00\t1024\t311\t3000").unwrap();
        assert_eq!(b.key, "com,example)/ 20140101000000");
        assert_eq!(b.part, "part-00");
        assert_eq!((b.offset, b.length), (1024, 311));
        assert!(BlockRef::parse("com,example)/\tpart-00\tabc\t1").is_none());
    }

    #[test]
    fn test_select_page() {
        let all = blocks(38);
        assert_eq!(select_page(&all, 0, 4, false).unwrap()[0].key, "k000");
        let last = select_page(&all, 9, 4, false).unwrap();
        assert_eq!(last.len(), 2);
        assert_eq!(last[1].key, "k037");

        let err = select_page(&all, 10, 4, false).unwrap_err();
        assert_eq!(err.to_string(), "bad query: page 10 invalid, last page is 9");

        let first_reversed = select_page(&all, 0, 4, true).unwrap();
        let keys: Vec<_> = first_reversed.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["k034", "k035", "k036", "k037"]);
        assert_eq!(select_page(&all, 9, 4, true).unwrap().len(), 2);

        assert!(select_page(&[], 3, 4, false).unwrap().is_empty());
    }

    #[test]
    fn test_adjacent_blocks_coalesce() {
        let spans = fetch_spans(&[
            block("a", "p0", 0, 10),
            block("b", "p0", 10, 5),
            block("c", "p1", 0, 7),
            block("d", "p1", 20, 3),
        ]);
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].length, 15);
        assert_eq!(spans[2].offset, 20);
    }

    fn gzip(text: &str) -> Vec<u8> {
        use flate2::write::GzEncoder;
        use std::io::Write;
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_corrupt_block_fails_decode() {
        let range = SearchRange {
            start: "com,example)/".into(),
            end: "com,example)0".into(),
        };
        let good = gzip("com,example)/a 20140101000000 {}\ncom,example)/b 20140101000000 {}\n");
        let mut bad = gzip("com,example)/c 20140101000000 {}\n");
        let body_end = bad.len() - 8;
        bad[10..body_end].iter_mut().for_each(|b| *b ^= 0xFF);
        let tail = gzip("com,example)/d 20140101000000 {}\n");

        let records = decode_blocks(vec![good.clone(), tail.clone()], &range, "idx").unwrap();
        assert_eq!(records.len(), 3);

        let mut joined = good;
        joined.extend_from_slice(&bad);
        joined.extend_from_slice(&tail);
        let err = decode_blocks(vec![joined], &range, "idx").unwrap_err();
        assert!(err.to_string().starts_with("source error: idx: read failed"));
    }

    #[test]
    fn test_location_resolution() {
        let base = Path::new("/data/cluster");
        assert_eq!(
            Location::parse("part-00.gz", base),
            Location::Local(PathBuf::from("/data/cluster/part-00.gz"))
        );
        assert_eq!(
            Location::parse("http://host/part-00.gz", base),
            Location::Remote("http://host/part-00.gz".into())
        );
    }
}
