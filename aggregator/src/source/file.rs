//! Local sorted CDX/CDXJ file source

use super::{read_records, IndexSource, QueryContext, RecordLines, SourceResult};
use crate::binsearch::{BinarySearchReader, DEFAULT_BLOCK_SIZE};
use async_trait::async_trait;
use cdxfed_shared::{CaptureRecord, IndexError, IndexQuery, SearchRange};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct FileIndexSource {
    path: PathBuf,
    block_size: u64,
}

impl FileIndexSource {
    /// Fails with `NotFound` if the file does not exist.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, IndexError> {
        let path = path.into();
        if !path.is_file() {
            return Err(IndexError::NotFound(format!(
                "index file {} does not exist",
                path.display()
            )));
        }
        Ok(Self {
            path,
            block_size: DEFAULT_BLOCK_SIZE,
        })
    }

    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size.max(1);
        self
    }
}

fn scan_file(path: &Path, block_size: u64, range: &SearchRange) -> Result<Vec<CaptureRecord>, IndexError> {
    let reader = BinarySearchReader::open(path)
        .map_err(|e| IndexError::source(format!("{}: {}", path.display(), e)))?
        .with_block_size(block_size);
    let lines = reader.iter_range(&range.start, &range.end)?;
    read_records(RecordLines::new(lines, path.display().to_string()))
}

#[async_trait]
impl IndexSource for FileIndexSource {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn query(&self, query: &IndexQuery, _ctx: &QueryContext) -> Result<SourceResult, IndexError> {
        let range = query.search_range()?;
        debug!(path = %self.path.display(), start = %range.start, end = %range.end, "file lookup");

        let path = self.path.clone();
        let block_size = self.block_size;
        let records = tokio::task::spawn_blocking(move || scan_file(&path, block_size, &range))
            .await
            .map_err(|e| IndexError::source(format!("file scan task failed: {}", e)))??;

        Ok(SourceResult::from_vec(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdxfed_shared::MatchType;
    use std::io::Write;

    fn index_file(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_exact_lookup() {
        let file = index_file(&[
            r#"com,example)/ 20140101000000 {"url": "http://example.com/", "status": "200"}"#,
            r#"com,example)/ 20150101000000 {"url": "http://example.com/", "status": "200"}"#,
            r#"com,example)/about 20140101000000 {"url": "http://example.com/about"}"#,
        ]);
        let source = FileIndexSource::new(file.path()).unwrap().with_block_size(32);
        let query = IndexQuery::new("http://example.com/").unwrap();
        let result = source.query(&query, &QueryContext::new()).await.unwrap();
        let records: Vec<_> = result.records.collect();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.urlkey == "com,example)/"));
        assert!(records[0].timestamp < records[1].timestamp);
    }

    #[tokio::test]
    async fn test_prefix_lookup_skips_malformed() {
        let file = index_file(&[
            r#"com,example)/a 20140101000000 {}"#,
            "com,example)/b not-a-record",
            r#"com,example)/c 20140101000000 {}"#,
            r#"org,other)/ 20140101000000 {}"#,
        ]);
        let source = FileIndexSource::new(file.path()).unwrap();
        let query = IndexQuery::new("http://example.com/")
            .unwrap()
            .with_match_type(MatchType::Prefix);
        let records: Vec<_> = source
            .query(&query, &QueryContext::new())
            .await
            .unwrap()
            .records
            .collect();
        let keys: Vec<_> = records.iter().map(|r| r.urlkey.as_str()).collect();
        assert_eq!(keys, vec!["com,example)/a", "com,example)/c"]);
    }

    #[tokio::test]
    async fn test_only_malformed_lines_is_source_error() {
        let file = index_file(&["com,example)/ garbage", "com,example)/ more-garbage"]);
        let source = FileIndexSource::new(file.path()).unwrap();
        let query = IndexQuery::new("http://example.com/").unwrap();
        let err = source.query(&query, &QueryContext::new()).await.unwrap_err();
        assert!(matches!(err, IndexError::Source(_)));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err = FileIndexSource::new("/nonexistent/index.cdxj").err().unwrap();
        assert!(matches!(err, IndexError::NotFound(_)));
    }
}
