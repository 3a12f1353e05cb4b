//! Serialization formats for query results

use crate::error::IndexError;
use crate::types::capture::CaptureRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Cdxj,
    Json,
    Link,
}

impl OutputFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Cdxj => "text/x-cdxj",
            OutputFormat::Json => "application/x-ndjson",
            OutputFormat::Link => "application/link-format",
        }
    }

    pub fn render(&self, record: &CaptureRecord) -> String {
        match self {
            OutputFormat::Cdxj => record.to_cdxj(),
            OutputFormat::Json => record.to_json(),
            OutputFormat::Link => record.to_link(),
        }
    }

    /// Render a whole result set. Link entries are comma-separated as in a
    /// TimeMap; the other formats are one record per line.
    pub fn render_all(&self, records: impl Iterator<Item = CaptureRecord>) -> String {
        let sep = match self {
            OutputFormat::Link => ",\n",
            _ => "\n",
        };
        let mut out = String::new();
        for (i, record) in records.enumerate() {
            if i > 0 {
                out.push_str(sep);
            }
            out.push_str(&self.render(&record));
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cdxj" | "cdx" | "text" => Ok(OutputFormat::Cdxj),
            "json" | "ndjson" => Ok(OutputFormat::Json),
            "link" => Ok(OutputFormat::Link),
            other => Err(IndexError::bad_query(format!("invalid output: {}", other))),
        }
    }
}
