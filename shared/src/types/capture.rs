//! Capture record definitions
//!
//! A `CaptureRecord` is one observed capture of a URL at a point in time. All
//! index sources produce them and the merge operates on them. Three textual
//! forms are supported and all round-trip through `parse_*`:
//!
//! * CDXJ: `urlkey timestamp {"url": ..., ...}`
//! * NDJSON: one JSON object per line, including `urlkey` and `timestamp`
//! * link-format: `<url>; rel="memento"; datetime="..."; src="name"; ...`
//!
//! Legacy space-delimited CDX (9 or 11 fields) is accepted on input.

use crate::error::IndexError;
use crate::utils::link::LinkEntry;
use crate::utils::time::{http_date_to_timestamp, timestamp_to_http_date};
use serde_json::{Map, Value};

/// MIME type marking a revisit record.
pub const REVISIT_MIME: &str = "warc/revisit";

/// Extension field names written by revisit resolution.
pub const ORIG_FILENAME: &str = "orig.filename";
pub const ORIG_OFFSET: &str = "orig.offset";
pub const ORIG_LENGTH: &str = "orig.length";

/// Extension field names used by remote and live sources.
pub const LOAD_URL: &str = "load_url";
pub const MEMENTO_URL: &str = "memento_url";
pub const MEM_REL: &str = "mem_rel";
pub const IS_LIVE: &str = "is_live";

/// One capture of a URL.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CaptureRecord {
    /// SURT sort key (primary sort dimension)
    pub urlkey: String,

    /// 14-digit UTC timestamp (secondary sort dimension)
    pub timestamp: String,

    /// Original URL
    pub url: Option<String>,

    pub mime: Option<String>,
    pub status: Option<String>,

    /// Payload digest, used for revisit resolution
    pub digest: Option<String>,

    pub redirect: Option<String>,

    /// Payload locator: `filename` + `offset` + `length`
    pub length: Option<u64>,
    pub offset: Option<u64>,
    pub filename: Option<String>,

    /// Name of the source that produced the record (`outer:inner` when nested)
    pub source: Option<String>,

    /// Source-specific fields (`load_url`, `mem_rel`, `orig.*`, ...)
    pub extra: Map<String, Value>,
}

impl CaptureRecord {
    pub fn new(urlkey: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            urlkey: urlkey.into(),
            timestamp: timestamp.into(),
            ..Default::default()
        }
    }

    /// Merge ordering key.
    pub fn sort_key(&self) -> (&str, &str) {
        (&self.urlkey, &self.timestamp)
    }

    pub fn is_revisit(&self) -> bool {
        self.mime.as_deref() == Some(REVISIT_MIME)
    }

    /// String value of an extension field.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    pub fn set_extra(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.extra.insert(key.into(), value.into());
    }

    /// Tag the record with the name of the source that produced it.
    /// An existing tag (from a nested aggregator) is prefixed: `outer:inner`.
    pub fn tag_source(&mut self, name: &str) {
        self.source = Some(match self.source.take() {
            Some(inner) => format!("{}:{}", name, inner),
            None => name.to_string(),
        });
    }

    /// Textual value of any field by name, as used by field filters.
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "urlkey" => Some(self.urlkey.clone()),
            "timestamp" => Some(self.timestamp.clone()),
            "url" | "original" => self.url.clone(),
            "mime" | "mimetype" => self.mime.clone(),
            "status" | "statuscode" => self.status.clone(),
            "digest" => self.digest.clone(),
            "redirect" => self.redirect.clone(),
            "length" => self.length.map(|v| v.to_string()),
            "offset" => self.offset.map(|v| v.to_string()),
            "filename" => self.filename.clone(),
            "source" => self.source.clone(),
            other => self.extra.get(other).map(value_to_string),
        }
    }

    /// JSON object of every populated field except `urlkey`/`timestamp`.
    fn body_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        let mut put = |k: &str, v: &Option<String>| {
            if let Some(v) = v {
                map.insert(k.to_string(), Value::String(v.clone()));
            }
        };
        put("url", &self.url);
        put("mime", &self.mime);
        put("status", &self.status);
        put("digest", &self.digest);
        put("redirect", &self.redirect);
        put("length", &self.length.map(|v| v.to_string()));
        put("offset", &self.offset.map(|v| v.to_string()));
        put("filename", &self.filename);
        put("source", &self.source);
        for (k, v) in &self.extra {
            map.insert(k.clone(), v.clone());
        }
        map
    }

    fn from_body_map(urlkey: String, timestamp: String, map: Map<String, Value>) -> Result<Self, IndexError> {
        let mut record = CaptureRecord::new(urlkey, timestamp);
        for (k, v) in map {
            match k.as_str() {
                "url" => record.url = Some(value_to_string(&v)),
                "mime" => record.mime = Some(value_to_string(&v)),
                "status" => record.status = Some(value_to_string(&v)),
                "digest" => record.digest = Some(value_to_string(&v)),
                "redirect" => record.redirect = Some(value_to_string(&v)),
                "filename" => record.filename = Some(value_to_string(&v)),
                "source" => record.source = Some(value_to_string(&v)),
                "length" => record.length = parse_number(&k, &v)?,
                "offset" => record.offset = parse_number(&k, &v)?,
                "urlkey" | "timestamp" => {}
                _ => {
                    record.extra.insert(k.clone(), v);
                }
            }
        }
        Ok(record)
    }

    /// `urlkey timestamp {json}`
    pub fn to_cdxj(&self) -> String {
        format!(
            "{} {} {}",
            self.urlkey,
            self.timestamp,
            Value::Object(self.body_map())
        )
    }

    /// One JSON object including `urlkey` and `timestamp`.
    pub fn to_json(&self) -> String {
        let mut map = self.body_map();
        map.insert("urlkey".into(), Value::String(self.urlkey.clone()));
        map.insert("timestamp".into(), Value::String(self.timestamp.clone()));
        Value::Object(map).to_string()
    }

    /// Memento link entry. The target is `load_url` when present, otherwise the
    /// original URL. A `url` attribute marks a `load_url` target and carries the
    /// original URL, empty when there is none. Every other populated field
    /// travels as a link extension attribute.
    pub fn to_link_entry(&self) -> LinkEntry {
        let load_url = self.extra_str(LOAD_URL);
        let target = load_url
            .or(self.url.as_deref())
            .unwrap_or(&self.urlkey);
        let rel = self.extra_str(MEM_REL).unwrap_or("memento");

        let mut entry = LinkEntry::new(target).param("rel", rel);
        if let Ok(date) = timestamp_to_http_date(&self.timestamp) {
            entry = entry.param("datetime", date);
        }
        if let Some(src) = &self.source {
            entry = entry.param("src", src.clone());
        }
        entry = entry.param("urlkey", self.urlkey.clone());
        if load_url.is_some() && self.url.is_none() {
            entry = entry.param("url", "");
        }

        for (k, v) in self.body_map() {
            match k.as_str() {
                "source" | MEM_REL | LOAD_URL => {}
                "url" if load_url.is_none() => {}
                _ => entry = entry.param(k, value_to_string(&v)),
            }
        }
        entry
    }

    pub fn to_link(&self) -> String {
        self.to_link_entry().to_string()
    }

    /// Parse one index line: CDXJ, JSON object, or legacy space-delimited CDX.
    pub fn parse(line: &str) -> Result<Self, IndexError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let trimmed = line.trim_start();
        if trimmed.starts_with('{') {
            return Self::parse_json(trimmed);
        }

        let mut parts = line.splitn(3, ' ');
        let urlkey = parts.next().unwrap_or("");
        let timestamp = parts.next().unwrap_or("");
        if urlkey.is_empty() || timestamp.is_empty() {
            return Err(IndexError::source(format!("malformed index line: {:?}", line)));
        }
        if !timestamp.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IndexError::source(format!("bad timestamp in line: {:?}", line)));
        }
        let rest = parts.next().unwrap_or("").trim();

        if rest.starts_with('{') {
            let map: Map<String, Value> = serde_json::from_str(rest)
                .map_err(|e| IndexError::source(format!("bad cdxj json: {}", e)))?;
            return Self::from_body_map(urlkey.to_string(), timestamp.to_string(), map);
        }

        Self::parse_legacy(urlkey, timestamp, rest)
    }

    /// Parse an NDJSON line.
    pub fn parse_json(line: &str) -> Result<Self, IndexError> {
        let map: Map<String, Value> = serde_json::from_str(line.trim())
            .map_err(|e| IndexError::source(format!("bad json record: {}", e)))?;
        Self::from_json_map(map)
    }

    /// Build a record from a JSON object that includes `urlkey` and `timestamp`.
    pub fn from_json_map(mut map: Map<String, Value>) -> Result<Self, IndexError> {
        let urlkey = map.remove("urlkey").map(|v| value_to_string(&v));
        let timestamp = map.remove("timestamp").map(|v| value_to_string(&v));
        match (urlkey, timestamp) {
            (Some(urlkey), Some(timestamp)) => Self::from_body_map(urlkey, timestamp, map),
            _ => Err(IndexError::source("json record without urlkey/timestamp")),
        }
    }

    /// Parse a link-format entry produced by `to_link`.
    pub fn parse_link(text: &str) -> Result<Self, IndexError> {
        let entry = crate::utils::link::parse_links(text)
            .into_iter()
            .next()
            .ok_or_else(|| IndexError::source("empty link"))?;
        Self::from_link_entry(&entry)
    }

    pub fn from_link_entry(entry: &LinkEntry) -> Result<Self, IndexError> {
        let timestamp = entry
            .get("datetime")
            .map(http_date_to_timestamp)
            .transpose()?
            .ok_or_else(|| IndexError::source("link without datetime"))?;
        let urlkey = entry
            .get("urlkey")
            .ok_or_else(|| IndexError::source("link without urlkey"))?;

        let mut map = Map::new();
        let has_url_attr = entry.get("url").is_some();
        for (k, v) in &entry.params {
            match k.as_str() {
                "datetime" | "urlkey" => {}
                "url" if v.is_empty() => {}
                "src" => {
                    map.insert("source".into(), Value::String(v.clone()));
                }
                "rel" => {
                    map.insert(MEM_REL.into(), Value::String(v.clone()));
                }
                _ => {
                    map.insert(k.clone(), Value::String(v.clone()));
                }
            }
        }
        let target_field = if has_url_attr { LOAD_URL } else { "url" };
        map.insert(target_field.into(), Value::String(entry.target.clone()));

        Self::from_body_map(urlkey.to_string(), timestamp, map)
    }

    fn parse_legacy(urlkey: &str, timestamp: &str, rest: &str) -> Result<Self, IndexError> {
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let dash = |s: &str| -> Option<String> {
            if s == "-" || s.is_empty() {
                None
            } else {
                Some(s.to_string())
            }
        };
        let num = |s: &str| -> Result<Option<u64>, IndexError> {
            if s == "-" {
                return Ok(None);
            }
            s.parse::<u64>()
                .map(Some)
                .map_err(|_| IndexError::source(format!("bad number in cdx line: {:?}", s)))
        };

        let mut record = CaptureRecord::new(urlkey, timestamp);
        match fields.len() {
            // original mime status digest redirect robotflags length offset filename
            9 => {
                record.url = dash(fields[0]);
                record.mime = dash(fields[1]);
                record.status = dash(fields[2]);
                record.digest = dash(fields[3]);
                record.redirect = dash(fields[4]);
                if let Some(flags) = dash(fields[5]) {
                    record.set_extra("robotflags", flags);
                }
                record.length = num(fields[6])?;
                record.offset = num(fields[7])?;
                record.filename = dash(fields[8]);
            }
            // original mime status digest redirect offset filename
            7 => {
                record.url = dash(fields[0]);
                record.mime = dash(fields[1]);
                record.status = dash(fields[2]);
                record.digest = dash(fields[3]);
                record.redirect = dash(fields[4]);
                record.offset = num(fields[5])?;
                record.filename = dash(fields[6]);
            }
            n => {
                return Err(IndexError::source(format!(
                    "unsupported cdx line with {} fields",
                    n + 2
                )))
            }
        }
        Ok(record)
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_number(field: &str, v: &Value) -> Result<Option<u64>, IndexError> {
    match v {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| IndexError::source(format!("bad {}: {}", field, n))),
        Value::String(s) if s == "-" || s.is_empty() => Ok(None),
        Value::String(s) => s
            .parse::<u64>()
            .map(Some)
            .map_err(|_| IndexError::source(format!("bad {}: {:?}", field, s))),
        other => Err(IndexError::source(format!("bad {}: {}", field, other))),
    }
}
