//! Remote CDX-server source
//!
//! Queries an HTTP CDX API (`?url=...&matchType=...&output=json`). The
//! response may be NDJSON, CDXJ or legacy CDX lines, or a JSON array of rows
//! whose first row names the fields.

use super::{fill_replay_template, IndexSource, QueryContext, SourceResult};
use async_trait::async_trait;
use cdxfed_shared::{CaptureRecord, IndexError, IndexQuery, MatchType, SearchRange, LOAD_URL};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// How the match type is handled for a remote server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Pass `matchType` through and trust the server's selection.
    #[default]
    Delegate,
    /// Request a broader prefix query and filter to the range locally.
    LocalFilter,
}

pub struct RemoteCdxIndexSource {
    api_url: String,
    replay_url: Option<String>,
    mode: MatchMode,
    client: reqwest::Client,
}

impl RemoteCdxIndexSource {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            replay_url: None,
            mode: MatchMode::default(),
            client: reqwest::Client::new(),
        }
    }

    /// Template for `load_url`, e.g. `http://host/web/{timestamp}id_/{url}`.
    pub fn with_replay_url(mut self, template: impl Into<String>) -> Self {
        self.replay_url = Some(template.into());
        self
    }

    pub fn with_match_mode(mut self, mode: MatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn request_params(&self, query: &IndexQuery) -> Vec<(&'static str, String)> {
        let match_type = match (self.mode, query.match_type) {
            (MatchMode::LocalFilter, MatchType::Exact) => MatchType::Prefix,
            (_, m) => m,
        };
        let mut params = vec![
            ("url", query.url.clone()),
            ("matchType", match_type.as_str().to_string()),
            ("output", "json".to_string()),
        ];
        if let Some(from) = &query.from {
            params.push(("from", from.clone()));
        }
        if let Some(to) = &query.to {
            params.push(("to", to.clone()));
        }
        if let (Some(closest), MatchMode::Delegate) = (&query.closest, self.mode) {
            params.push(("closest", closest.clone()));
            params.push(("sort", "closest".to_string()));
        }
        // A limit is only safe to forward when nothing downstream reorders or drops records
        let order_preserving = query.closest.is_none()
            && !query.reverse
            && query.filters.is_empty()
            && query.collapse_time.is_none()
            && query.timestamp.is_none()
            && self.mode == MatchMode::Delegate;
        if let (Some(limit), true) = (query.limit, order_preserving) {
            params.push(("limit", limit.to_string()));
        }
        params
    }

    fn finish(&self, mut records: Vec<CaptureRecord>, range: &SearchRange) -> Vec<CaptureRecord> {
        if self.mode == MatchMode::LocalFilter {
            records.retain(|r| range.contains(&r.urlkey));
        }
        // Servers are free to answer in any order
        records.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        if let Some(template) = &self.replay_url {
            for record in &mut records {
                let url = record.url.clone().unwrap_or_default();
                let load_url = fill_replay_template(template, &record.timestamp, &url);
                record.set_extra(LOAD_URL, load_url);
            }
        }
        records
    }
}

/// Map a non-success HTTP status to the error taxonomy.
pub(crate) fn status_error(url: &str, status: reqwest::StatusCode, body: &str) -> IndexError {
    let detail = body.trim().lines().next().unwrap_or("").to_string();
    match status.as_u16() {
        404 | 410 => IndexError::NotFound(url.to_string()),
        403 => IndexError::AccessDenied(url.to_string()),
        400 => IndexError::bad_query(detail),
        code => IndexError::source(format!("{}: HTTP {}", url, code)),
    }
}

/// Parse a CDX-server response body.
pub fn parse_response(body: &str, source: &str) -> Result<Vec<CaptureRecord>, IndexError> {
    let trimmed = body.trim_start();
    if trimmed.starts_with('[') {
        return parse_json_rows(trimmed);
    }

    let mut records = Vec::new();
    let mut malformed = 0usize;
    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        match CaptureRecord::parse(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                malformed += 1;
                warn!(source = %source, error = %e, "skipping malformed response line");
            }
        }
    }
    if records.is_empty() && malformed > 0 {
        return Err(IndexError::source(format!(
            "{} malformed lines and no valid records",
            malformed
        )));
    }
    Ok(records)
}

fn normalize_field(name: &str) -> &str {
    match name {
        "original" => "url",
        "mimetype" => "mime",
        "statuscode" => "status",
        other => other,
    }
}

fn parse_json_rows(body: &str) -> Result<Vec<CaptureRecord>, IndexError> {
    let rows: Vec<Vec<Value>> = serde_json::from_str(body)
        .map_err(|e| IndexError::source(format!("bad json response: {}", e)))?;
    let mut rows = rows.into_iter();
    let header: Vec<String> = match rows.next() {
        Some(header) => header
            .iter()
            .map(|v| normalize_field(v.as_str().unwrap_or("")).to_string())
            .collect(),
        None => return Ok(Vec::new()),
    };

    rows.map(|row| {
        let map: Map<String, Value> = header
            .iter()
            .cloned()
            .zip(row)
            .filter(|(_, v)| v.as_str() != Some("-"))
            .collect();
        CaptureRecord::from_json_map(map)
    })
    .collect()
}

#[async_trait]
impl IndexSource for RemoteCdxIndexSource {
    fn kind(&self) -> &'static str {
        "remote_cdx"
    }

    async fn query(&self, query: &IndexQuery, ctx: &QueryContext) -> Result<SourceResult, IndexError> {
        let range = query.search_range()?;
        let params = self.request_params(query);
        debug!(api = %self.api_url, ?params, "remote cdx query");

        let mut request = self.client.get(&self.api_url).query(&params);
        if let Some(remaining) = ctx.remaining() {
            request = request.timeout(remaining);
        }

        let send = async {
            let response = request
                .send()
                .await
                .map_err(|e| IndexError::source(format!("{}: {}", self.api_url, e)))?;
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| IndexError::source(format!("{}: {}", self.api_url, e)))?;
            if !status.is_success() {
                return Err(status_error(&self.api_url, status, &body));
            }
            Ok(body)
        };
        let body = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(IndexError::Timeout),
            body = send => body?,
        };

        let records = parse_response(&body, &self.api_url)?;
        Ok(SourceResult::from_vec(self.finish(records, &range)))
    }
}
