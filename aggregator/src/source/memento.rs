//! Memento (RFC 7089) source
//!
//! With `closest` set the TimeGate is asked for the memento nearest that
//! datetime; otherwise the full TimeMap is fetched. Only exact URL lookups are
//! meaningful against a Memento endpoint; other match types yield nothing.

use super::remote::status_error;
use super::{fill_replay_template, IndexSource, QueryContext, SourceResult};
use async_trait::async_trait;
use cdxfed_shared::utils::link::{parse_links, LinkEntry};
use cdxfed_shared::utils::time::{http_date_to_timestamp, timestamp_to_http_date};
use cdxfed_shared::{CaptureRecord, IndexError, IndexQuery, MatchType, LOAD_URL, MEMENTO_URL, MEM_REL};
use reqwest::header::{HeaderMap, LINK, LOCATION};
use tracing::debug;

const ACCEPT_DATETIME: &str = "Accept-Datetime";
const MEMENTO_DATETIME: &str = "Memento-Datetime";

pub struct MementoIndexSource {
    timegate_url: String,
    timemap_url: String,
    replay_url: Option<String>,
    client: reqwest::Client,
}

impl MementoIndexSource {
    /// Endpoint templates may contain `{url}`; otherwise the URL is appended.
    pub fn new(timegate_url: impl Into<String>, timemap_url: impl Into<String>) -> Result<Self, IndexError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| IndexError::source(format!("http client: {}", e)))?;
        Ok(Self {
            timegate_url: timegate_url.into(),
            timemap_url: timemap_url.into(),
            replay_url: None,
            client,
        })
    }

    pub fn with_replay_url(mut self, template: impl Into<String>) -> Self {
        self.replay_url = Some(template.into());
        self
    }

    async fn timegate(&self, query: &IndexQuery, closest: &str, ctx: &QueryContext) -> Result<Vec<LinkEntry>, IndexError> {
        let url = endpoint(&self.timegate_url, &query.url);
        let mut request = self
            .client
            .get(&url)
            .header(ACCEPT_DATETIME, timestamp_to_http_date(closest)?);
        if let Some(remaining) = ctx.remaining() {
            request = request.timeout(remaining);
        }
        let response = request
            .send()
            .await
            .map_err(|e| IndexError::source(format!("{}: {}", url, e)))?;
        let status = response.status();
        if !(status.is_success() || status.is_redirection()) {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&url, status, &body));
        }
        Ok(timegate_links(response.headers()))
    }

    async fn timemap(&self, query: &IndexQuery, ctx: &QueryContext) -> Result<Vec<LinkEntry>, IndexError> {
        let url = endpoint(&self.timemap_url, &query.url);
        let mut request = self.client.get(&url);
        if let Some(remaining) = ctx.remaining() {
            request = request.timeout(remaining);
        }
        let response = request
            .send()
            .await
            .map_err(|e| IndexError::source(format!("{}: {}", url, e)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| IndexError::source(format!("{}: {}", url, e)))?;
        if !status.is_success() {
            return Err(status_error(&url, status, &body));
        }
        Ok(parse_links(&body))
    }

    fn to_records(&self, query: &IndexQuery, links: Vec<LinkEntry>) -> Vec<CaptureRecord> {
        let original = links
            .iter()
            .find(|l| l.has_rel("original"))
            .map(|l| l.target.clone())
            .unwrap_or_else(|| query.url.clone());

        let mut records: Vec<CaptureRecord> = links
            .into_iter()
            .filter(|l| l.has_rel("memento"))
            .filter_map(|link| {
                let timestamp = http_date_to_timestamp(link.get("datetime")?).ok()?;
                let mut record = CaptureRecord::new(query.urlkey.clone(), timestamp);
                record.url = Some(original.clone());
                let load_url = match &self.replay_url {
                    Some(template) => fill_replay_template(template, &record.timestamp, &original),
                    None => link.target.clone(),
                };
                record.set_extra(LOAD_URL, load_url);
                record.set_extra(MEMENTO_URL, link.target.clone());
                if let Some(rel) = link.get("rel") {
                    record.set_extra(MEM_REL, rel.to_string());
                }
                Some(record)
            })
            .collect();

        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        // The same memento can appear under several rels
        records.dedup_by(|a, b| a.timestamp == b.timestamp && a.extra_str(MEMENTO_URL) == b.extra_str(MEMENTO_URL));
        records
    }
}

fn endpoint(template: &str, url: &str) -> String {
    if template.contains("{url}") {
        template.replace("{url}", url)
    } else {
        format!("{}{}", template, url)
    }
}

/// Mementos advertised by a TimeGate response: the `Link` header, or failing
/// that a bare `Location` plus `Memento-Datetime`.
fn timegate_links(headers: &HeaderMap) -> Vec<LinkEntry> {
    let mut links: Vec<LinkEntry> = headers
        .get_all(LINK)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(parse_links)
        .collect();

    if !links.iter().any(|l| l.has_rel("memento")) {
        let location = headers.get(LOCATION).and_then(|v| v.to_str().ok());
        let datetime = headers.get(MEMENTO_DATETIME).and_then(|v| v.to_str().ok());
        if let (Some(location), Some(datetime)) = (location, datetime) {
            links.push(
                LinkEntry::new(location)
                    .param("rel", "memento")
                    .param("datetime", datetime),
            );
        }
    }
    links
}

#[async_trait]
impl IndexSource for MementoIndexSource {
    fn kind(&self) -> &'static str {
        "memento"
    }

    async fn query(&self, query: &IndexQuery, ctx: &QueryContext) -> Result<SourceResult, IndexError> {
        if query.match_type != MatchType::Exact {
            return Ok(SourceResult::empty());
        }

        let lookup = async {
            match &query.closest {
                Some(closest) => {
                    debug!(url = %query.url, closest = %closest, "memento timegate lookup");
                    self.timegate(query, closest, ctx).await
                }
                None => {
                    debug!(url = %query.url, "memento timemap lookup");
                    self.timemap(query, ctx).await
                }
            }
        };
        let links = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(IndexError::Timeout),
            links = lookup => links?,
        };

        Ok(SourceResult::from_vec(self.to_records(query, links)))
    }
}
