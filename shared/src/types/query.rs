//! Index query contract
//!
//! Every query resolves to one `SearchRange` over the SURT key space; all
//! sources interpret that range identically.

use crate::error::IndexError;
use crate::types::filter::FieldFilter;
use crate::utils::inc_last_char;
use crate::utils::surt::{surt_host, Canonicalizer, SurtCanonicalizer};
use crate::utils::time::{pad_timestamp, Pad};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How the query key selects index lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    #[default]
    Exact,
    Prefix,
    Host,
    Domain,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Prefix => "prefix",
            MatchType::Host => "host",
            MatchType::Domain => "domain",
        }
    }
}

impl std::str::FromStr for MatchType {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exact" => Ok(MatchType::Exact),
            "prefix" => Ok(MatchType::Prefix),
            "host" => Ok(MatchType::Host),
            "domain" => Ok(MatchType::Domain),
            other => Err(IndexError::bad_query(format!("invalid matchType: {}", other))),
        }
    }
}

/// Which side wins when two captures are equally distant from `closest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosestTie {
    #[default]
    PreferEarlier,
    PreferLater,
}

impl std::str::FromStr for ClosestTie {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "earlier" | "prefer_earlier" => Ok(ClosestTie::PreferEarlier),
            "later" | "prefer_later" => Ok(ClosestTie::PreferLater),
            other => Err(IndexError::bad_query(format!("invalid closest tie policy: {}", other))),
        }
    }
}

/// Half-open key range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRange {
    pub start: String,
    pub end: String,
}

impl SearchRange {
    /// Whether a key (or a whole index line beginning with a key) is in range.
    pub fn contains(&self, key: &str) -> bool {
        key >= self.start.as_str() && key < self.end.as_str()
    }

    /// Whether a key sorts at or past the end of the range.
    pub fn is_past(&self, key: &str) -> bool {
        key >= self.end.as_str()
    }
}

/// One index lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexQuery {
    /// Target URL as given by the caller
    pub url: String,

    /// Canonical SURT key of `url`
    pub urlkey: String,

    pub match_type: MatchType,

    /// Only captures whose timestamp starts with these digits
    pub timestamp: Option<String>,

    /// Sort by distance to this 14-digit timestamp
    pub closest: Option<String>,
    pub closest_tie: ClosestTie,

    /// Inclusive 14-digit bounds
    pub from: Option<String>,
    pub to: Option<String>,

    pub limit: Option<usize>,
    pub reverse: bool,

    /// Subset of source names to query (`outer:inner` selects nested sources)
    pub sources: Option<Vec<String>>,

    /// Block-level paging for cluster indexes
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub show_num_pages: bool,

    pub resolve_revisits: bool,

    /// Collapse captures sharing the first N timestamp digits
    pub collapse_time: Option<usize>,

    pub filters: Vec<FieldFilter>,

    /// Free-form parameters for source-specific needs (`coll`, `db`, ...)
    pub params: BTreeMap<String, String>,
}

impl IndexQuery {
    /// Exact query for `url` with the default SURT canonicalizer.
    pub fn new(url: &str) -> Result<Self, IndexError> {
        Self::with_canonicalizer(url, &SurtCanonicalizer)
    }

    pub fn with_canonicalizer(url: &str, canon: &dyn Canonicalizer) -> Result<Self, IndexError> {
        let urlkey = canon.canonicalize(url)?;
        Ok(Self {
            url: url.to_string(),
            urlkey,
            match_type: MatchType::Exact,
            timestamp: None,
            closest: None,
            closest_tie: ClosestTie::default(),
            from: None,
            to: None,
            limit: None,
            reverse: false,
            sources: None,
            page: None,
            page_size: None,
            show_num_pages: false,
            resolve_revisits: false,
            collapse_time: None,
            filters: Vec::new(),
            params: BTreeMap::new(),
        })
    }

    pub fn with_match_type(mut self, match_type: MatchType) -> Self {
        self.match_type = match_type;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_closest(mut self, closest: &str) -> Result<Self, IndexError> {
        self.closest = Some(pad_timestamp(closest, Pad::Down)?);
        Ok(self)
    }

    pub fn with_sources(mut self, names: &[&str]) -> Self {
        self.sources = Some(names.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn with_page(mut self, page: usize, page_size: usize) -> Self {
        self.page = Some(page);
        self.page_size = Some(page_size);
        self
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Build a query from CDX-server style parameters.
    ///
    /// Recognised: `url`, `matchType`, `closest`, `closestTie`, `timestamp`,
    /// `from`, `to`, `limit`, `reverse`, `sort=reverse`, `sources`, `page`,
    /// `pageSize`, `showNumPages`, `resolveRevisits`, `collapseTime`,
    /// `filter` (repeatable). Anything else lands in `params`.
    pub fn from_params(pairs: &[(String, String)]) -> Result<Self, IndexError> {
        let get = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };

        let raw_url = get("url")
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| IndexError::bad_query("missing url"))?;

        let mut match_type = get("matchType").map(str::parse::<MatchType>).transpose()?;
        let mut url = raw_url.trim().to_string();
        if match_type.is_none() {
            if let Some(stripped) = url.strip_suffix('*') {
                url = stripped.to_string();
                match_type = Some(MatchType::Prefix);
            } else if let Some(stripped) = url.strip_prefix("*.") {
                url = stripped.to_string();
                match_type = Some(MatchType::Domain);
            }
        }

        let mut query = Self::new(&url)?.with_match_type(match_type.unwrap_or_default());

        let parse_usize = |key: &str, v: &str| {
            v.parse::<usize>()
                .map_err(|_| IndexError::bad_query(format!("invalid {}: {:?}", key, v)))
        };
        let truthy = |v: &str| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes");

        for (key, value) in pairs {
            match key.as_str() {
                "url" | "matchType" => {}
                "closest" => query.closest = Some(pad_timestamp(value, Pad::Down)?),
                "closestTie" => query.closest_tie = value.parse()?,
                "timestamp" => {
                    pad_timestamp(value, Pad::Down)?;
                    query.timestamp = Some(value.clone());
                }
                "from" => query.from = Some(pad_timestamp(value, Pad::Down)?),
                "to" => query.to = Some(pad_timestamp(value, Pad::Up)?),
                "limit" => query.limit = Some(parse_usize(key.as_str(), value.as_str())?),
                "reverse" => query.reverse = truthy(value.as_str()),
                "sort" => match value.as_str() {
                    "reverse" => query.reverse = true,
                    "closest" | "" => {}
                    other => return Err(IndexError::bad_query(format!("invalid sort: {}", other))),
                },
                "sources" => {
                    let names: Vec<String> = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                    if !names.is_empty() {
                        query.sources = Some(names);
                    }
                }
                "page" => query.page = Some(parse_usize(key.as_str(), value.as_str())?),
                "pageSize" => query.page_size = Some(parse_usize(key.as_str(), value.as_str())?),
                "showNumPages" => query.show_num_pages = truthy(value.as_str()),
                "resolveRevisits" => query.resolve_revisits = truthy(value.as_str()),
                "collapseTime" => query.collapse_time = Some(parse_usize(key.as_str(), value.as_str())?),
                "filter" => query.filters.push(FieldFilter::parse(value)?),
                _ => {
                    query.params.insert(key.clone(), value.clone());
                }
            }
        }

        query.validate()?;
        Ok(query)
    }

    /// Query-level validation; failures here are fatal before any dispatch.
    pub fn validate(&self) -> Result<(), IndexError> {
        if self.page_size == Some(0) {
            return Err(IndexError::bad_query("pageSize must be greater than 0"));
        }
        if let Some(n) = self.collapse_time {
            if n == 0 || n > 14 {
                return Err(IndexError::bad_query(format!("invalid collapseTime: {}", n)));
            }
        }
        if let (Some(from), Some(to)) = (&self.from, &self.to) {
            if from > to {
                return Err(IndexError::bad_query("from is after to"));
            }
        }
        self.search_range().map(|_| ())
    }

    /// The key range this query selects.
    pub fn search_range(&self) -> Result<SearchRange, IndexError> {
        let key = self.urlkey.as_str();
        if key.is_empty() {
            return Err(IndexError::bad_query("empty url key"));
        }
        let (start, end) = match self.match_type {
            MatchType::Exact => (key.to_string(), format!("{}!", key)),
            MatchType::Prefix => {
                let mut start = key.to_string();
                if self.url.ends_with('/') && !start.ends_with('/') {
                    start.push('/');
                }
                if self.url.ends_with('?') && !start.ends_with('?') {
                    start.push('?');
                }
                let end = inc_last_char(&start);
                (start, end)
            }
            MatchType::Host => {
                let host = surt_host(key);
                (format!("{})/", host), format!("{}*", host))
            }
            MatchType::Domain => {
                let host = surt_host(key);
                if host.contains(':') {
                    return Err(IndexError::bad_query("matchType=domain does not support ports"));
                }
                let start = if host.contains(',') {
                    format!("{})/", host)
                } else {
                    format!("{},", host)
                };
                (start, format!("{}-", host))
            }
        };
        Ok(SearchRange { start, end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_exact_range() {
        let q = IndexQuery::new("http://example.com/").unwrap();
        let r = q.search_range().unwrap();
        assert!(r.contains("com,example)/"));
        assert!(r.contains("com,example)/ 20140126200624 {}"));
        assert!(!r.contains("com,example)/a"));
        assert!(!r.contains("com,example)"));
    }

    #[test]
    fn test_prefix_range() {
        let q = IndexQuery::new("http://example.com/path")
            .unwrap()
            .with_match_type(MatchType::Prefix);
        let r = q.search_range().unwrap();
        assert!(r.contains("com,example)/path"));
        assert!(r.contains("com,example)/path/sub"));
        assert!(r.contains("com,example)/paths"));
        assert!(!r.contains("com,example)/pat"));
        assert!(!r.contains("com,example)/q"));
    }

    #[test]
    fn test_host_and_domain_ranges() {
        let q = IndexQuery::new("http://example.com/x")
            .unwrap()
            .with_match_type(MatchType::Host);
        let r = q.search_range().unwrap();
        assert!(r.contains("com,example)/anything"));
        assert!(!r.contains("com,example,www)/"));

        let q = q.with_match_type(MatchType::Domain);
        let r = q.search_range().unwrap();
        assert!(r.contains("com,example)/anything"));
        assert!(r.contains("com,example,blog)/"));
        assert!(!r.contains("com,examples)/"));
        assert!(!r.contains("com,example-shop)/"));
        assert!(!r.contains("com,exampld)/"));
    }

    #[test]
    fn test_from_params() {
        let q = IndexQuery::from_params(&pairs(&[
            ("url", "example.com/*"),
            ("closest", "2014"),
            ("limit", "5"),
            ("sort", "reverse"),
            ("filter", "=status:200"),
            ("filter", "!mime:warc/revisit"),
            ("sources", "local, remote"),
            ("coll", "main"),
        ]))
        .unwrap();
        assert_eq!(q.match_type, MatchType::Prefix);
        assert_eq!(q.urlkey, "com,example)/");
        assert_eq!(q.closest.as_deref(), Some("20140101000000"));
        assert_eq!(q.limit, Some(5));
        assert!(q.reverse);
        assert_eq!(q.filters.len(), 2);
        assert_eq!(q.sources, Some(vec!["local".to_string(), "remote".to_string()]));
        assert_eq!(q.param("coll"), Some("main"));
    }

    #[test]
    fn test_domain_wildcard() {
        let q = IndexQuery::from_params(&pairs(&[("url", "*.example.com")])).unwrap();
        assert_eq!(q.match_type, MatchType::Domain);
        assert_eq!(q.urlkey, "com,example)/");
    }

    #[test]
    fn test_validation_errors() {
        let bad = |items: &[(&str, &str)]| {
            matches!(
                IndexQuery::from_params(&pairs(items)),
                Err(IndexError::BadQuery(_))
            )
        };
        assert!(bad(&[]));
        assert!(bad(&[("url", "")]));
        assert!(bad(&[("url", "example.com"), ("closest", "2014ab")]));
        assert!(bad(&[("url", "example.com"), ("matchType", "fuzzy")]));
        assert!(bad(&[("url", "example.com"), ("page", "-1")]));
        assert!(bad(&[("url", "example.com"), ("pageSize", "0")]));
        assert!(bad(&[("url", "example.com"), ("collapseTime", "15")]));
        assert!(bad(&[("url", "example.com"), ("filter", "nocolon")]));
        assert!(bad(&[("url", "example.com"), ("from", "2015"), ("to", "2014")]));
    }
}
