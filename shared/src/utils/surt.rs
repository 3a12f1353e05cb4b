//! SURT (Sort-friendly URI Reordering Transform) canonicalization
//!
//! `http://www.Example.com:80/Path?b=2&a=1#frag` becomes
//! `com,example)/path?a=1&b=2`. Host labels are reversed so that every page of
//! a domain (and its subdomains) sorts into one contiguous key range.

use crate::error::IndexError;

/// Pure, deterministic URL -> sort key function.
pub trait Canonicalizer: Send + Sync {
    fn canonicalize(&self, url: &str) -> Result<String, IndexError>;
}

/// Default SURT canonicalizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SurtCanonicalizer;

impl Canonicalizer for SurtCanonicalizer {
    fn canonicalize(&self, url: &str) -> Result<String, IndexError> {
        canonicalize(url)
    }
}

/// Canonicalize a URL into its SURT key.
pub fn canonicalize(url: &str) -> Result<String, IndexError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(IndexError::bad_query("empty url"));
    }

    let (scheme, rest) = match url.find("://") {
        Some(idx) => (url[..idx].to_ascii_lowercase(), &url[idx + 3..]),
        None => ("http".to_string(), url),
    };

    let split_at = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(split_at);

    let authority = authority.rsplit('@').next().unwrap_or(authority);
    let authority = authority.to_ascii_lowercase();
    let (host, port) = match authority.rfind(':') {
        Some(idx) if authority[idx + 1..].bytes().all(|b| b.is_ascii_digit()) => {
            (&authority[..idx], Some(&authority[idx + 1..]))
        }
        _ => (authority.as_str(), None),
    };
    let host = strip_www(host.trim_end_matches('.'));
    if host.is_empty() {
        return Err(IndexError::bad_query(format!("url has no host: {}", url)));
    }

    let mut key = if is_ipv4(host) {
        host.to_string()
    } else {
        host.split('.').rev().collect::<Vec<_>>().join(",")
    };
    let default_port = match scheme.as_str() {
        "https" => Some("443"),
        "http" => Some("80"),
        _ => None,
    };
    if let Some(port) = port {
        if !port.is_empty() && Some(port) != default_port {
            key.push(':');
            key.push_str(port);
        }
    }
    key.push(')');

    let tail = tail.split('#').next().unwrap_or("");
    let (path, query) = match tail.find('?') {
        Some(idx) => (&tail[..idx], Some(&tail[idx + 1..])),
        None => (tail, None),
    };
    if path.is_empty() {
        key.push('/');
    } else {
        key.push_str(&path.to_lowercase());
    }
    if let Some(query) = query {
        let mut args: Vec<String> = query
            .split('&')
            .filter(|a| !a.is_empty())
            .map(|a| a.to_lowercase())
            .collect();
        args.sort();
        if !args.is_empty() {
            key.push('?');
            key.push_str(&args.join("&"));
        }
    }
    Ok(key)
}

/// Host part of a SURT key: `com,example)/path` -> `com,example`.
pub fn surt_host(key: &str) -> &str {
    match key.find(')') {
        Some(idx) => &key[..idx],
        None => key,
    }
}

fn strip_www(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix("www") {
        let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        if let Some(stripped) = rest[digits..].strip_prefix('.') {
            if !stripped.is_empty() {
                return stripped;
            }
        }
    }
    host
}

fn is_ipv4(host: &str) -> bool {
    let parts: Vec<&str> = host.split('.').collect();
    parts.len() == 4 && parts.iter().all(|p| !p.is_empty() && p.parse::<u8>().is_ok())
}
