//! Field filters: `[!][=|~]field:expr`
//!
//! * `status:2..` regex, anchored at the start of the value
//! * `=mime:text/html` exact match
//! * `~url:login` substring match
//! * a leading `!` inverts any of the above

use crate::error::IndexError;
use crate::types::capture::CaptureRecord;
use regex::Regex;

#[derive(Debug, Clone)]
enum Matcher {
    Regex(Regex),
    Exact(String),
    Contains(String),
}

#[derive(Debug, Clone)]
pub struct FieldFilter {
    field: String,
    matcher: Matcher,
    invert: bool,
    raw: String,
}

impl FieldFilter {
    pub fn parse(spec: &str) -> Result<Self, IndexError> {
        let raw = spec.to_string();
        let (invert, rest) = match spec.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, spec),
        };
        let (kind, rest) = match rest.chars().next() {
            Some('=') => ('=', &rest[1..]),
            Some('~') => ('~', &rest[1..]),
            _ => ('r', rest),
        };
        let (field, expr) = rest
            .split_once(':')
            .ok_or_else(|| IndexError::bad_query(format!("invalid filter: {:?}", spec)))?;
        if field.is_empty() {
            return Err(IndexError::bad_query(format!("filter without field: {:?}", spec)));
        }

        let matcher = match kind {
            '=' => Matcher::Exact(expr.to_string()),
            '~' => Matcher::Contains(expr.to_string()),
            _ => {
                let re = Regex::new(&format!("^(?:{})", expr)).map_err(|e| {
                    IndexError::bad_query(format!("invalid filter regex {:?}: {}", expr, e))
                })?;
                Matcher::Regex(re)
            }
        };

        Ok(Self {
            field: field.to_string(),
            matcher,
            invert,
            raw,
        })
    }

    pub fn matches(&self, record: &CaptureRecord) -> bool {
        let value = record.field(&self.field).unwrap_or_default();
        let hit = match &self.matcher {
            Matcher::Regex(re) => re.is_match(&value),
            Matcher::Exact(s) => value == *s,
            Matcher::Contains(s) => value.contains(s.as_str()),
        };
        hit != self.invert
    }

    /// The filter as originally written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for FieldFilter {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
