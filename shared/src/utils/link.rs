//! Link-format (RFC 5988 / RFC 6690) parsing and formatting
//!
//! Used both for Memento `Link:` headers and timemap bodies, and for the
//! link-format serialization of capture records.

/// One `<target>; key="value"; ...` entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkEntry {
    pub target: String,
    pub params: Vec<(String, String)>,
}

impl LinkEntry {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the space-separated `rel` attribute contains `rel`.
    pub fn has_rel(&self, rel: &str) -> bool {
        self.get("rel")
            .map(|v| v.split_whitespace().any(|r| r.eq_ignore_ascii_case(rel)))
            .unwrap_or(false)
    }
}

impl std::fmt::Display for LinkEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}>", self.target)?;
        for (k, v) in &self.params {
            write!(f, "; {}=\"{}\"", k, escape(v))?;
        }
        Ok(())
    }
}

fn escape(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Parse a link-format document or header value into entries.
///
/// Entries are separated by commas (and/or newlines); commas inside `<...>`
/// targets or quoted values do not split. Malformed fragments are skipped.
pub fn parse_links(input: &str) -> Vec<LinkEntry> {
    let mut entries = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        // Skip separators until the next '<'
        while let Some(&c) = chars.peek() {
            if c == '<' {
                break;
            }
            chars.next();
        }
        if chars.next().is_none() {
            break;
        }

        let mut entry = LinkEntry::default();
        for c in chars.by_ref() {
            if c == '>' {
                break;
            }
            entry.target.push(c);
        }

        // Params: ; key="value" | ; key=value | ; key
        loop {
            while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                chars.next();
            }
            match chars.peek() {
                Some(';') => {
                    chars.next();
                }
                _ => break,
            }
            while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                chars.next();
            }
            let mut key = String::new();
            while let Some(&c) = chars.peek() {
                if c == '=' || c == ';' || c == ',' || c.is_whitespace() {
                    break;
                }
                key.push(c);
                chars.next();
            }
            while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                chars.next();
            }
            let mut value = String::new();
            if chars.peek() == Some(&'=') {
                chars.next();
                while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                    chars.next();
                }
                if chars.peek() == Some(&'"') {
                    chars.next();
                    while let Some(c) = chars.next() {
                        match c {
                            '\\' => {
                                if let Some(escaped) = chars.next() {
                                    value.push(escaped);
                                }
                            }
                            '"' => break,
                            _ => value.push(c),
                        }
                    }
                } else {
                    while let Some(&c) = chars.peek() {
                        if c == ';' || c == ',' || c.is_whitespace() {
                            break;
                        }
                        value.push(c);
                        chars.next();
                    }
                }
            }
            if !key.is_empty() {
                entry.params.push((key.to_ascii_lowercase(), value));
            }
        }
        entries.push(entry);
    }
    entries
}
