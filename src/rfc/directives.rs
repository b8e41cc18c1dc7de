//! `Cache-Control` directive grammar (RFC 7234 §5.2).
//!
//! ```text
//! Cache-Control   = 1#cache-directive
//! cache-directive = token [ "=" ( token / quoted-string ) ]
//! ```
//!
//! Parsing is item-by-item: a malformed item is reported and dropped while
//! the rest of the list is still honoured. The same grammar covers the
//! CDN-targeted variants (`Surrogate-Control`, `CDN-Cache-Control`, ...).

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Largest delta-seconds value a cache must handle (RFC 7234 §1.2.1).
/// Larger values are clamped to it.
pub const MAX_DELTA_SECONDS: u64 = 1 << 31;

const NUMERIC_DIRECTIVES: &[&str] = &[
    "max-age",
    "s-maxage",
    "stale-while-revalidate",
    "stale-if-error",
    "min-fresh",
];

/// A parsed directive list: lowercase directive name to optional value.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use rttp_cache::rfc::directives::parse;
///
/// let parsed = parse(r#"public, max-age=60, no-cache="Set-Cookie", bogus item"#);
/// assert!(parsed.directives.public());
/// assert_eq!(parsed.directives.max_age(), Some(Duration::from_secs(60)));
/// assert_eq!(parsed.directives.value("no-cache"), Some("Set-Cookie"));
/// assert_eq!(parsed.malformed, vec!["bogus item".to_string()]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControlDirectives {
    entries: HashMap<String, Option<String>>,
    // Insertion order, for rendering.
    order: Vec<String>,
}

/// Outcome of [`parse`]: the accepted directives and the rejected items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedDirectives {
    pub directives: CacheControlDirectives,
    pub malformed: Vec<String>,
}

/// The request `max-stale` directive, with or without a bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxStale {
    Any,
    Within(Duration),
}

impl ParsedDirectives {
    /// Returns `true` when the header carried content but none of it was
    /// usable.
    pub fn is_wholly_malformed(&self) -> bool {
        self.directives.is_empty() && !self.malformed.is_empty()
    }
}

impl CacheControlDirectives {
    /// Returns `true` if no directive was recognised.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct directives.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if `name` is present, with or without a value.
    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// Returns the value of `name`, if it carried one.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.as_deref())
    }

    fn seconds(&self, name: &str) -> Option<Duration> {
        self.value(name).and_then(delta_seconds).map(Duration::from_secs)
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.seconds("max-age")
    }

    pub fn s_maxage(&self) -> Option<Duration> {
        self.seconds("s-maxage")
    }

    pub fn stale_while_revalidate(&self) -> Option<Duration> {
        self.seconds("stale-while-revalidate")
    }

    pub fn stale_if_error(&self) -> Option<Duration> {
        self.seconds("stale-if-error")
    }

    pub fn min_fresh(&self) -> Option<Duration> {
        self.seconds("min-fresh")
    }

    pub fn max_stale(&self) -> Option<MaxStale> {
        match self.entries.get("max-stale")? {
            None => Some(MaxStale::Any),
            Some(v) => delta_seconds(v).map(|s| MaxStale::Within(Duration::from_secs(s))),
        }
    }

    pub fn no_store(&self) -> bool {
        self.has("no-store")
    }

    pub fn no_cache(&self) -> bool {
        self.has("no-cache")
    }

    pub fn private(&self) -> bool {
        self.has("private")
    }

    pub fn public(&self) -> bool {
        self.has("public")
    }

    pub fn must_revalidate(&self) -> bool {
        self.has("must-revalidate")
    }

    pub fn proxy_revalidate(&self) -> bool {
        self.has("proxy-revalidate")
    }

    pub fn only_if_cached(&self) -> bool {
        self.has("only-if-cached")
    }

    fn push(&mut self, name: String, value: Option<String>) {
        if self.entries.contains_key(&name) {
            return;
        }
        self.order.push(name.clone());
        self.entries.insert(name, value);
    }
}

impl fmt::Display for CacheControlDirectives {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, name) in self.order.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(name)?;
            match self.entries.get(name).and_then(|v| v.as_deref()) {
                Some(v) if v.bytes().all(is_tchar) && !v.is_empty() => write!(f, "={v}")?,
                Some(v) => write!(f, "=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\""))?,
                None => {}
            }
        }
        Ok(())
    }
}

/// Parses a directive list. Never fails: malformed items land in
/// [`ParsedDirectives::malformed`].
pub fn parse(header_value: &str) -> ParsedDirectives {
    let mut parsed = ParsedDirectives::default();

    for item in split_list(header_value) {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        match parse_item(item) {
            Some((name, value)) => parsed.directives.push(name, value),
            None => parsed.malformed.push(item.to_owned()),
        }
    }

    parsed
}

// Splits on commas that are not inside a quoted-string.
fn split_list(input: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;

    for (i, b) in input.bytes().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_quotes => escaped = true,
            b'"' => in_quotes = !in_quotes,
            b',' if !in_quotes => {
                items.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(&input[start..]);
    items
}

fn parse_item(item: &str) -> Option<(String, Option<String>)> {
    let (name, raw_value) = match item.split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (item, None),
    };
    if !is_token(name) {
        return None;
    }
    let name = name.to_ascii_lowercase();

    let value = match raw_value {
        None => None,
        Some(v) if is_token(v) => Some(v.to_owned()),
        Some(v) => Some(unquote(v)?),
    };

    if NUMERIC_DIRECTIVES.contains(&name.as_str()) {
        // Bare `max-age` or `max-age=soon` cannot be honoured.
        value.as_deref().and_then(delta_seconds)?;
    }
    if name == "max-stale" {
        if let Some(v) = value.as_deref() {
            delta_seconds(v)?;
        }
    }

    Some((name, value))
}

fn unquote(raw: &str) -> Option<String> {
    let inner = raw.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push(chars.next()?),
            '"' => return None,
            c if c.is_control() && c != '\t' => return None,
            c => out.push(c),
        }
    }
    Some(out)
}

/// Parses `delta-seconds`, clamping to [`MAX_DELTA_SECONDS`].
pub fn delta_seconds(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(value.parse::<u64>().unwrap_or(MAX_DELTA_SECONDS).min(MAX_DELTA_SECONDS))
}

fn is_token(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(is_tchar)
}

// tchar per RFC 7230 §3.2.6.
fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~'
        )
}
