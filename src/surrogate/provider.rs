//! Surrogate-key header dialects.
//!
//! Each dialect only knows how its CDN spells tags on the wire and which
//! tag names it accepts. Indexing and invalidation live once, in
//! [`SurrogateKeyStore`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::store::{SurrogateError, SurrogateKeyStore, TagValidator};
use crate::http::Headers;
use crate::key::CacheKey;
use crate::rfc::directives;

const AKAMAI_MAX_TAG_LEN: usize = 128;
const CLOUDFLARE_MAX_TAG_LEN: usize = 1024;
const FASTLY_MAX_TAG_LEN: usize = 1024;

/// Tagging convention of the CDN in front of (or emulated by) this cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Souin,
    Akamai,
    Cloudflare,
    Fastly,
    Generic,
}

impl Dialect {
    /// Headers tags are read from, in order.
    pub fn tag_headers(self) -> &'static [&'static str] {
        match self {
            Self::Souin => &["Surrogate-Key", "Edge-Cache-Tag", "Cache-Tags", "Cache-Tag"],
            Self::Akamai => &["Edge-Cache-Tag"],
            Self::Cloudflare => &["Cache-Tag"],
            Self::Fastly | Self::Generic => &["Surrogate-Key"],
        }
    }

    /// Headers that may carry CDN-targeted cache directives.
    pub fn control_headers(self) -> &'static [&'static str] {
        match self {
            Self::Souin => &["Souin-Cache-Control", "Surrogate-Control", "CDN-Cache-Control"],
            Self::Akamai => &["Edge-Control"],
            Self::Cloudflare => &["Cloudflare-CDN-Cache-Control", "CDN-Cache-Control"],
            Self::Fastly => &["Surrogate-Control"],
            Self::Generic => &["CDN-Cache-Control"],
        }
    }

    /// Separator used when writing a tag list.
    pub fn separator(self) -> &'static str {
        match self {
            Self::Souin => ", ",
            Self::Fastly => " ",
            Self::Akamai | Self::Cloudflare | Self::Generic => ",",
        }
    }

    fn max_tag_len(self) -> Option<usize> {
        match self {
            Self::Akamai => Some(AKAMAI_MAX_TAG_LEN),
            Self::Cloudflare => Some(CLOUDFLARE_MAX_TAG_LEN),
            Self::Fastly => Some(FASTLY_MAX_TAG_LEN),
            Self::Souin | Self::Generic => None,
        }
    }

    fn is_separator(self, c: char) -> bool {
        match self {
            Self::Fastly => c.is_whitespace(),
            _ => c == ',',
        }
    }

    /// Splits one header value into tags, dropping empty items.
    pub fn split(self, value: &str) -> Vec<String> {
        value
            .split(|c| self.is_separator(c))
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

impl TagValidator for Dialect {
    fn is_valid_tag(&self, tag: &str) -> bool {
        if tag.is_empty() || tag.chars().any(|c| c.is_control() || self.is_separator(c)) {
            return false;
        }
        if *self == Self::Akamai && tag.chars().any(char::is_whitespace) {
            return false;
        }
        self.max_tag_len().is_none_or(|max| tag.len() <= max)
    }
}

/// A dialect bound to the shared tag index.
#[derive(Debug, Clone)]
pub struct SurrogateProvider {
    dialect: Dialect,
    store: Arc<SurrogateKeyStore>,
}

impl SurrogateProvider {
    pub fn new(dialect: Dialect, store: Arc<SurrogateKeyStore>) -> Self {
        Self { dialect, store }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn store_ref(&self) -> &SurrogateKeyStore {
        &self.store
    }

    /// Tags declared by a response, deduplicated, in header order.
    pub fn extract_tags(&self, headers: &Headers) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();
        for name in self.dialect.tag_headers() {
            for value in headers.get_all(name) {
                for tag in self.dialect.split(value) {
                    if !tags.contains(&tag) {
                        tags.push(tag);
                    }
                }
            }
        }
        tags
    }

    /// Renders tags as this dialect's primary tag header.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use rttp_cache::surrogate::{Dialect, SurrogateKeyStore, SurrogateProvider};
    ///
    /// let provider = SurrogateProvider::new(Dialect::Fastly, Arc::new(SurrogateKeyStore::default()));
    /// assert_eq!(provider.format_tags(&["a", "b"]), ("Surrogate-Key", "a b".to_owned()));
    /// ```
    pub fn format_tags<S: AsRef<str>>(&self, tags: &[S]) -> (&'static str, String) {
        let value = tags
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(self.dialect.separator());
        (self.dialect.tag_headers()[0], value)
    }

    /// Indexes `key` under the response's tags.
    ///
    /// Skipped when one of the dialect's control headers says `no-store`.
    /// The headers are left untouched.
    pub fn store(&self, headers: &Headers, key: &CacheKey) -> Result<(), SurrogateError> {
        if self.forbids_store(headers) {
            debug!(key = %key, "surrogate control forbids tagging");
            return Ok(());
        }
        let tags = self.extract_tags(headers);
        if tags.is_empty() {
            return Ok(());
        }
        debug!(key = %key, tags = ?tags, "tagging cache entry");
        self.store.store(&tags, key, &self.dialect)
    }

    pub fn purge<I, S>(&self, tags: I) -> Vec<CacheKey>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.store.purge(tags)
    }

    /// Purges the tags listed in a raw header value.
    pub fn purge_header(&self, value: &str) -> Vec<CacheKey> {
        self.store.purge(self.dialect.split(value))
    }

    pub fn retrieve(&self, tag: &str) -> Option<Vec<CacheKey>> {
        self.store.retrieve(tag)
    }

    fn forbids_store(&self, headers: &Headers) -> bool {
        self.dialect.control_headers().iter().any(|name| {
            headers
                .get_combined(name)
                .is_some_and(|value| directives::parse(&value).directives.no_store())
        })
    }
}
