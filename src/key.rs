//! Cache key derivation.

use std::borrow::Borrow;
use std::fmt;

use crate::config::KeyConfig;
use crate::http::{Method, Request};

/// Identifies one stored response. Joins storage and the surrogate index.
///
/// # Examples
///
/// ```
/// use rttp_cache::{CacheKey, Method, Request};
/// use rttp_cache::config::KeyConfig;
///
/// let request = Request::new(Method::Get, "/products?page=2").header("Host", "shop.test");
/// let key = CacheKey::from_request(&request, &KeyConfig::default());
/// assert_eq!(key.as_str(), "GET-shop.test-/products?page=2");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derives `<METHOD>-<host>-<path>[?<query>]`, then `-<value>` for each
    /// configured header present on the request.
    pub fn from_request(request: &Request, config: &KeyConfig) -> Self {
        Self::for_method(request.method(), request, config)
    }

    /// Derives the key `request` would have under another method, e.g. the
    /// `GET` entry targeted by a `PURGE`.
    pub fn for_method(method: &Method, request: &Request, config: &KeyConfig) -> Self {
        let mut key = String::from(method.as_str());
        key.push('-');
        if !config.disable_host {
            key.push_str(request.host().unwrap_or_default());
            key.push('-');
        }
        key.push_str(request.path());
        if !config.disable_query {
            if let Some(query) = request.query_string().filter(|q| !q.is_empty()) {
                key.push('?');
                key.push_str(query);
            }
        }
        for name in &config.headers {
            if let Some(value) = request.headers().get(name) {
                key.push('-');
                key.push_str(value);
            }
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.to_owned())
    }
}
