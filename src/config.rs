//! Cache configuration.
//!
//! Deserialized from whatever format the host application loads; every
//! field has a default so a partial document is enough.

use serde::{Deserialize, Serialize};

use crate::surrogate::Dialect;

const DEFAULT_CACHE_NAME: &str = "rttp";

/// Top-level cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name reported in `Cache-Status`.
    pub cache_name: String,
    /// Surrogate-key dialect, chosen once.
    pub dialect: Dialect,
    /// Render the cache key in `Cache-Status`.
    pub display_key: bool,
    /// Serve and store responses marked `private`.
    pub ignore_private: bool,
    /// Serve and store responses marked `no-store`.
    pub ignore_no_store: bool,
    /// Methods answered from cache. Only GET and HEAD are ever cacheable;
    /// this narrows that set.
    pub allowed_methods: Vec<String>,
    pub key: KeyConfig,
    pub surrogate: SurrogateConfig,
    pub purge: PurgeConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_owned(),
            dialect: Dialect::default(),
            display_key: false,
            ignore_private: false,
            ignore_no_store: false,
            allowed_methods: vec!["GET".to_owned(), "HEAD".to_owned()],
            key: KeyConfig::default(),
            surrogate: SurrogateConfig::default(),
            purge: PurgeConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Returns `true` when `method` is in [`allowed_methods`](Self::allowed_methods).
    pub fn allows_method(&self, method: &str) -> bool {
        self.allowed_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
    }
}

/// Cache key derivation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Request headers whose values are appended to the key.
    pub headers: Vec<String>,
    /// Leave the host out of the key.
    pub disable_host: bool,
    /// Leave the query string out of the key.
    pub disable_query: bool,
}

/// Surrogate-key index behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurrogateConfig {
    /// Resolve tags matching a [`DynamicGroup`] by pattern instead of
    /// membership.
    pub dynamic: bool,
    pub groups: Vec<DynamicGroup>,
}

/// A tag family resolved lazily against the known keys.
///
/// `tag` is a regex over tag names. `keys` is a regex template over cache
/// keys; `$1` or `${name}` are replaced with the (escaped) captures of the
/// tag. `product-(\d+)` with `^GET-[^-]*-/products/$1$` turns the tag
/// `product-42` into a pattern matching that product's page on any host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicGroup {
    pub tag: String,
    pub keys: String,
}

/// In-band `PURGE` handling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgeConfig {
    pub enabled: bool,
}
