//! The tag → cache-key index.
//!
//! Static tags hold an explicit member set. Dynamic tags (enabled by
//! configuration and matching a [`DynamicGroup`](crate::config::DynamicGroup))
//! hold a compiled pattern and are resolved against the known keys when
//! read, so keys stored after the tag still match.
//!
//! Every cached key is registered with its storage lifetime. Expired keys
//! never resolve and are pruned from the index on purge and periodically
//! on registration.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use regex::{Captures, Regex};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SurrogateConfig;
use crate::key::CacheKey;

/// Surrogate index failures.
#[derive(Debug, Error)]
pub enum SurrogateError {
    /// Some tags failed dialect validation. The other tags of the same call
    /// were stored.
    #[error("invalid surrogate tag names: {}", .0.join(", "))]
    InvalidTagNames(Vec<String>),

    #[error("invalid dynamic group pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Dialect-specific tag name rules.
pub trait TagValidator {
    fn is_valid_tag(&self, tag: &str) -> bool;
}

impl<F> TagValidator for F
where
    F: Fn(&str) -> bool,
{
    fn is_valid_tag(&self, tag: &str) -> bool {
        self(tag)
    }
}

enum TagEntry {
    Static(Arc<DashSet<String>>),
    Dynamic(Arc<Regex>),
}

// Registrations between two full expiry sweeps.
const PRUNE_EVERY: usize = 1024;

struct CompiledGroup {
    tag: Regex,
    keys: String,
}

pub struct SurrogateKeyStore {
    entries: DashMap<String, TagEntry>,
    // Expanded key pattern source → compiled regex.
    patterns: DashMap<String, Arc<Regex>>,
    // Cached key → expiry; `None` when the lifetime is unknown.
    known_keys: DashMap<String, Option<Instant>>,
    registrations: AtomicUsize,
    structural: Mutex<()>,
    dynamic: bool,
    groups: Vec<CompiledGroup>,
}

impl std::fmt::Debug for SurrogateKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurrogateKeyStore")
            .field("tags", &self.entries.len())
            .field("known_keys", &self.known_keys.len())
            .field("dynamic", &self.dynamic)
            .finish()
    }
}

impl Default for SurrogateKeyStore {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            patterns: DashMap::new(),
            known_keys: DashMap::new(),
            registrations: AtomicUsize::new(0),
            structural: Mutex::new(()),
            dynamic: false,
            groups: Vec::new(),
        }
    }
}

impl SurrogateKeyStore {
    /// Builds a store, compiling the tag patterns of every dynamic group.
    pub fn new(config: &SurrogateConfig) -> Result<Self, SurrogateError> {
        let groups = config
            .groups
            .iter()
            .map(|group| {
                Ok(CompiledGroup {
                    tag: Regex::new(&group.tag)?,
                    keys: group.keys.clone(),
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;

        Ok(Self {
            dynamic: config.dynamic,
            groups,
            ..Self::default()
        })
    }

    /// Registers `key` under every tag.
    ///
    /// Idempotent per (tag, key). Invalid tags are reported together after
    /// the valid ones were stored.
    pub fn store<I, S>(
        &self,
        tags: I,
        key: &CacheKey,
        validator: &dyn TagValidator,
    ) -> Result<(), SurrogateError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.known_keys.entry(key.as_str().to_owned()).or_insert(None);

        let mut rejected = Vec::new();
        for tag in tags {
            let tag = tag.as_ref();
            if !validator.is_valid_tag(tag) {
                rejected.push(tag.to_owned());
                continue;
            }
            self.store_one(tag, key)?;
        }

        if rejected.is_empty() {
            Ok(())
        } else {
            warn!(key = %key, tags = ?rejected, "rejected invalid surrogate tags");
            Err(SurrogateError::InvalidTagNames(rejected))
        }
    }

    fn store_one(&self, tag: &str, key: &CacheKey) -> Result<(), SurrogateError> {
        // Fast path: membership on an existing tag needs no structural lock.
        if let Some(entry) = self.entries.get(tag) {
            if let TagEntry::Static(members) = &*entry {
                members.insert(key.as_str().to_owned());
            }
            return Ok(());
        }

        let _guard = self.lock();
        if let Some(entry) = self.entries.get(tag) {
            if let TagEntry::Static(members) = &*entry {
                members.insert(key.as_str().to_owned());
            }
            return Ok(());
        }

        let entry = match self.dynamic_pattern(tag)? {
            Some(pattern) => {
                debug!(tag, pattern = pattern.as_str(), "registered dynamic surrogate tag");
                TagEntry::Dynamic(pattern)
            }
            None => {
                let members = DashSet::new();
                members.insert(key.as_str().to_owned());
                TagEntry::Static(Arc::new(members))
            }
        };
        self.entries.insert(tag.to_owned(), entry);
        Ok(())
    }

    /// Records `key` as cached for `ttl` and drops the tag memberships of
    /// any earlier version of it. Call after every storage write, before
    /// tagging the new entry, so untagged entries stay visible to dynamic
    /// tags and re-tagged entries leave their old tags.
    pub fn register_key(&self, key: &CacheKey, ttl: Duration) {
        let expires_at = Instant::now().checked_add(ttl);
        {
            let _guard = self.lock();
            self.forget_memberships(key.as_str());
            self.known_keys.insert(key.as_str().to_owned(), expires_at);
        }
        if self.registrations.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune_expired();
        }
    }

    /// Removes each tag and returns the union of the live keys it resolved to.
    ///
    /// The structural lock is taken per tag so a large batch does not stall
    /// concurrent stores. Unknown tags contribute nothing.
    pub fn purge<I, S>(&self, tags: I) -> Vec<CacheKey>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let now = Instant::now();
        let mut purged = BTreeSet::new();
        for tag in tags {
            let _guard = self.lock();
            if let Some((_, entry)) = self.entries.remove(tag.as_ref()) {
                let keys = self.resolve(&entry, now);
                for key in &keys {
                    self.known_keys.remove(key.as_str());
                    self.forget_memberships(key.as_str());
                }
                purged.extend(keys);
            }
        }

        self.prune_expired();
        debug!(purged = purged.len(), "purged surrogate tags");
        purged.into_iter().collect()
    }

    /// Live keys currently associated with `tag`, or `None` for an unknown tag.
    pub fn retrieve(&self, tag: &str) -> Option<Vec<CacheKey>> {
        let entry = self.entries.get(tag)?;
        Some(self.resolve(&entry, Instant::now()).into_iter().collect())
    }

    /// Drops expired keys from the index. Returns how many were dropped.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let _guard = self.lock();
        let expired: Vec<String> = self
            .known_keys
            .iter()
            .filter(|entry| !is_live(*entry.value(), now))
            .map(|entry| entry.key().clone())
            .collect();
        for key in &expired {
            self.known_keys.remove(key);
            self.forget_memberships(key);
        }
        if !expired.is_empty() {
            debug!(expired = expired.len(), "pruned expired keys from the surrogate index");
        }
        expired.len()
    }

    /// Every registered tag, sorted.
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        tags.sort();
        tags
    }

    /// Forgets one key everywhere, e.g. after it was evicted from storage.
    pub fn invalidate_key(&self, key: &CacheKey) {
        let _guard = self.lock();
        self.known_keys.remove(key.as_str());
        self.forget_memberships(key.as_str());
    }

    /// Number of keys the index currently tracks, expired ones included
    /// until pruned.
    pub fn key_count(&self) -> usize {
        self.known_keys.len()
    }

    /// Number of registered tags.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn resolve(&self, entry: &TagEntry, now: Instant) -> BTreeSet<CacheKey> {
        match entry {
            TagEntry::Static(members) => members
                .iter()
                .filter(|k| {
                    self.known_keys
                        .get(k.as_str())
                        .is_some_and(|e| is_live(*e.value(), now))
                })
                .map(|k| CacheKey::new(k.as_str()))
                .collect(),
            TagEntry::Dynamic(pattern) => self
                .known_keys
                .iter()
                .filter(|e| is_live(*e.value(), now) && pattern.is_match(e.key()))
                .map(|e| CacheKey::new(e.key().as_str()))
                .collect(),
        }
    }

    // Callers hold the structural lock.
    fn forget_memberships(&self, key: &str) {
        for entry in self.entries.iter() {
            if let TagEntry::Static(members) = entry.value() {
                members.remove(key);
            }
        }
    }

    fn dynamic_pattern(&self, tag: &str) -> Result<Option<Arc<Regex>>, SurrogateError> {
        if !self.dynamic {
            return Ok(None);
        }
        let Some((group, captures)) = self
            .groups
            .iter()
            .find_map(|g| g.tag.captures(tag).map(|c| (g, c)))
        else {
            return Ok(None);
        };

        let source = expand(&group.keys, &captures);
        if let Some(cached) = self.patterns.get(&source) {
            return Ok(Some(Arc::clone(cached.value())));
        }
        let compiled = Arc::new(Regex::new(&source)?);
        self.patterns.insert(source, Arc::clone(&compiled));
        Ok(Some(compiled))
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded value is `()`; a poisoned lock holds nothing to repair.
        self.structural.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_live(expires_at: Option<Instant>, now: Instant) -> bool {
    expires_at.is_none_or(|at| at > now)
}

/// Substitutes `$N` and `${name}` in `template` with escaped captures.
fn expand(template: &str, captures: &Captures<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let digits = after.bytes().take_while(u8::is_ascii_digit).count();
            (&after[..digits], digits)
        };

        if consumed == 0 {
            out.push('$');
            rest = after;
            continue;
        }

        let value = match name.parse::<usize>() {
            Ok(index) => captures.get(index),
            Err(_) => captures.name(name),
        };
        if let Some(m) = value {
            out.push_str(&regex::escape(m.as_str()));
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}
