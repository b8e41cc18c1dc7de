//! Response storage contract and the in-memory reference backend.
//!
//! The cache engine only ever talks to [`Storage`]; durable backends live
//! outside this crate and implement the same three operations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;

use crate::http::{Headers, Response, StatusCode};
use crate::key::CacheKey;

/// A storage backend could not serve the operation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Reason code surfaced in `Cache-Status` `detail`.
    pub fn detail(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "STORAGE-UNAVAILABLE",
        }
    }
}

/// A response as kept in storage, headers included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Bytes,
}

impl StoredResponse {
    pub fn into_response(self) -> Response {
        Response::from_parts(self.status, self.headers, self.body)
    }
}

impl From<&Response> for StoredResponse {
    fn from(response: &Response) -> Self {
        Self {
            status: response.status(),
            headers: response.headers().clone(),
            body: response.body_ref().clone(),
        }
    }
}

/// Key/value contract the engine needs from a backend.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<StoredResponse>, StorageError>;

    /// Stores `value`, retained for at most `ttl`.
    async fn set(&self, key: &CacheKey, value: StoredResponse, ttl: Duration) -> Result<(), StorageError>;

    async fn delete(&self, key: &CacheKey) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: StoredResponse,
    expires_at: Instant,
}

/// Process-local storage; entries expire lazily on read.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<DashMap<CacheKey, MemoryEntry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, expired ones included until next touched.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &CacheKey) -> Result<Option<StoredResponse>, StorageError> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        Ok(None)
    }

    async fn set(&self, key: &CacheKey, value: StoredResponse, ttl: Duration) -> Result<(), StorageError> {
        let expires_at = Instant::now() + ttl;
        self.entries.insert(key.clone(), MemoryEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }
}
