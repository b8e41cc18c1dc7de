//! The cache middleware.
//!
//! [`HttpCache`] sits in a [`Pipeline`](crate::middleware::Pipeline) in front
//! of an origin handler. Per request it either answers from storage or
//! forwards, stores what the origin allows it to, tags stored entries with
//! their surrogate keys and reports the outcome in `Cache-Status`.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rttp_cache::{HttpCache, Request, Method, Response, StatusCode};
//! use rttp_cache::config::CacheConfig;
//! use rttp_cache::context::Context;
//! use rttp_cache::middleware::Pipeline;
//! use rttp_cache::storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), rttp_cache::cache::CacheError> {
//! let cache = HttpCache::new(CacheConfig::default(), Arc::new(MemoryStorage::new()))?;
//! let pipeline = Pipeline::new(|_ctx: Context| async {
//!     Response::new(StatusCode::Ok)
//!         .header("Cache-Control", "max-age=60")
//!         .header("Surrogate-Key", "home")
//!         .body("hello")
//! })
//! .layer(Arc::new(cache.clone()));
//!
//! pipeline.call(Request::new(Method::Get, "/").header("Host", "example.com")).await;
//! let evicted = cache.purge(["home"]).await?;
//! assert_eq!(evicted.len(), 1);
//! # Ok(())
//! # }
//! ```

use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::context::Context;
use crate::http::{Method, Request, Response, StatusCode, header};
use crate::key::CacheKey;
use crate::middleware::{Middleware, Next};
use crate::rfc::directives::{self, CacheControlDirectives};
use crate::rfc::freshness::{self, Freshness, FreshnessResult, ResponseClock};
use crate::rfc::status::{self, CacheOutcome, CacheStatusContext, CacheStatusDecision};
use crate::rfc::validator::{self, Acceptability, CacheControlValidator, Unstorable};
use crate::storage::{Storage, StorageError, StoredResponse};
use crate::surrogate::{SurrogateError, SurrogateKeyStore, SurrogateProvider};

/// Failures of cache-level operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Surrogate(#[from] SurrogateError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

const ONLY_IF_CACHED: &str = "ONLY-IF-CACHED";

struct Inner {
    config: CacheConfig,
    storage: Arc<dyn Storage>,
    provider: SurrogateProvider,
    validator: CacheControlValidator,
}

/// HTTP cache engine. Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct HttpCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HttpCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCache")
            .field("config", &self.inner.config)
            .field("provider", &self.inner.provider)
            .finish_non_exhaustive()
    }
}

impl HttpCache {
    /// Builds the engine. Fails only on invalid dynamic group patterns.
    pub fn new(config: CacheConfig, storage: Arc<dyn Storage>) -> Result<Self, CacheError> {
        let store = Arc::new(SurrogateKeyStore::new(&config.surrogate)?);
        let provider = SurrogateProvider::new(config.dialect, store);
        let validator = CacheControlValidator::new(config.ignore_private, config.ignore_no_store);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                storage,
                provider,
                validator,
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn provider(&self) -> &SurrogateProvider {
        &self.inner.provider
    }

    /// Evicts every entry tagged with one of `tags` and returns their keys.
    ///
    /// The tags leave the index before storage is touched; a storage failure
    /// part-way leaves the remaining entries to expire on their own.
    pub async fn purge<I, S>(&self, tags: I) -> Result<Vec<CacheKey>, CacheError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = self.inner.provider.purge(tags);
        for key in &keys {
            self.inner.storage.delete(key).await?;
        }
        info!(evicted = keys.len(), "purged surrogate tags");
        Ok(keys)
    }

    /// Evicts the given keys, returning those that were present.
    pub async fn purge_keys(&self, keys: &[CacheKey]) -> Result<Vec<CacheKey>, CacheError> {
        let mut evicted = Vec::new();
        for key in keys {
            if self.inner.storage.get(key).await?.is_some() {
                self.inner.storage.delete(key).await?;
                evicted.push(key.clone());
            }
            self.inner.provider.store_ref().invalidate_key(key);
        }
        info!(evicted = evicted.len(), "purged cache keys");
        Ok(evicted)
    }

    async fn serve(&self, mut ctx: Context, next: Next) -> Response {
        let config = &self.inner.config;
        let key = CacheKey::from_request(ctx.request(), &config.key);
        ctx.extensions_mut().insert(key.clone());

        let method = ctx.request().method().clone();
        if method.is_purge() && config.purge.enabled {
            return self.answer_purge(ctx.request()).await;
        }
        if !method.is_cacheable() || !config.allows_method(method.as_str()) {
            debug!(%method, "method not cacheable, forwarding");
            let mut response = next.run(ctx).await;
            let decision = self
                .decision(CacheOutcome::ForwardMethod, &key)
                .detail(Unstorable::Method.detail());
            set_status(&mut response, &decision);
            return response;
        }

        let request_headers = ctx.request().headers();
        let request_directives = request_headers
            .get_combined(header::CACHE_CONTROL)
            .map(|value| directives::parse(&value).directives)
            .unwrap_or_default();
        if !self.inner.validator.can_serve_request(request_headers) {
            let detail = if request_directives.no_store() {
                "REQUEST-NO-STORE"
            } else {
                "REQUEST-NO-CACHE"
            };
            debug!(key = %key, detail, "request bypasses the cache");
            let response = next.run(ctx).await;
            return self
                .finish_forward(response, &method, &request_directives, &key, CacheOutcome::ForwardBypass, Some(detail))
                .await;
        }

        let stored = match self.inner.storage.get(&key).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(key = %key, error = %err, "storage lookup failed, forwarding");
                let mut response = next.run(ctx).await;
                let decision = self
                    .decision(CacheOutcome::ForwardUriMiss, &key)
                    .detail(err.detail());
                set_status(&mut response, &decision);
                return response;
            }
        };

        let Some(stored) = stored else {
            if request_directives.only_if_cached() {
                return self.gateway_timeout(CacheOutcome::ForwardUriMiss, &key);
            }
            debug!(key = %key, "cache miss");
            let response = next.run(ctx).await;
            return self
                .finish_forward(response, &method, &request_directives, &key, CacheOutcome::ForwardUriMiss, None)
                .await;
        };

        let now = SystemTime::now();
        let clock = match ResponseClock::from_headers(&stored.headers) {
            Ok(clock) => clock,
            Err(err) => {
                warn!(key = %key, error = %err, "stored entry has an unusable Date");
                let response = next.run(ctx).await;
                return self
                    .finish_forward(response, &method, &request_directives, &key, CacheOutcome::ForwardRequest, Some(err.detail()))
                    .await;
            }
        };
        let stored_directives = stored
            .headers
            .get_combined(header::CACHE_CONTROL)
            .map(|value| directives::parse(&value).directives)
            .unwrap_or_default();
        let freshness = freshness::evaluate(now, &clock, &stored_directives);

        match self
            .inner
            .validator
            .assess(&stored_directives, &request_directives, &freshness)
        {
            Acceptability::Fresh => self.hit(stored, &key, &freshness, now),
            Acceptability::Stale => {
                let detail = match freshness.classify() {
                    Freshness::StaleUsable => "STALE-WHILE-REVALIDATE",
                    _ => "MAX-STALE",
                };
                self.stale_hit(stored, &key, &freshness, detail)
            }
            Acceptability::Rejected(detail) => {
                if request_directives.only_if_cached() {
                    return self.gateway_timeout(CacheOutcome::ForwardStale, &key);
                }
                debug!(key = %key, detail, "stored entry rejected, forwarding");
                let response = next.run(ctx).await;
                if response.status().is_server_error() && freshness.within_stale_if_error() {
                    info!(key = %key, status = response.status().as_u16(), "origin failed, serving stale");
                    return self.stale_hit(stored, &key, &freshness, "STALE-IF-ERROR");
                }
                self.finish_forward(response, &method, &request_directives, &key, CacheOutcome::ForwardStale, Some(detail))
                    .await
            }
        }
    }

    fn hit(&self, stored: StoredResponse, key: &CacheKey, freshness: &FreshnessResult, now: SystemTime) -> Response {
        debug!(key = %key, ttl = freshness.ttl, "cache hit");
        let mut response = stored.into_response();
        response
            .headers_mut()
            .set(header::AGE, freshness.age.as_secs().to_string());
        status::set_cache_status_eventually(response.headers_mut(), &self.status_context(key), now);
        response
    }

    fn stale_hit(&self, stored: StoredResponse, key: &CacheKey, freshness: &FreshnessResult, detail: &str) -> Response {
        debug!(key = %key, ttl = freshness.ttl, detail, "serving stale entry");
        let mut response = stored.into_response();
        response
            .headers_mut()
            .set(header::AGE, freshness.age.as_secs().to_string());
        let decision = self
            .decision(CacheOutcome::HitStale, key)
            .ttl(freshness.ttl)
            .detail(detail);
        set_status(&mut response, &decision);
        response
    }

    fn gateway_timeout(&self, outcome: CacheOutcome, key: &CacheKey) -> Response {
        debug!(key = %key, "only-if-cached could not be satisfied");
        let mut response = Response::new(StatusCode::GatewayTimeout);
        set_status(&mut response, &self.decision(outcome, key).detail(ONLY_IF_CACHED));
        response
    }

    /// Stores the origin response when allowed and renders `Cache-Status`.
    /// `detail` explains the forward; without one, the reason the response
    /// was not stored is reported instead.
    async fn finish_forward(
        &self,
        mut response: Response,
        method: &Method,
        request_directives: &CacheControlDirectives,
        key: &CacheKey,
        outcome: CacheOutcome,
        detail: Option<&str>,
    ) -> Response {
        let (stored, skipped) = match self
            .store_response(method, request_directives, key, &mut response)
            .await
        {
            Ok(()) => (true, None),
            Err(reason) => {
                debug!(key = %key, reason, "response not stored");
                (false, Some(reason))
            }
        };

        let mut decision = self.decision(outcome, key).stored(stored);
        if let Some(detail) = detail.or(skipped) {
            decision = decision.detail(detail);
        }
        set_status(&mut response, &decision);
        response
    }

    async fn store_response(
        &self,
        method: &Method,
        request_directives: &CacheControlDirectives,
        key: &CacheKey,
        response: &mut Response,
    ) -> Result<(), &'static str> {
        let parsed = validator::validate_response_cache_control(response.headers())?;
        let now = SystemTime::now();
        status::stamp_date_if_missing(response.headers_mut(), now);
        let clock = ResponseClock::from_headers(response.headers()).map_err(|err| err.detail())?;
        let freshness = freshness::evaluate(now, &clock, &parsed.directives);

        let ttl = self
            .inner
            .validator
            .is_storable(
                method,
                response.status(),
                request_directives,
                &parsed.directives,
                response.headers(),
                &freshness,
            )
            .map_err(Unstorable::detail)?;

        if let Err(err) = self
            .inner
            .storage
            .set(key, StoredResponse::from(&*response), ttl)
            .await
        {
            warn!(key = %key, error = %err, "failed to store response");
            return Err(err.detail());
        }
        // Untagged entries still resolve under dynamic tags, and a replaced
        // entry drops the tags of the previous version.
        self.inner.provider.store_ref().register_key(key, ttl);
        if let Err(err) = self.inner.provider.store(response.headers(), key) {
            // The entry stays cached; only its tagging is incomplete.
            warn!(key = %key, error = %err, "failed to tag stored response");
        }
        debug!(key = %key, ttl_secs = ttl.as_secs(), "stored response");
        Ok(())
    }

    /// Answers an in-band `PURGE`: tags come from the dialect's tag header;
    /// without any, the request's own GET and HEAD entries are evicted.
    async fn answer_purge(&self, request: &Request) -> Response {
        let tags = self.inner.provider.extract_tags(request.headers());
        let result = if tags.is_empty() {
            let keys = [Method::Get, Method::Head].map(|method| {
                CacheKey::for_method(&method, request, &self.inner.config.key)
            });
            self.purge_keys(&keys).await
        } else {
            self.purge(&tags).await
        };

        match result {
            Ok(keys) => {
                let purged: Vec<&str> = keys.iter().map(CacheKey::as_str).collect();
                Response::new(StatusCode::Ok)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(serde_json::json!({ "purged": purged }).to_string())
            }
            Err(err) => {
                warn!(error = %err, "purge failed");
                Response::new(StatusCode::ServiceUnavailable).body(err.to_string())
            }
        }
    }

    fn decision(&self, outcome: CacheOutcome, key: &CacheKey) -> CacheStatusDecision {
        CacheStatusDecision::new(self.inner.config.cache_name.as_str(), outcome)
            .key(key.as_str(), self.inner.config.display_key)
    }

    fn status_context(&self, key: &CacheKey) -> CacheStatusContext {
        CacheStatusContext {
            cache_name: self.inner.config.cache_name.clone(),
            key: Some(key.to_string()),
            key_displayable: self.inner.config.display_key,
        }
    }
}

fn set_status(response: &mut Response, decision: &CacheStatusDecision) {
    response
        .headers_mut()
        .set(header::CACHE_STATUS, status::compose(decision));
}

impl Middleware for HttpCache {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let cache = self.clone();
        Box::pin(async move { cache.serve(ctx, next).await })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::config::{DynamicGroup, PurgeConfig, SurrogateConfig};
    use crate::http::Headers;
    use crate::middleware::Pipeline;
    use crate::storage::MemoryStorage;

    const KEY: &str = "GET-example.com-/a";

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn get(path: &str) -> Request {
        Request::new(Method::Get, path).header("Host", "example.com")
    }

    /// A pipeline whose origin answers with `status` and `headers`, counting calls.
    fn pipeline(
        cache: &HttpCache,
        status: StatusCode,
        headers: &[(&'static str, &'static str)],
    ) -> (Pipeline, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let headers: Headers = headers.iter().copied().collect();
        let pipeline = Pipeline::new(move |_ctx: Context| {
            let calls = Arc::clone(&counter);
            let headers = headers.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let mut response = Response::new(status).body("origin");
                for (name, value) in headers.iter() {
                    response.add_header(name, value);
                }
                response
            }
        })
        .layer(Arc::new(cache.clone()));
        (pipeline, calls)
    }

    fn cache_with(config: CacheConfig) -> (HttpCache, MemoryStorage) {
        init_tracing();
        let storage = MemoryStorage::new();
        let cache = HttpCache::new(config, Arc::new(storage.clone())).unwrap();
        (cache, storage)
    }

    fn cache() -> (HttpCache, MemoryStorage) {
        cache_with(CacheConfig::default())
    }

    fn cache_status(response: &Response) -> &str {
        response.headers().get("Cache-Status").unwrap_or_default()
    }

    async fn seed(storage: &MemoryStorage, age: u64, cache_control: &str) {
        let mut headers = Headers::new();
        headers.insert("Cache-Control", cache_control);
        headers.insert("Date", status::http_date(SystemTime::now() - Duration::from_secs(age)));
        let entry = StoredResponse {
            status: StatusCode::Ok,
            headers,
            body: Bytes::from_static(b"cached"),
        };
        storage
            .set(&KEY.into(), entry, Duration::from_secs(3600))
            .await
            .unwrap();
    }

    struct FailingStorage;

    #[async_trait]
    impl Storage for FailingStorage {
        async fn get(&self, _key: &CacheKey) -> Result<Option<StoredResponse>, StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }

        async fn set(&self, _key: &CacheKey, _value: StoredResponse, _ttl: Duration) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }

        async fn delete(&self, _key: &CacheKey) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
    }

    // ── miss / hit ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn miss_stores_then_hit_serves_from_cache() {
        let (cache, storage) = cache();
        let (pipeline, calls) = pipeline(&cache, StatusCode::Ok, &[("Cache-Control", "max-age=60")]);

        let first = pipeline.call(get("/a")).await;
        assert_eq!(cache_status(&first), "rttp; fwd=uri-miss; stored");
        assert!(first.headers().contains("Date"));
        assert_eq!(storage.len(), 1);

        let second = pipeline.call(get("/a")).await;
        assert!(cache_status(&second).starts_with("rttp; hit; ttl="), "{}", cache_status(&second));
        assert_eq!(second.body_ref().as_ref(), b"origin");
        assert!(second.headers().contains("Age"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn displayable_key_is_reported() {
        let (cache, _) = cache_with(CacheConfig {
            display_key: true,
            ..Default::default()
        });
        let (pipeline, _) = pipeline(&cache, StatusCode::Ok, &[("Cache-Control", "max-age=60")]);

        let first = pipeline.call(get("/a")).await;
        assert_eq!(cache_status(&first), format!("rttp; fwd=uri-miss; stored; key={KEY}"));
        let second = pipeline.call(get("/a")).await;
        assert!(cache_status(&second).ends_with(&format!("; key={KEY}")));
    }

    #[tokio::test]
    async fn hit_reports_age_from_stored_date() {
        let (cache, storage) = cache();
        seed(&storage, 10, "max-age=100").await;
        let (pipeline, calls) = pipeline(&cache, StatusCode::Ok, &[]);

        let response = pipeline.call(get("/a")).await;
        assert_eq!(response.body_ref().as_ref(), b"cached");
        let age: u64 = response.headers().get("Age").unwrap().parse().unwrap();
        assert!((10..=11).contains(&age));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    // ── forwards ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn uncacheable_method_is_forwarded() {
        let (cache, storage) = cache();
        let (pipeline, calls) = pipeline(&cache, StatusCode::Ok, &[("Cache-Control", "max-age=60")]);

        let response = pipeline
            .call(Request::new(Method::Post, "/a").header("Host", "example.com"))
            .await;
        assert_eq!(cache_status(&response), "rttp; fwd=method; detail=UNCACHEABLE-METHOD");
        assert!(storage.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn request_no_cache_bypasses_but_refreshes_the_entry() {
        let (cache, storage) = cache();
        seed(&storage, 0, "max-age=100").await;
        let (pipeline, calls) = pipeline(&cache, StatusCode::Ok, &[("Cache-Control", "max-age=60")]);

        let response = pipeline.call(get("/a").header("Cache-Control", "no-cache")).await;
        assert_eq!(cache_status(&response), "rttp; fwd=bypass; stored; detail=REQUEST-NO-CACHE");
        assert_eq!(response.body_ref().as_ref(), b"origin");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pragma_no_cache_bypasses() {
        let (cache, _) = cache();
        let (pipeline, _) = pipeline(&cache, StatusCode::Ok, &[]);
        let response = pipeline.call(get("/a").header("Pragma", "no-cache")).await;
        assert!(cache_status(&response).starts_with("rttp; fwd=bypass"));
    }

    #[tokio::test]
    async fn request_no_store_is_not_stored() {
        let (cache, storage) = cache();
        let (pipeline, _) = pipeline(&cache, StatusCode::Ok, &[("Cache-Control", "max-age=60")]);
        let response = pipeline.call(get("/a").header("Cache-Control", "no-store")).await;
        assert_eq!(cache_status(&response), "rttp; fwd=bypass; detail=REQUEST-NO-STORE");
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn response_no_store_is_never_cached() {
        let (cache, storage) = cache();
        let (pipeline, calls) = pipeline(&cache, StatusCode::Ok, &[("Cache-Control", "no-store")]);

        for _ in 0..2 {
            let response = pipeline.call(get("/a")).await;
            assert_eq!(cache_status(&response), "rttp; fwd=uri-miss; detail=NO-STORE-DIRECTIVE");
        }
        assert!(storage.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn malformed_response_cache_control_is_not_stored() {
        let (cache, storage) = cache();
        let (pipeline, _) = pipeline(&cache, StatusCode::Ok, &[("Cache-Control", "max-age=soon")]);
        let response = pipeline.call(get("/a")).await;
        assert_eq!(
            cache_status(&response),
            "rttp; fwd=uri-miss; detail=INVALID-RESPONSE-CACHE-CONTROL"
        );
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn only_if_cached_miss_is_a_gateway_timeout() {
        let (cache, _) = cache();
        let (pipeline, calls) = pipeline(&cache, StatusCode::Ok, &[]);
        let response = pipeline
            .call(get("/a").header("Cache-Control", "only-if-cached"))
            .await;
        assert_eq!(response.status(), StatusCode::GatewayTimeout);
        assert_eq!(cache_status(&response), "rttp; fwd=uri-miss; detail=ONLY-IF-CACHED");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn storage_failure_forwards_with_detail() {
        init_tracing();
        let cache = HttpCache::new(CacheConfig::default(), Arc::new(FailingStorage)).unwrap();
        let (pipeline, calls) = pipeline(&cache, StatusCode::Ok, &[("Cache-Control", "max-age=60")]);

        let response = pipeline.call(get("/a")).await;
        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(cache_status(&response), "rttp; fwd=uri-miss; detail=STORAGE-UNAVAILABLE");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // ── stale entries ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn expired_entry_is_refetched() {
        let (cache, storage) = cache();
        seed(&storage, 100, "max-age=10").await;
        let (pipeline, calls) = pipeline(&cache, StatusCode::Ok, &[("Cache-Control", "max-age=60")]);

        let response = pipeline.call(get("/a")).await;
        assert_eq!(cache_status(&response), "rttp; fwd=stale; stored; detail=STALE");
        assert_eq!(response.body_ref().as_ref(), b"origin");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_while_revalidate_serves_stale() {
        let (cache, storage) = cache();
        seed(&storage, 10, "max-age=1, stale-while-revalidate=60").await;
        let (pipeline, calls) = pipeline(&cache, StatusCode::Ok, &[]);

        let response = pipeline.call(get("/a")).await;
        let status = cache_status(&response);
        assert!(status.starts_with("rttp; hit; ttl=-"), "{status}");
        assert!(status.ends_with("; detail=STALE-WHILE-REVALIDATE"), "{status}");
        assert_eq!(response.body_ref().as_ref(), b"cached");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_if_error_covers_origin_failure() {
        let (cache, storage) = cache();
        seed(&storage, 10, "max-age=1, stale-if-error=60").await;
        let (pipeline, calls) = pipeline(&cache, StatusCode::ServiceUnavailable, &[]);

        let response = pipeline.call(get("/a")).await;
        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(response.body_ref().as_ref(), b"cached");
        assert!(cache_status(&response).ends_with("; detail=STALE-IF-ERROR"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn must_revalidate_forbids_stale_if_error() {
        let (cache, storage) = cache();
        seed(&storage, 10, "max-age=1, stale-if-error=60, must-revalidate").await;
        let (pipeline, _) = pipeline(&cache, StatusCode::ServiceUnavailable, &[]);

        let response = pipeline.call(get("/a")).await;
        assert_eq!(response.status(), StatusCode::ServiceUnavailable);
        assert_eq!(
            cache_status(&response),
            "rttp; fwd=stale; detail=STALE"
        );
    }

    #[tokio::test]
    async fn stored_malformed_date_is_a_forward() {
        let (cache, storage) = cache();
        let entry = StoredResponse {
            status: StatusCode::Ok,
            headers: [("Date", "Invalid"), ("Cache-Control", "max-age=60")]
                .into_iter()
                .collect(),
            body: Bytes::new(),
        };
        storage
            .set(&KEY.into(), entry, Duration::from_secs(60))
            .await
            .unwrap();
        let (pipeline, calls) = pipeline(&cache, StatusCode::Ok, &[("Cache-Control", "max-age=60")]);

        let response = pipeline.call(get("/a")).await;
        assert_eq!(cache_status(&response), "rttp; fwd=request; stored; detail=MALFORMED-DATE");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // ── surrogate keys and purge ─────────────────────────────────────────────

    #[tokio::test]
    async fn purge_by_tag_evicts_tagged_entries() {
        let (cache, storage) = cache();
        let (pipeline, calls) = pipeline(
            &cache,
            StatusCode::Ok,
            &[("Cache-Control", "max-age=60"), ("Surrogate-Key", "group-a, group-b")],
        );
        pipeline.call(get("/a")).await;
        pipeline.call(get("/b")).await;
        assert_eq!(storage.len(), 2);

        let evicted = cache.purge(["group-a"]).await.unwrap();
        assert_eq!(evicted, vec![CacheKey::from(KEY), CacheKey::from("GET-example.com-/b")]);
        assert!(storage.is_empty());

        let response = pipeline.call(get("/a")).await;
        assert_eq!(cache_status(&response), "rttp; fwd=uri-miss; stored");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dynamic_purge_reaches_untagged_variants() {
        let (cache, storage) = cache_with(CacheConfig {
            surrogate: SurrogateConfig {
                dynamic: true,
                groups: vec![DynamicGroup {
                    tag: r"^product-(\d+)$".into(),
                    keys: r"^GET-[^-]*-/products/$1(\?.*)?$".into(),
                }],
            },
            ..Default::default()
        });
        // Only the canonical URL carries the tag.
        let pipeline = Pipeline::new(|ctx: Context| {
            let tagged = ctx.request().query_string().is_none();
            async move {
                let response = Response::new(StatusCode::Ok).header("Cache-Control", "max-age=60");
                if tagged {
                    response.header("Surrogate-Key", "product-42")
                } else {
                    response
                }
            }
        })
        .layer(Arc::new(cache.clone()));
        let shop = |target: &str| Request::new(Method::Get, target).header("Host", "shop");

        pipeline.call(shop("/products/42?v=2")).await;
        pipeline.call(shop("/products/42")).await;
        assert_eq!(storage.len(), 2);

        let evicted = cache.purge(["product-42"]).await.unwrap();
        assert_eq!(
            evicted,
            vec![
                CacheKey::from("GET-shop-/products/42"),
                CacheKey::from("GET-shop-/products/42?v=2"),
            ]
        );
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn refreshed_entry_is_retagged() {
        let (cache, storage) = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let pipeline = Pipeline::new(move |_ctx: Context| {
            let tag = if counter.fetch_add(1, Ordering::SeqCst) == 0 { "old" } else { "new" };
            async move {
                Response::new(StatusCode::Ok)
                    .header("Cache-Control", "max-age=60")
                    .header("Surrogate-Key", tag)
            }
        })
        .layer(Arc::new(cache.clone()));

        pipeline.call(get("/a")).await;
        let response = pipeline.call(get("/a").header("Cache-Control", "no-cache")).await;
        assert_eq!(cache_status(&response), "rttp; fwd=bypass; stored; detail=REQUEST-NO-CACHE");

        assert!(cache.purge(["old"]).await.unwrap().is_empty());
        assert_eq!(storage.len(), 1);
        assert_eq!(cache.purge(["new"]).await.unwrap(), vec![CacheKey::from(KEY)]);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn purge_method_is_forwarded_when_disabled() {
        let (cache, _) = cache();
        let (pipeline, calls) = pipeline(&cache, StatusCode::Ok, &[]);
        let response = pipeline
            .call(Request::new(Method::Custom("PURGE".into()), "/a"))
            .await;
        assert!(cache_status(&response).starts_with("rttp; fwd=method"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn purge_method_with_tags() {
        let (cache, storage) = cache_with(CacheConfig {
            purge: PurgeConfig { enabled: true },
            ..Default::default()
        });
        let (pipeline, calls) = pipeline(
            &cache,
            StatusCode::Ok,
            &[("Cache-Control", "max-age=60"), ("Surrogate-Key", "news")],
        );
        pipeline.call(get("/a")).await;

        let response = pipeline
            .call(
                Request::new(Method::Custom("PURGE".into()), "/anything")
                    .header("Host", "example.com")
                    .header("Surrogate-Key", "news"),
            )
            .await;
        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(response.headers().get("content-type"), Some("application/json"));
        let body: serde_json::Value = serde_json::from_slice(response.body_ref()).unwrap();
        assert_eq!(body, serde_json::json!({ "purged": [KEY] }));
        assert!(storage.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn purge_method_without_tags_evicts_own_key() {
        let (cache, storage) = cache_with(CacheConfig {
            purge: PurgeConfig { enabled: true },
            ..Default::default()
        });
        let (pipeline, _) = pipeline(&cache, StatusCode::Ok, &[("Cache-Control", "max-age=60")]);
        pipeline.call(get("/a")).await;
        pipeline.call(get("/b")).await;

        let response = pipeline
            .call(Request::new(Method::Custom("PURGE".into()), "/a").header("Host", "example.com"))
            .await;
        let body: serde_json::Value = serde_json::from_slice(response.body_ref()).unwrap();
        assert_eq!(body, serde_json::json!({ "purged": [KEY] }));
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn cache_key_is_published_to_the_origin() {
        let (cache, _) = cache();
        let seen = Arc::new(std::sync::Mutex::new(None));
        let sink = Arc::clone(&seen);
        let pipeline = Pipeline::new(move |ctx: Context| {
            *sink.lock().unwrap() = ctx.extensions().get::<CacheKey>().cloned();
            async { Response::new(StatusCode::Ok) }
        })
        .layer(Arc::new(cache));

        pipeline.call(get("/a")).await;
        assert_eq!(*seen.lock().unwrap(), Some(CacheKey::from(KEY)));
    }
}
