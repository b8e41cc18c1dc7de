//! `Cache-Status` composition (RFC 8586 / RFC 9211) and `Date` stamping.

use std::fmt;
use std::time::SystemTime;

use super::directives;
use super::freshness::{self, LifetimeSource, ResponseClock};
use crate::http::{Headers, header};

/// Cache-Status outcome of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Forwarded because of the request itself (directives, malformed data).
    ForwardRequest,
    /// Forwarded because the cache is configured or told to stay out of the way.
    ForwardBypass,
    /// Forwarded because the method is not cacheable.
    ForwardMethod,
    /// Forwarded because nothing was stored under the key.
    ForwardUriMiss,
    /// Forwarded because the stored entry could not be used.
    ForwardStale,
    Hit,
    /// Served from cache past expiry.
    HitStale,
}

impl CacheOutcome {
    /// The RFC 9211 `fwd` parameter value, for forwarded outcomes.
    pub fn fwd(self) -> Option<&'static str> {
        match self {
            Self::ForwardRequest => Some("request"),
            Self::ForwardBypass => Some("bypass"),
            Self::ForwardMethod => Some("method"),
            Self::ForwardUriMiss => Some("uri-miss"),
            Self::ForwardStale => Some("stale"),
            Self::Hit | Self::HitStale => None,
        }
    }

    pub fn is_hit(self) -> bool {
        matches!(self, Self::Hit | Self::HitStale)
    }
}

/// Everything rendered into one `Cache-Status` value. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatusDecision {
    pub cache_name: String,
    pub outcome: CacheOutcome,
    pub detail: Option<String>,
    pub ttl: i64,
    pub key: Option<String>,
    pub key_displayable: bool,
    /// The forwarded response was written to cache.
    pub stored: bool,
}

impl CacheStatusDecision {
    pub fn new(cache_name: impl Into<String>, outcome: CacheOutcome) -> Self {
        Self {
            cache_name: cache_name.into(),
            outcome,
            detail: None,
            ttl: 0,
            key: None,
            key_displayable: false,
            stored: false,
        }
    }

    #[must_use]
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    #[must_use]
    pub fn ttl(mut self, ttl: i64) -> Self {
        self.ttl = ttl;
        self
    }

    /// Attaches the cache key; it is rendered only when `displayable`.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>, displayable: bool) -> Self {
        self.key = Some(key.into());
        self.key_displayable = displayable;
        self
    }

    #[must_use]
    pub fn stored(mut self, stored: bool) -> Self {
        self.stored = stored;
        self
    }

    fn displayed_key(&self) -> Option<&str> {
        self.key.as_deref().filter(|_| self.key_displayable)
    }
}

impl fmt::Display for CacheStatusDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_name)?;
        match self.outcome.fwd() {
            Some(fwd) => {
                write!(f, "; fwd={fwd}")?;
                if self.stored {
                    f.write_str("; stored")?;
                }
                if let Some(key) = self.displayed_key() {
                    write!(f, "; key={key}")?;
                }
            }
            None => {
                write!(f, "; hit; ttl={}", self.ttl)?;
                if let Some(key) = self.displayed_key() {
                    write!(f, "; key={key}")?;
                }
            }
        }
        // Copied verbatim; callers keep it free of header-breaking bytes.
        if let Some(detail) = &self.detail {
            write!(f, "; detail={detail}")?;
        }
        Ok(())
    }
}

/// Renders a decision into a `Cache-Status` value.
///
/// # Examples
///
/// ```
/// use rttp_cache::rfc::status::{compose, CacheOutcome, CacheStatusDecision};
///
/// let hit = CacheStatusDecision::new("This", CacheOutcome::Hit)
///     .ttl(-1)
///     .key("My-key", true);
/// assert_eq!(compose(&hit), "This; hit; ttl=-1; key=My-key");
///
/// let miss = CacheStatusDecision::new("rttp", CacheOutcome::ForwardUriMiss)
///     .stored(true)
///     .key("GET-example.com-/", false);
/// assert_eq!(compose(&miss), "rttp; fwd=uri-miss; stored");
/// ```
pub fn compose(decision: &CacheStatusDecision) -> String {
    decision.to_string()
}

/// Sets `<cache_name>; fwd=request; detail=<detail>`.
pub fn set_request_cache_status(headers: &mut Headers, detail: &str, cache_name: &str) {
    let decision = CacheStatusDecision::new(cache_name, CacheOutcome::ForwardRequest).detail(detail);
    headers.set(header::CACHE_STATUS, compose(&decision));
}

/// Formats `now` as an IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn http_date(now: SystemTime) -> String {
    httpdate::fmt_http_date(now)
}

/// Stamps a `Date` header when the response lacks one. Returns `true` if
/// it did.
pub fn stamp_date_if_missing(headers: &mut Headers, now: SystemTime) -> bool {
    if headers.contains(header::DATE) {
        return false;
    }
    headers.set(header::DATE, http_date(now));
    true
}

/// Identity of the serving cache for [`set_cache_status_eventually`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatusContext {
    pub cache_name: String,
    pub key: Option<String>,
    pub key_displayable: bool,
}

/// Finalizes `Cache-Status` on a response served from cache.
///
/// - A malformed `Date` turns the answer into
///   `<name>; fwd=request; detail=MALFORMED-DATE`.
/// - A missing `Date` is stamped with `now`.
/// - Otherwise the response is reported as a hit whose `ttl` is derived
///   from its own headers; `-1` when they carry no explicit lifetime.
pub fn set_cache_status_eventually(headers: &mut Headers, ctx: &CacheStatusContext, now: SystemTime) {
    stamp_date_if_missing(headers, now);

    let clock = match ResponseClock::from_headers(headers) {
        Ok(clock) => clock,
        Err(err) => {
            set_request_cache_status(headers, err.detail(), &ctx.cache_name);
            return;
        }
    };

    let parsed = headers
        .get_combined(header::CACHE_CONTROL)
        .map(|value| directives::parse(&value))
        .unwrap_or_default();
    let result = freshness::evaluate(now, &clock, &parsed.directives);
    let ttl = match result.lifetime_source {
        LifetimeSource::None => -1,
        _ => result.ttl,
    };

    let mut decision = CacheStatusDecision::new(ctx.cache_name.as_str(), CacheOutcome::Hit).ttl(ttl);
    if let Some(key) = &ctx.key {
        decision = decision.key(key.as_str(), ctx.key_displayable);
    }
    headers.set(header::CACHE_STATUS, compose(&decision));
}
