//! Request/response admission rules (RFC 7234 §3, §4 and §5.2).

use std::time::Duration;

use super::directives::{self, CacheControlDirectives, MaxStale, ParsedDirectives};
use super::freshness::{Freshness, FreshnessResult};
use crate::http::{Headers, Method, StatusCode, header};

/// Reason code for a response whose `Cache-Control` could not be used.
pub const INVALID_RESPONSE_CACHE_CONTROL: &str = "INVALID-RESPONSE-CACHE-CONTROL";

/// Why a stored candidate may or may not be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptability {
    Fresh,
    /// Served past expiry under `stale-while-revalidate` or `max-stale`.
    Stale,
    /// Must go to the origin; carries the `Cache-Status` detail.
    Rejected(&'static str),
}

/// Why an origin response may not be written to cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unstorable {
    Method,
    Status,
    RequestNoStore,
    NoStore,
    Private,
    VaryStar,
    NoFreshness,
}

impl Unstorable {
    pub fn detail(self) -> &'static str {
        match self {
            Self::Method => "UNCACHEABLE-METHOD",
            Self::Status => "UNCACHEABLE-STATUS-CODE",
            Self::RequestNoStore => "REQUEST-NO-STORE",
            Self::NoStore => "NO-STORE-DIRECTIVE",
            Self::Private => "PRIVATE-DIRECTIVE",
            Self::VaryStar => "VARY-STAR",
            Self::NoFreshness => "NO-FRESHNESS-INFORMATION",
        }
    }
}

/// Decides whether the cache may be consulted and whether a stored
/// candidate satisfies a request.
///
/// `private` and `no-store` on stored responses are honoured unless the
/// cache is explicitly configured to ignore them (e.g. a private,
/// per-user cache in front of a single-tenant origin).
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheControlValidator {
    pub ignore_private: bool,
    pub ignore_no_store: bool,
}

impl CacheControlValidator {
    pub fn new(ignore_private: bool, ignore_no_store: bool) -> Self {
        Self {
            ignore_private,
            ignore_no_store,
        }
    }

    /// Returns `false` when the request forbids answering from storage.
    ///
    /// An absent header is permissive.
    pub fn can_serve_from_cache(&self, request: &CacheControlDirectives) -> bool {
        !request.no_store() && !request.no_cache()
    }

    /// Like [`can_serve_from_cache`](Self::can_serve_from_cache) but reads
    /// the request headers, honouring HTTP/1.0 `Pragma: no-cache` when no
    /// `Cache-Control` is present (RFC 7234 §5.4).
    pub fn can_serve_request(&self, headers: &Headers) -> bool {
        match headers.get_combined(header::CACHE_CONTROL) {
            Some(value) => self.can_serve_from_cache(&directives::parse(&value).directives),
            None => !headers
                .get_all(header::PRAGMA)
                .any(|p| p.split(',').any(|d| d.trim().eq_ignore_ascii_case("no-cache"))),
        }
    }

    /// Returns `true` when the stored candidate satisfies the request.
    pub fn is_still_acceptable(
        &self,
        stored: &CacheControlDirectives,
        request: &CacheControlDirectives,
        freshness: &FreshnessResult,
    ) -> bool {
        !matches!(
            self.assess(stored, request, freshness),
            Acceptability::Rejected(_)
        )
    }

    /// Full decision behind [`is_still_acceptable`](Self::is_still_acceptable).
    pub fn assess(
        &self,
        stored: &CacheControlDirectives,
        request: &CacheControlDirectives,
        freshness: &FreshnessResult,
    ) -> Acceptability {
        if stored.no_store() && !self.ignore_no_store {
            return Acceptability::Rejected("STORED-NO-STORE");
        }
        if stored.private() && !self.ignore_private {
            return Acceptability::Rejected("STORED-PRIVATE");
        }
        if stored.no_cache() {
            return Acceptability::Rejected("STORED-NO-CACHE");
        }
        if request.max_age().is_some_and(|max_age| freshness.age > max_age) {
            return Acceptability::Rejected("REQUEST-MAX-AGE");
        }
        if let Some(min_fresh) = request.min_fresh() {
            if freshness.ttl < i64::try_from(min_fresh.as_secs()).unwrap_or(i64::MAX) {
                return Acceptability::Rejected("REQUEST-MIN-FRESH");
            }
        }

        match freshness.classify() {
            Freshness::Fresh => Acceptability::Fresh,
            _ if request.no_cache() || request.min_fresh().is_some() => {
                Acceptability::Rejected("STALE")
            }
            Freshness::StaleUsable => Acceptability::Stale,
            Freshness::Stale if self.within_max_stale(stored, request, freshness) => {
                Acceptability::Stale
            }
            Freshness::Stale => Acceptability::Rejected("STALE"),
        }
    }

    fn within_max_stale(
        &self,
        stored: &CacheControlDirectives,
        request: &CacheControlDirectives,
        freshness: &FreshnessResult,
    ) -> bool {
        if stored.must_revalidate() || stored.proxy_revalidate() {
            return false;
        }
        match request.max_stale() {
            Some(MaxStale::Any) => true,
            Some(MaxStale::Within(limit)) => freshness.staleness() <= limit,
            None => false,
        }
    }

    /// Checks whether an origin response may be written to cache.
    ///
    /// `freshness` is evaluated on the response as received; a response with
    /// neither a lifetime nor a stale window would never be served, so it
    /// is not worth storing.
    pub fn is_storable(
        &self,
        method: &Method,
        status: StatusCode,
        request: &CacheControlDirectives,
        response: &CacheControlDirectives,
        response_headers: &Headers,
        freshness: &FreshnessResult,
    ) -> Result<Duration, Unstorable> {
        if !method.is_cacheable() {
            return Err(Unstorable::Method);
        }
        if request.no_store() && !self.ignore_no_store {
            return Err(Unstorable::RequestNoStore);
        }
        if response.no_store() && !self.ignore_no_store {
            return Err(Unstorable::NoStore);
        }
        if response.private() && !self.ignore_private {
            return Err(Unstorable::Private);
        }
        if !status.is_heuristically_cacheable() {
            return Err(Unstorable::Status);
        }
        if response_headers
            .get_all(header::VARY)
            .any(|v| v.split(',').any(|f| f.trim() == "*"))
        {
            return Err(Unstorable::VaryStar);
        }

        let extra = if response.must_revalidate() || response.proxy_revalidate() {
            Duration::ZERO
        } else {
            response
                .stale_while_revalidate()
                .max(response.stale_if_error())
                .unwrap_or(Duration::ZERO)
        };
        let remaining = Duration::from_secs(freshness.ttl.max(0).unsigned_abs());
        let retention = remaining + extra;
        if retention.is_zero() {
            return Err(Unstorable::NoFreshness);
        }
        Ok(retention)
    }
}

/// Validates a response's `Cache-Control` header.
///
/// An absent or empty header is valid. A header whose every item is
/// malformed is rejected: nothing in it can be trusted to describe the
/// response's cacheability.
pub fn validate_response_cache_control(headers: &Headers) -> Result<ParsedDirectives, &'static str> {
    let parsed = headers
        .get_combined(header::CACHE_CONTROL)
        .map(|value| directives::parse(&value))
        .unwrap_or_default();
    if parsed.is_wholly_malformed() {
        Err(INVALID_RESPONSE_CACHE_CONTROL)
    } else {
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::rfc::directives::parse;
    use crate::rfc::freshness::{ResponseClock, evaluate};

    fn freshness_at(elapsed: u64, cache_control: &str) -> FreshnessResult {
        let date = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let clock = ResponseClock {
            date,
            age: None,
            expires: None,
        };
        evaluate(
            date + Duration::from_secs(elapsed),
            &clock,
            &parse(cache_control).directives,
        )
    }

    fn cc(value: &str) -> CacheControlDirectives {
        parse(value).directives
    }

    // ── can_serve_from_cache ─────────────────────────────────────────────────

    #[test]
    fn absent_request_directives_are_permissive() {
        let v = CacheControlValidator::default();
        assert!(v.can_serve_from_cache(&CacheControlDirectives::default()));
        assert!(v.can_serve_request(&Headers::new()));
    }

    #[test]
    fn no_store_and_no_cache_requests_bypass() {
        let v = CacheControlValidator::default();
        assert!(!v.can_serve_from_cache(&cc("no-store")));
        assert!(!v.can_serve_from_cache(&cc("max-age=10, no-cache")));
        assert!(v.can_serve_from_cache(&cc("max-age=10")));
    }

    #[test]
    fn pragma_no_cache_only_without_cache_control() {
        let v = CacheControlValidator::default();
        let pragma: Headers = [("Pragma", "no-cache")].into_iter().collect();
        assert!(!v.can_serve_request(&pragma));

        let both: Headers = [("Pragma", "no-cache"), ("Cache-Control", "max-age=5")]
            .into_iter()
            .collect();
        assert!(v.can_serve_request(&both));
    }

    // ── is_still_acceptable ──────────────────────────────────────────────────

    #[test]
    fn fresh_entry_is_acceptable() {
        let v = CacheControlValidator::default();
        let stored = cc("max-age=60");
        assert!(v.is_still_acceptable(&stored, &cc(""), &freshness_at(10, "max-age=60")));
    }

    #[test]
    fn private_and_no_store_entries_rejected_unless_ignored() {
        let f = freshness_at(0, "max-age=60");
        let strict = CacheControlValidator::default();
        assert!(!strict.is_still_acceptable(&cc("private, max-age=60"), &cc(""), &f));
        assert!(!strict.is_still_acceptable(&cc("no-store, max-age=60"), &cc(""), &f));

        let lenient = CacheControlValidator::new(true, true);
        assert!(lenient.is_still_acceptable(&cc("private, max-age=60"), &cc(""), &f));
        assert!(lenient.is_still_acceptable(&cc("no-store, max-age=60"), &cc(""), &f));
    }

    #[test]
    fn request_max_age_tighter_than_entry_age() {
        let v = CacheControlValidator::default();
        let f = freshness_at(30, "max-age=60");
        assert_eq!(
            v.assess(&cc("max-age=60"), &cc("max-age=10"), &f),
            Acceptability::Rejected("REQUEST-MAX-AGE")
        );
        assert!(v.is_still_acceptable(&cc("max-age=60"), &cc("max-age=45"), &f));
    }

    #[test]
    fn min_fresh_exceeding_ttl() {
        let v = CacheControlValidator::default();
        let f = freshness_at(50, "max-age=60");
        assert!(!v.is_still_acceptable(&cc("max-age=60"), &cc("min-fresh=20"), &f));
        assert!(v.is_still_acceptable(&cc("max-age=60"), &cc("min-fresh=5"), &f));
    }

    #[test]
    fn stale_within_swr_window_is_served() {
        let v = CacheControlValidator::default();
        let stored = "max-age=10, stale-while-revalidate=30";
        let f = freshness_at(20, stored);
        assert_eq!(v.assess(&cc(stored), &cc(""), &f), Acceptability::Stale);
        // The request may still refuse stale content.
        assert!(!v.is_still_acceptable(&cc(stored), &cc("no-cache"), &f));
    }

    #[test]
    fn stale_beyond_window_is_rejected() {
        let v = CacheControlValidator::default();
        let stored = "max-age=10, stale-while-revalidate=5";
        let f = freshness_at(30, stored);
        assert_eq!(v.assess(&cc(stored), &cc(""), &f), Acceptability::Rejected("STALE"));
    }

    #[test]
    fn max_stale_admits_stale_entries() {
        let v = CacheControlValidator::default();
        let f = freshness_at(30, "max-age=10");
        assert!(v.is_still_acceptable(&cc("max-age=10"), &cc("max-stale"), &f));
        assert!(v.is_still_acceptable(&cc("max-age=10"), &cc("max-stale=20"), &f));
        assert!(!v.is_still_acceptable(&cc("max-age=10"), &cc("max-stale=5"), &f));

        let strict = freshness_at(30, "max-age=10, must-revalidate");
        assert!(!v.is_still_acceptable(&cc("max-age=10, must-revalidate"), &cc("max-stale"), &strict));
    }

    // ── storability ──────────────────────────────────────────────────────────

    fn storable(status: StatusCode, response_cc: &str, headers: &Headers) -> Result<Duration, Unstorable> {
        CacheControlValidator::default().is_storable(
            &Method::Get,
            status,
            &cc(""),
            &cc(response_cc),
            headers,
            &freshness_at(0, response_cc),
        )
    }

    #[test]
    fn storable_response_retention_covers_stale_window() {
        let retention = storable(StatusCode::Ok, "max-age=60, stale-while-revalidate=30", &Headers::new());
        assert_eq!(retention, Ok(Duration::from_secs(90)));
    }

    #[test]
    fn unstorable_responses() {
        let h = Headers::new();
        assert_eq!(storable(StatusCode::Ok, "no-store", &h), Err(Unstorable::NoStore));
        assert_eq!(storable(StatusCode::Ok, "private, max-age=5", &h), Err(Unstorable::Private));
        assert_eq!(storable(StatusCode::Ok, "", &h), Err(Unstorable::NoFreshness));
        assert_eq!(
            storable(StatusCode::InternalServerError, "max-age=5", &h),
            Err(Unstorable::Status)
        );
        let vary: Headers = [("Vary", "Accept, *")].into_iter().collect();
        assert_eq!(storable(StatusCode::Ok, "max-age=5", &vary), Err(Unstorable::VaryStar));

        let post = CacheControlValidator::default().is_storable(
            &Method::Post,
            StatusCode::Ok,
            &cc(""),
            &cc("max-age=5"),
            &h,
            &freshness_at(0, "max-age=5"),
        );
        assert_eq!(post, Err(Unstorable::Method));
    }

    // ── response header validation ──────────────────────────────────────────

    #[test]
    fn empty_response_cache_control_is_valid() {
        assert!(validate_response_cache_control(&Headers::new()).is_ok());
    }

    #[test]
    fn wholly_malformed_response_cache_control_is_invalid() {
        let h: Headers = [("Cache-Control", "stale-if-error;malformed")].into_iter().collect();
        assert_eq!(
            validate_response_cache_control(&h),
            Err(INVALID_RESPONSE_CACHE_CONTROL)
        );

        let partly: Headers = [("Cache-Control", "stale-if-error;malformed, max-age=5")]
            .into_iter()
            .collect();
        let parsed = validate_response_cache_control(&partly).unwrap();
        assert_eq!(parsed.directives.max_age(), Some(Duration::from_secs(5)));
    }
}
