//! Age and freshness-lifetime arithmetic (RFC 7234 §4.2).

use std::time::{Duration, SystemTime};

use thiserror::Error;

use super::directives::CacheControlDirectives;
use crate::http::{Headers, header};

/// Failure to read the response clock from its headers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FreshnessError {
    #[error("the Date header {0:?} is not a valid HTTP date")]
    MalformedDate(String),

    #[error("the response carries no Date header")]
    MissingDate,
}

impl FreshnessError {
    /// Reason code surfaced in `Cache-Status` `detail`.
    pub fn detail(&self) -> &'static str {
        match self {
            Self::MalformedDate(_) => "MALFORMED-DATE",
            Self::MissingDate => "MISSING-DATE",
        }
    }
}

/// The `Expires` header, as far as freshness is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expires {
    At(SystemTime),
    /// Present but unparseable, e.g. `0`. Means "already expired".
    Invalid,
}

/// The time-related response headers, parsed once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseClock {
    pub date: SystemTime,
    pub age: Option<Duration>,
    pub expires: Option<Expires>,
}

impl ResponseClock {
    /// Reads `Date`, `Age` and `Expires` from response headers.
    ///
    /// An unparseable `Age` is ignored (RFC 7234 §5.1 lets caches treat it
    /// as absent); an unparseable `Date` is an error the caller must turn
    /// into a miss.
    pub fn from_headers(headers: &Headers) -> Result<Self, FreshnessError> {
        let raw_date = headers.get(header::DATE).ok_or(FreshnessError::MissingDate)?;
        let date = httpdate::parse_http_date(raw_date.trim())
            .map_err(|_| FreshnessError::MalformedDate(raw_date.to_owned()))?;

        let age = headers
            .get(header::AGE)
            .and_then(|v| super::directives::delta_seconds(v.trim()))
            .map(Duration::from_secs);

        let expires = headers.get(header::EXPIRES).map(|v| {
            httpdate::parse_http_date(v.trim())
                .map(Expires::At)
                .unwrap_or(Expires::Invalid)
        });

        Ok(Self { date, age, expires })
    }
}

/// Where the freshness lifetime came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifetimeSource {
    SMaxAge,
    MaxAge,
    Expires,
    /// No usable lifetime (absent, or an invalid `Expires`); stale on arrival.
    None,
}

/// Output of [`evaluate`]. Derived per lookup, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessResult {
    pub age: Duration,
    pub freshness_lifetime: Duration,
    /// Remaining lifetime in seconds; negative once stale.
    pub ttl: i64,
    /// `stale-while-revalidate` window, only when already stale.
    pub usable_stale_window: Option<Duration>,
    /// `stale-if-error` window, only when already stale.
    pub stale_if_error_window: Option<Duration>,
    pub lifetime_source: LifetimeSource,
}

/// Freshness classification of a stored response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    StaleUsable,
    Stale,
}

impl FreshnessResult {
    pub fn is_fresh(&self) -> bool {
        self.ttl >= 0 && self.lifetime_source != LifetimeSource::None
    }

    /// Seconds past expiry; zero while fresh.
    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.ttl.min(0).unsigned_abs())
    }

    pub fn classify(&self) -> Freshness {
        if self.is_fresh() {
            Freshness::Fresh
        } else if self
            .usable_stale_window
            .is_some_and(|window| self.staleness() <= window)
        {
            Freshness::StaleUsable
        } else {
            Freshness::Stale
        }
    }

    /// Returns `true` when the stale-if-error window still covers the entry.
    pub fn within_stale_if_error(&self) -> bool {
        self.stale_if_error_window
            .is_some_and(|window| self.staleness() <= window)
    }
}

/// Computes age, lifetime and remaining TTL of a response at `now`.
///
/// # Examples
///
/// ```
/// use std::time::{Duration, SystemTime};
/// use rttp_cache::rfc::{directives, freshness::{evaluate, ResponseClock}};
///
/// let now = SystemTime::now();
/// let clock = ResponseClock { date: now, age: None, expires: None };
/// let result = evaluate(now, &clock, &directives::parse("max-age=30").directives);
/// assert_eq!(result.ttl, 30);
/// ```
pub fn evaluate(
    now: SystemTime,
    clock: &ResponseClock,
    directives: &CacheControlDirectives,
) -> FreshnessResult {
    let clock_age = now.duration_since(clock.date).unwrap_or(Duration::ZERO);
    let age = clock.age.map_or(clock_age, |header_age| header_age.max(clock_age));

    let (freshness_lifetime, lifetime_source) = if let Some(s) = directives.s_maxage() {
        (s, LifetimeSource::SMaxAge)
    } else if let Some(m) = directives.max_age() {
        (m, LifetimeSource::MaxAge)
    } else {
        match clock.expires {
            Some(Expires::At(at)) => (
                at.duration_since(clock.date).unwrap_or(Duration::ZERO),
                LifetimeSource::Expires,
            ),
            Some(Expires::Invalid) => (Duration::ZERO, LifetimeSource::None),
            None => (Duration::ZERO, LifetimeSource::None),
        }
    };

    let ttl = secs(freshness_lifetime) - secs(age);
    let may_serve_stale =
        ttl < 0 && !directives.must_revalidate() && !directives.proxy_revalidate();

    FreshnessResult {
        age,
        freshness_lifetime,
        ttl,
        usable_stale_window: directives
            .stale_while_revalidate()
            .filter(|_| may_serve_stale),
        stale_if_error_window: directives.stale_if_error().filter(|_| may_serve_stale),
        lifetime_source,
    }
}

fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}
