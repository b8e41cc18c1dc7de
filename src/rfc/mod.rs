//! HTTP caching semantics: RFC 7234 directives and freshness, RFC 9211
//! `Cache-Status`.
//!
//! Everything here is pure and synchronous; the middleware in
//! [`crate::cache`] strings it together.

pub mod directives;
pub mod freshness;
pub mod status;
pub mod validator;

pub use directives::{CacheControlDirectives, MaxStale, ParsedDirectives};
pub use freshness::{Freshness, FreshnessError, FreshnessResult, ResponseClock};
pub use status::{CacheOutcome, CacheStatusContext, CacheStatusDecision};
pub use validator::{Acceptability, CacheControlValidator, Unstorable};
