//! # rttp-cache
//!
//! An RFC 7234 HTTP cache engine that runs as middleware in front of any
//! async origin handler. It reports every decision in an RFC 9211
//! `Cache-Status` header and indexes stored entries by surrogate key so
//! related entries can be invalidated together, in the Souin, Akamai,
//! Cloudflare, Fastly or generic CDN tagging dialect.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rttp_cache::{HttpCache, Method, Request, Response, StatusCode};
//! use rttp_cache::config::CacheConfig;
//! use rttp_cache::context::Context;
//! use rttp_cache::middleware::Pipeline;
//! use rttp_cache::storage::MemoryStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = HttpCache::new(CacheConfig::default(), Arc::new(MemoryStorage::new()))?;
//!     let pipeline = Pipeline::new(|_ctx: Context| async {
//!         Response::new(StatusCode::Ok)
//!             .header("Cache-Control", "public, max-age=60")
//!             .body("Hello, World!")
//!     })
//!     .layer(Arc::new(cache));
//!
//!     let response = pipeline
//!         .call(Request::new(Method::Get, "/").header("Host", "localhost"))
//!         .await;
//!     println!("{:?}", response.headers().get("Cache-Status"));
//!     Ok(())
//! }
//! ```

// ── Semantics ─────────────────────────────────────────────────────────────────
pub mod rfc;
pub mod surrogate;

// ── Engine ────────────────────────────────────────────────────────────────────
pub mod cache;
pub mod config;
pub mod key;
pub mod storage;

// ── Host framework ────────────────────────────────────────────────────────────
pub mod context;
pub mod http;
pub mod middleware;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheError, HttpCache};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use key::CacheKey;
