//! Surrogate keys: tag cached entries, then invalidate them by tag.

pub mod provider;
pub mod store;

pub use provider::{Dialect, SurrogateProvider};
pub use store::{SurrogateError, SurrogateKeyStore, TagValidator};
