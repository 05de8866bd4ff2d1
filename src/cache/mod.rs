//! Two-layer response cache: exact lookup by normalized key, fuzzy lookup
//! through a MinHash LSH index, TTL by content class, LRU eviction.

pub mod classify;
pub mod minhash;
pub mod normalize;
pub mod similarity;
pub mod store;

pub use classify::{ContentType, TtlPolicy};
pub use normalize::normalize;
pub use similarity::similarity;
pub use store::{CacheEntry, CacheHit, CacheStats, MatchType, ResponseCache};
