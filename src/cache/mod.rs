pub mod result_cache;

pub use result_cache::{canonical_json, is_failure, CacheEntryInfo, CacheStats, CachedResult, ResultCache};
