//! Response cache and storage quota management.

pub mod manager;
pub mod report;
pub mod response;

pub use manager::{recommendations, should_evict, CacheManager, Retention};
pub use report::{CleanupReport, CleanupResult, CleanupStats, CleanupTier};
pub use response::{CachedResponse, RequestKey, ResponseCache};
