use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three independently-quota'd storage areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBucket {
    ResponseCache,
    LocalStore,
    CacheEntries,
}

impl StorageBucket {
    pub const ALL: [StorageBucket; 3] = [
        StorageBucket::ResponseCache,
        StorageBucket::LocalStore,
        StorageBucket::CacheEntries,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            StorageBucket::ResponseCache => "response cache",
            StorageBucket::LocalStore => "local store",
            StorageBucket::CacheEntries => "cache entries",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketUsage {
    pub bytes: u64,
    pub max_bytes: u64,
    pub percentage: f64,
}

impl BucketUsage {
    pub fn new(bytes: u64, max_bytes: u64) -> Self {
        let percentage = if max_bytes == 0 {
            0.0
        } else {
            bytes as f64 / max_bytes as f64 * 100.0
        };
        Self {
            bytes,
            max_bytes,
            percentage,
        }
    }

    /// Usage as a fraction of the quota (0.0..).
    pub fn ratio(&self) -> f64 {
        self.percentage / 100.0
    }
}

/// Point-in-time storage usage. Recomputed on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageUsageSnapshot {
    pub response_cache: BucketUsage,
    pub local_store: BucketUsage,
    pub cache_entries: BucketUsage,
    pub total: BucketUsage,
    pub taken_at: DateTime<Utc>,
}

impl StorageUsageSnapshot {
    pub fn new(response_cache: BucketUsage, local_store: BucketUsage, cache_entries: BucketUsage) -> Self {
        let total = BucketUsage::new(
            response_cache.bytes + local_store.bytes + cache_entries.bytes,
            response_cache.max_bytes + local_store.max_bytes + cache_entries.max_bytes,
        );
        Self {
            response_cache,
            local_store,
            cache_entries,
            total,
            taken_at: Utc::now(),
        }
    }

    pub fn bucket(&self, bucket: StorageBucket) -> &BucketUsage {
        match bucket {
            StorageBucket::ResponseCache => &self.response_cache,
            StorageBucket::LocalStore => &self.local_store,
            StorageBucket::CacheEntries => &self.cache_entries,
        }
    }

    /// Highest usage ratio across the buckets and the total.
    pub fn highest_ratio(&self) -> f64 {
        StorageBucket::ALL
            .iter()
            .map(|b| self.bucket(*b).ratio())
            .fold(self.total.ratio(), f64::max)
    }

    pub fn over(&self, threshold: f64) -> Vec<StorageBucket> {
        StorageBucket::ALL
            .into_iter()
            .filter(|b| self.bucket(*b).ratio() > threshold)
            .collect()
    }
}
