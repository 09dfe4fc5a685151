use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::StorageUsageSnapshot;

/// Cleanup intensity, ordered from least to most aggressive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupTier {
    Quick,
    Routine,
    Emergency,
}

impl CleanupTier {
    pub fn label(&self) -> &'static str {
        match self {
            CleanupTier::Quick => "quick",
            CleanupTier::Routine => "routine",
            CleanupTier::Emergency => "emergency",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupResult {
    pub cleaned: usize,
    pub errors: usize,
}

impl AddAssign for CleanupResult {
    fn add_assign(&mut self, other: Self) {
        self.cleaned += other.cleaned;
        self.errors += other.errors;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupReport {
    pub tier: CleanupTier,
    /// Sequence number of the pass that produced this report.
    pub pass_id: u64,
    pub response_cache: CleanupResult,
    pub local_store: CleanupResult,
    pub cache_entries: CleanupResult,
    /// Present when the aggressive pass ran.
    pub aggressive: Option<CleanupResult>,
    pub usage_after: Option<StorageUsageSnapshot>,
    pub elapsed_ms: u64,
    /// The pass died or ran out of time before producing a result.
    pub aborted: bool,
}

impl CleanupReport {
    pub fn new(tier: CleanupTier, pass_id: u64) -> Self {
        Self {
            tier,
            pass_id,
            response_cache: CleanupResult::default(),
            local_store: CleanupResult::default(),
            cache_entries: CleanupResult::default(),
            aggressive: None,
            usage_after: None,
            elapsed_ms: 0,
            aborted: false,
        }
    }

    pub fn aborted(tier: CleanupTier, pass_id: u64) -> Self {
        Self {
            aborted: true,
            ..Self::new(tier, pass_id)
        }
    }

    fn parts(&self) -> impl Iterator<Item = CleanupResult> + '_ {
        [self.response_cache, self.local_store, self.cache_entries]
            .into_iter()
            .chain(self.aggressive)
    }

    pub fn total_cleaned(&self) -> usize {
        self.parts().map(|p| p.cleaned).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.parts().map(|p| p.errors).sum()
    }
}

/// Persisted cleanup bookkeeping plus current usage, for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupStats {
    pub last_cleanup: Option<DateTime<Utc>>,
    pub last_tier: Option<CleanupTier>,
    pub cleanup_count: u64,
    pub usage: StorageUsageSnapshot,
    pub recommendations: Vec<String>,
}
