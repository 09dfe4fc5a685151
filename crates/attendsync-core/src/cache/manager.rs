//! Storage quota enforcement.
//!
//! The `CacheManager` keeps the response cache, the local record store and
//! the cache-data entries under their quotas. Eviction runs in tiers:
//!
//! - **quick**: bounded-time pass on shutdown
//! - **routine**: standard max ages, then size trims down to 70 %
//! - **emergency**: halved max ages plus high-retry and day-old synced
//!   records, size trims down to 50 %, then the aggressive pass if still
//!   over the emergency threshold
//!
//! Only one pass of any tier runs at a time. Callers asking for the same or
//! a lower tier share the in-flight pass's report; a quick pass is skipped
//! instead when anything is already running.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::events::{EventBus, SyncEvent};
use crate::models::{BucketUsage, CacheDataEntry, RecordId, StorageUsageSnapshot, StoreKind};
use crate::store::{EvictionCandidate, StoreError, StoreHandle};

use super::report::{CleanupReport, CleanupResult, CleanupStats, CleanupTier};
use super::response::{CachedResponse, ResponseCache};

/// Cache-data key holding cleanup bookkeeping.
const STATS_KEY: &str = "cachemanager_stats";

/// Max ages applied by one cleanup pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Retention {
    pub responses: Duration,
    pub unsynced: Duration,
    pub synced: Duration,
    pub entries: Duration,
}

impl Retention {
    pub fn standard(config: &CacheConfig) -> Self {
        Self {
            responses: Duration::days(config.response_max_age_days),
            unsynced: Duration::days(config.unsynced_max_age_days),
            synced: Duration::days(config.synced_max_age_days),
            entries: Duration::days(config.entry_max_age_days),
        }
    }

    pub fn scaled(&self, factor: f64) -> Self {
        let scale = |d: Duration| Duration::milliseconds((d.num_milliseconds() as f64 * factor) as i64);
        Self {
            responses: scale(self.responses),
            unsynced: scale(self.unsynced),
            synced: scale(self.synced),
            entries: scale(self.entries),
        }
    }

    pub fn record_max_age(&self, synced: bool) -> Duration {
        if synced {
            self.synced
        } else {
            self.unsynced
        }
    }
}

/// Age rule for one record: past the max age for its sync state.
pub fn should_evict(age: Duration, synced: bool, retention: &Retention) -> bool {
    age > retention.record_max_age(synced)
}

/// Advice for operators, based on how full each bucket is.
pub fn recommendations(usage: &StorageUsageSnapshot, config: &CacheConfig) -> Vec<String> {
    let mut out = Vec::new();
    let threshold = config.cleanup_threshold;
    if usage.response_cache.ratio() > threshold {
        out.push("Response cache is high - consider clearing old cached responses".to_string());
    }
    if usage.local_store.ratio() > threshold {
        out.push("Local store is high - consider syncing and clearing old records".to_string());
    }
    if usage.cache_entries.ratio() > threshold {
        out.push("Cache entries are high - consider clearing temporary data".to_string());
    }
    if usage.total.ratio() > 0.9 {
        out.push("Total storage critically high - immediate cleanup recommended".to_string());
    }
    out
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredStats {
    last_cleanup: Option<DateTime<Utc>>,
    last_tier: Option<CleanupTier>,
    #[serde(default)]
    cleanup_count: u64,
}

type PassFuture = Shared<BoxFuture<'static, CleanupReport>>;

struct InFlight {
    tier: CleanupTier,
    pass_id: u64,
    pass: PassFuture,
}

enum Step {
    Join(PassFuture),
    WaitThenRetry(PassFuture),
    Run(PassFuture),
}

struct ManagerInner {
    config: CacheConfig,
    store: StoreHandle,
    responses: ResponseCache,
    events: EventBus,
    in_flight: Mutex<Option<InFlight>>,
    passes: AtomicU64,
}

/// Clone is cheap; clones share the in-flight pass.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<ManagerInner>,
}

impl CacheManager {
    pub fn new(config: CacheConfig, store: StoreHandle, responses: ResponseCache, events: EventBus) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                store,
                responses,
                events,
                in_flight: Mutex::new(None),
                passes: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn responses(&self) -> &ResponseCache {
        &self.inner.responses
    }

    pub async fn get_usage(&self) -> StorageUsageSnapshot {
        self.inner.usage().await
    }

    /// Run the cleanup tier the current usage calls for, if any.
    pub async fn check_and_maybe_clean(&self) -> Option<CleanupReport> {
        let usage = self.get_usage().await;
        let ratio = usage.highest_ratio();
        let config = &self.inner.config;

        if ratio > config.emergency_threshold {
            warn!(percentage = ratio * 100.0, "Storage usage critical, starting emergency cleanup");
            Some(self.perform_emergency_cleanup().await)
        } else if ratio > config.cleanup_threshold {
            info!(percentage = ratio * 100.0, "Storage usage high, starting routine cleanup");
            Some(self.perform_routine_cleanup().await)
        } else {
            debug!(percentage = ratio * 100.0, "Storage usage within limits");
            None
        }
    }

    pub async fn perform_routine_cleanup(&self) -> CleanupReport {
        self.run_tier(CleanupTier::Routine).await
    }

    pub async fn perform_emergency_cleanup(&self) -> CleanupReport {
        self.run_tier(CleanupTier::Emergency).await
    }

    /// A write was rejected for lack of space: go straight to an emergency pass.
    pub async fn handle_quota_exceeded(&self) -> CleanupReport {
        warn!("Storage quota exceeded, escalating to emergency cleanup");
        self.perform_emergency_cleanup().await
    }

    /// Best-effort pass bounded by the configured time budget.
    ///
    /// Skipped (returns `None`) while another pass is running, or when the
    /// budget runs out. Routine and emergency requests arriving meanwhile
    /// wait for it to finish.
    pub async fn quick_cleanup(&self) -> Option<CleanupReport> {
        let pass = {
            let mut slot = self.inner.slot();
            if slot.is_some() {
                debug!("Cleanup already running, skipping quick cleanup");
                return None;
            }
            let (pass_id, pass) = self.start(CleanupTier::Quick);
            *slot = Some(InFlight {
                tier: CleanupTier::Quick,
                pass_id,
                pass: pass.clone(),
            });
            pass
        };

        let report = pass.await;
        (!report.aborted).then_some(report)
    }

    /// Delete every response cache bucket.
    pub async fn clear_all_caches(&self) -> CleanupResult {
        let mut result = CleanupResult::default();
        match self.inner.responses.bucket_names() {
            Ok(buckets) => {
                for bucket in buckets {
                    match self.inner.responses.delete_bucket(&bucket) {
                        Ok(_) => result.cleaned += 1,
                        Err(e) => {
                            warn!(bucket = %bucket, error = %e, "Failed to delete cache bucket");
                            result.errors += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to list cache buckets");
                result.errors += 1;
            }
        }
        info!(cleaned = result.cleaned, errors = result.errors, "Cleared all response caches");
        result
    }

    pub async fn cleanup_stats(&self) -> CleanupStats {
        let stored = self.inner.load_stats().await;
        let usage = self.get_usage().await;
        CleanupStats {
            last_cleanup: stored.last_cleanup,
            last_tier: stored.last_tier,
            cleanup_count: stored.cleanup_count,
            recommendations: recommendations(&usage, &self.inner.config),
            usage,
        }
    }

    /// Periodic storage checks and routine cleanups until `shutdown` flips to true.
    pub fn spawn_monitor(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let config = &manager.inner.config;
            let mut check = tokio::time::interval(config.check_interval());
            let mut routine = tokio::time::interval(config.routine_interval());
            check.set_missed_tick_behavior(MissedTickBehavior::Delay);
            routine.set_missed_tick_behavior(MissedTickBehavior::Delay);
            check.tick().await;
            routine.tick().await;

            manager.check_and_maybe_clean().await;

            loop {
                tokio::select! {
                    _ = check.tick() => {
                        manager.check_and_maybe_clean().await;
                    }
                    _ = routine.tick() => {
                        manager.perform_routine_cleanup().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Cache monitor stopped");
        })
    }

    async fn run_tier(&self, tier: CleanupTier) -> CleanupReport {
        loop {
            let step = {
                let mut slot = self.inner.slot();
                match slot.as_ref() {
                    Some(running) if running.tier >= tier => Step::Join(running.pass.clone()),
                    Some(running) => Step::WaitThenRetry(running.pass.clone()),
                    None => {
                        let (pass_id, pass) = self.start(tier);
                        *slot = Some(InFlight {
                            tier,
                            pass_id,
                            pass: pass.clone(),
                        });
                        Step::Run(pass)
                    }
                }
            };

            match step {
                Step::Join(pass) => {
                    debug!(tier = tier.label(), "Joining in-flight cleanup");
                    return pass.await;
                }
                Step::WaitThenRetry(pass) => {
                    debug!(tier = tier.label(), "Waiting for lower-tier cleanup to finish");
                    pass.await;
                }
                Step::Run(pass) => return pass.await,
            }
        }
    }

    fn start(&self, tier: CleanupTier) -> (u64, PassFuture) {
        let pass_id = self.inner.next_pass_id();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let report = match tier {
                CleanupTier::Quick => inner.bounded_quick_pass(pass_id).await,
                _ => inner.perform(tier, pass_id).await,
            };
            inner.finish(pass_id);
            report
        });

        let pass = async move {
            match task.await {
                Ok(report) => report,
                Err(e) => {
                    warn!(error = %e, "Cleanup task failed");
                    CleanupReport::aborted(tier, pass_id)
                }
            }
        }
        .boxed()
        .shared();
        (pass_id, pass)
    }
}

impl ManagerInner {
    fn slot(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish(&self, pass_id: u64) {
        let mut slot = self.slot();
        if slot.as_ref().map(|f| f.pass_id) == Some(pass_id) {
            *slot = None;
        }
    }

    fn next_pass_id(&self) -> u64 {
        self.passes.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn usage(&self) -> StorageUsageSnapshot {
        let responses = self.responses.bytes_used().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to measure response cache");
            0
        });
        let local = self.store.bytes_used().await;
        let entries = self.store.entry_bytes().await;
        StorageUsageSnapshot::new(
            BucketUsage::new(responses, self.config.response_cache_quota_bytes),
            BucketUsage::new(local, self.config.local_store_quota_bytes),
            BucketUsage::new(entries, self.config.cache_entries_quota_bytes),
        )
    }

    async fn perform(&self, tier: CleanupTier, pass_id: u64) -> CleanupReport {
        let started = Instant::now();
        let now = Utc::now();
        let emergency = tier == CleanupTier::Emergency;
        let standard = Retention::standard(&self.config);
        let retention = if emergency {
            standard.scaled(self.config.emergency_age_factor)
        } else {
            standard
        };

        let mut report = CleanupReport::new(tier, pass_id);
        report.response_cache += self.evict_old_responses(retention.responses, now, None);
        report.local_store += self.evict_old_records(&retention, now, emergency).await;
        report.cache_entries += self.evict_old_entries(retention.entries, now).await;

        let (trigger, target) = if emergency {
            (self.config.emergency_trim_ratio, self.config.emergency_trim_ratio)
        } else {
            (self.config.cleanup_threshold, self.config.routine_trim_ratio)
        };
        let usage = self.usage().await;
        if usage.response_cache.ratio() > trigger {
            report.response_cache += self.trim_responses(&usage.response_cache, target);
        }
        if usage.cache_entries.ratio() > trigger {
            report.cache_entries += self.trim_entries(&usage.cache_entries, target).await;
        }

        if emergency {
            let usage = self.usage().await;
            if usage.highest_ratio() > self.config.emergency_threshold {
                warn!(
                    percentage = usage.highest_ratio() * 100.0,
                    "Storage still critical after emergency cleanup, running aggressive pass"
                );
                report.aggressive = Some(self.aggressive_pass(now).await);
            }
        }

        report.usage_after = Some(self.usage().await);
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        self.finish_report(&report).await;
        report
    }

    async fn bounded_quick_pass(&self, pass_id: u64) -> CleanupReport {
        let budget = self.config.quick_cleanup_budget();
        match tokio::time::timeout(budget, self.quick_pass(pass_id)).await {
            Ok(report) => report,
            Err(_) => {
                warn!(budget_ms = budget.as_millis() as u64, "Quick cleanup ran out of time");
                CleanupReport::aborted(CleanupTier::Quick, pass_id)
            }
        }
    }

    async fn quick_pass(&self, pass_id: u64) -> CleanupReport {
        let started = Instant::now();
        let now = Utc::now();
        let retention = Retention::standard(&self.config);
        let mut report = CleanupReport::new(CleanupTier::Quick, pass_id);

        let cutoff = now.timestamp_millis() - retention.synced.num_milliseconds();
        for kind in StoreKind::ALL {
            match self.store.purge_older_than(kind, cutoff, true).await {
                Ok(n) => report.local_store.cleaned += n,
                Err(StoreError::UnknownStore(_)) => {}
                Err(e) => {
                    warn!(store = %kind, error = %e, "Quick cleanup failed to purge records");
                    report.local_store.errors += 1;
                }
            }
        }

        report.response_cache += self.evict_old_responses(
            retention.responses,
            now,
            Some(self.config.quick_cleanup_entry_limit),
        );

        report.cache_entries += self.evict_expired_entries(now).await;

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        self.finish_report(&report).await;
        report
    }

    async fn finish_report(&self, report: &CleanupReport) {
        self.save_stats(report.tier).await;
        let (cleaned, errors) = (report.total_cleaned(), report.total_errors());
        self.events.emit(SyncEvent::CleanupCompleted {
            tier: report.tier,
            cleaned,
            errors,
        });
        info!(
            tier = report.tier.label(),
            pass_id = report.pass_id,
            cleaned,
            errors,
            elapsed_ms = report.elapsed_ms,
            "Cache cleanup completed"
        );
    }

    async fn load_stats(&self) -> StoredStats {
        match self.store.get_entry(STATS_KEY).await {
            Ok(Some(entry)) => serde_json::from_value(entry.value).unwrap_or_default(),
            _ => StoredStats::default(),
        }
    }

    async fn save_stats(&self, tier: CleanupTier) {
        let mut stats = self.load_stats().await;
        stats.last_cleanup = Some(Utc::now());
        stats.last_tier = Some(tier);
        stats.cleanup_count += 1;
        let value = match serde_json::to_value(&stats) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Failed to encode cleanup stats");
                return;
            }
        };
        if let Err(e) = self.store.put_entry(STATS_KEY, value, None).await {
            debug!(error = %e, "Failed to save cleanup stats");
        }
    }

    /// Delete responses captured before `now - max_age`, at most `limit` of them.
    fn evict_old_responses(&self, max_age: Duration, now: DateTime<Utc>, limit: Option<usize>) -> CleanupResult {
        let mut result = CleanupResult::default();
        let cutoff = now - max_age;
        let mut old: Vec<(String, CachedResponse)> = match self.all_responses() {
            Ok(all) => all.into_iter().filter(|(_, e)| e.captured_at < cutoff).collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list cached responses");
                result.errors += 1;
                return result;
            }
        };
        if let Some(limit) = limit {
            old.truncate(limit);
        }

        for (bucket, entry) in old {
            match self.responses.delete(&bucket, &entry.key) {
                Ok(_) => result.cleaned += 1,
                Err(e) => {
                    warn!(bucket = %bucket, url = %entry.key.url, error = %e, "Failed to evict cached response");
                    result.errors += 1;
                }
            }
        }
        result
    }

    /// Every cached response across buckets, oldest first.
    fn all_responses(&self) -> anyhow::Result<Vec<(String, CachedResponse)>> {
        let mut all = Vec::new();
        for bucket in self.responses.bucket_names()? {
            for entry in self.responses.entries(&bucket)? {
                all.push((bucket.clone(), entry));
            }
        }
        all.sort_by_key(|(_, e)| e.captured_at);
        Ok(all)
    }

    async fn evict_old_records(&self, retention: &Retention, now: DateTime<Utc>, emergency: bool) -> CleanupResult {
        let mut result = CleanupResult::default();
        let now_ms = now.timestamp_millis();
        let emergency_synced_age = Duration::hours(self.config.aggressive_synced_max_age_hours);

        for kind in StoreKind::ALL {
            let candidates = match self.store.eviction_candidates(kind).await {
                Ok(candidates) => candidates,
                Err(StoreError::UnknownStore(_)) => continue,
                Err(e) => {
                    warn!(store = %kind, error = %e, "Failed to read records for cleanup");
                    result.errors += 1;
                    continue;
                }
            };

            let ids: Vec<RecordId> = candidates
                .iter()
                .filter(|c| self.record_is_evictable(c, retention, now_ms, emergency, emergency_synced_age))
                .map(|c| c.id)
                .collect();
            if ids.is_empty() {
                continue;
            }

            match self.store.delete_many(kind, &ids).await {
                Ok(n) => {
                    debug!(store = %kind, cleaned = n, "Evicted old records");
                    result.cleaned += n;
                }
                Err(e) => {
                    warn!(store = %kind, error = %e, "Failed to evict old records");
                    result.errors += ids.len();
                }
            }
        }
        result
    }

    fn record_is_evictable(
        &self,
        candidate: &EvictionCandidate,
        retention: &Retention,
        now_ms: i64,
        emergency: bool,
        emergency_synced_age: Duration,
    ) -> bool {
        let age = candidate.timestamp.map(|ts| Duration::milliseconds(now_ms - ts));
        let aged_out = age
            .map(|age| should_evict(age, candidate.synced, retention))
            .unwrap_or(false);
        if aged_out || !emergency {
            return aged_out;
        }

        let retried_out = candidate.retry_count > self.config.max_retry_count;
        let synced_day_old = candidate.synced && age.map(|a| a > emergency_synced_age).unwrap_or(false);
        retried_out || synced_day_old
    }

    async fn evict_old_entries(&self, max_age: Duration, now: DateTime<Utc>) -> CleanupResult {
        let now_ms = now.timestamp_millis();
        let cutoff = now_ms - max_age.num_milliseconds();
        let essential = &self.config.essential_key_prefixes;
        self.evict_entries_where(|e| {
            e.is_expired(now_ms) || (e.timestamp < cutoff && !e.is_essential(essential) && e.key != STATS_KEY)
        })
        .await
    }

    async fn evict_expired_entries(&self, now: DateTime<Utc>) -> CleanupResult {
        let now_ms = now.timestamp_millis();
        self.evict_entries_where(|e| e.is_expired(now_ms)).await
    }

    async fn evict_entries_where<F>(&self, predicate: F) -> CleanupResult
    where
        F: Fn(&CacheDataEntry) -> bool,
    {
        let mut result = CleanupResult::default();
        let entries = match self.store.entries().await {
            Ok(entries) => entries,
            Err(StoreError::UnknownStore(_)) => return result,
            Err(e) => {
                warn!(error = %e, "Failed to read cache entries");
                result.errors += 1;
                return result;
            }
        };
        let keys: Vec<String> = entries.iter().filter(|e| predicate(e)).map(|e| e.key.clone()).collect();
        if keys.is_empty() {
            return result;
        }
        match self.store.delete_entries(&keys).await {
            Ok(n) => result.cleaned += n,
            Err(e) => {
                warn!(error = %e, "Failed to evict cache entries");
                result.errors += keys.len();
            }
        }
        result
    }

    /// Remove the oldest responses until the bucket is at or under `target` of its quota.
    fn trim_responses(&self, usage: &BucketUsage, target: f64) -> CleanupResult {
        let mut result = CleanupResult::default();
        let target_bytes = (usage.max_bytes as f64 * target) as u64;
        let mut used = usage.bytes;

        let all = match self.all_responses() {
            Ok(all) => all,
            Err(e) => {
                warn!(error = %e, "Failed to list cached responses");
                result.errors += 1;
                return result;
            }
        };

        for (bucket, entry) in all {
            if used <= target_bytes {
                break;
            }
            match self.responses.delete(&bucket, &entry.key) {
                Ok(_) => {
                    used = used.saturating_sub(entry.size);
                    result.cleaned += 1;
                }
                Err(e) => {
                    warn!(bucket = %bucket, error = %e, "Failed to trim cached response");
                    result.errors += 1;
                }
            }
        }
        debug!(cleaned = result.cleaned, used, target_bytes, "Trimmed response cache");
        result
    }

    /// Remove the oldest non-essential entries until at or under `target` of the quota.
    async fn trim_entries(&self, usage: &BucketUsage, target: f64) -> CleanupResult {
        let mut result = CleanupResult::default();
        let target_bytes = (usage.max_bytes as f64 * target) as u64;
        let mut used = usage.bytes;

        let mut entries = match self.store.entries().await {
            Ok(entries) => entries,
            Err(StoreError::UnknownStore(_)) => return result,
            Err(e) => {
                warn!(error = %e, "Failed to read cache entries");
                result.errors += 1;
                return result;
            }
        };
        entries.sort_by_key(|e| e.timestamp);

        let essential = &self.config.essential_key_prefixes;
        let mut keys = Vec::new();
        for entry in entries.iter().filter(|e| !e.is_essential(essential) && e.key != STATS_KEY) {
            if used <= target_bytes {
                break;
            }
            used = used.saturating_sub(entry.approx_bytes());
            keys.push(entry.key.clone());
        }
        if keys.is_empty() {
            return result;
        }
        match self.store.delete_entries(&keys).await {
            Ok(n) => result.cleaned += n,
            Err(e) => {
                warn!(error = %e, "Failed to trim cache entries");
                result.errors += keys.len();
            }
        }
        result
    }

    /// Drop dynamic and stale-version buckets, and every synced record older than a day.
    async fn aggressive_pass(&self, now: DateTime<Utc>) -> CleanupResult {
        let mut result = CleanupResult::default();

        match self.responses.bucket_names() {
            Ok(buckets) => {
                for bucket in buckets {
                    if !(self.config.is_dynamic_bucket(&bucket) || self.config.is_stale_bucket(&bucket)) {
                        continue;
                    }
                    match self.responses.delete_bucket(&bucket) {
                        Ok(true) => {
                            info!(bucket = %bucket, "Deleted cache bucket");
                            result.cleaned += 1;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!(bucket = %bucket, error = %e, "Failed to delete cache bucket");
                            result.errors += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to list cache buckets");
                result.errors += 1;
            }
        }

        let cutoff = now - Duration::hours(self.config.aggressive_synced_max_age_hours);
        for kind in StoreKind::ALL {
            match self.store.purge_older_than(kind, cutoff.timestamp_millis(), true).await {
                Ok(n) => result.cleaned += n,
                Err(StoreError::UnknownStore(_)) => {}
                Err(e) => {
                    warn!(store = %kind, error = %e, "Failed to purge synced records");
                    result.errors += 1;
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RequestKey;
    use crate::models::{now_millis, NewRecord, ScanData, ScanType};
    use crate::store::StoreOptions;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: StoreHandle,
        manager: CacheManager,
    }

    fn fixture(config: CacheConfig) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StoreHandle::open(
            &dir.path().join("db"),
            StoreOptions {
                quota_bytes: None,
                ..StoreOptions::default()
            },
        )
        .expect("store");
        let responses = ResponseCache::new(dir.path().join("responses")).expect("responses");
        let manager = CacheManager::new(config, store.clone(), responses, EventBus::default());
        Fixture {
            _dir: dir,
            store,
            manager,
        }
    }

    fn record_at(timestamp: i64) -> NewRecord {
        NewRecord::Attendance {
            scan_type: ScanType::Qr,
            scan_data: ScanData {
                qr_data: Some("S".to_string()),
                subject_id: Some("1".to_string()),
                ..ScanData::default()
            },
            timestamp,
        }
    }

    #[test]
    fn test_should_evict_respects_sync_state() {
        let retention = Retention::standard(&CacheConfig::default());
        let ages = [1, 5, 10, 40];

        let unsynced: Vec<bool> = ages
            .iter()
            .map(|d| should_evict(Duration::days(*d), false, &retention))
            .collect();
        assert_eq!(unsynced, vec![false, false, false, true]);

        let synced: Vec<bool> = ages
            .iter()
            .map(|d| should_evict(Duration::days(*d), true, &retention))
            .collect();
        assert_eq!(synced, vec![false, false, true, true]);
    }

    #[test]
    fn test_emergency_retention_is_halved() {
        let standard = Retention::standard(&CacheConfig::default());
        let scaled = standard.scaled(0.5);
        assert_eq!(scaled.unsynced, Duration::days(15));
        assert_eq!(scaled.synced, Duration::hours(84));
    }

    #[test]
    fn test_recommendations_follow_usage() {
        let config = CacheConfig::default();
        let usage = StorageUsageSnapshot::new(
            BucketUsage::new(85, 100),
            BucketUsage::new(10, 100),
            BucketUsage::new(0, 100),
        );
        let advice = recommendations(&usage, &config);
        assert_eq!(advice.len(), 1);
        assert!(advice[0].starts_with("Response cache"));
    }

    #[tokio::test]
    async fn test_routine_cleanup_evicts_by_age() {
        let fx = fixture(CacheConfig::default());
        let day = Duration::days(1).num_milliseconds();
        let now = now_millis();

        let mut ids = Vec::new();
        for days in [1, 5, 10, 40] {
            ids.push(fx.store.add_record(record_at(now - days * day)).await.expect("add"));
        }
        for id in &ids {
            fx.store.mark_synced(StoreKind::AttendanceRecords, *id).await.expect("mark");
        }
        for days in [1, 5, 10, 40] {
            fx.store.add_record(record_at(now - days * day)).await.expect("add");
        }

        let report = fx.manager.perform_routine_cleanup().await;
        assert_eq!(report.local_store, CleanupResult { cleaned: 3, errors: 0 });

        let remaining = fx.store.records(StoreKind::AttendanceRecords).await.expect("records");
        assert_eq!(remaining.len(), 5);
        assert_eq!(fx.store.pending_counts().await.attendance, 3);
    }

    #[tokio::test]
    async fn test_concurrent_routine_cleanups_share_one_pass() {
        let fx = fixture(CacheConfig::default());
        let (a, b) = tokio::join!(
            fx.manager.perform_routine_cleanup(),
            fx.manager.perform_routine_cleanup()
        );
        assert_eq!(a.pass_id, b.pass_id);
        assert_eq!(a, b);

        let c = fx.manager.perform_routine_cleanup().await;
        assert_ne!(c.pass_id, a.pass_id);
    }

    #[tokio::test]
    async fn test_emergency_drops_high_retry_records() {
        let fx = fixture(CacheConfig::default());
        let id = fx.store.add_record(record_at(now_millis())).await.expect("add");
        for _ in 0..6 {
            fx.store
                .record_failure(StoreKind::AttendanceRecords, id, "HTTP 500", None)
                .await
                .expect("fail");
        }
        let keep = fx.store.add_record(record_at(now_millis())).await.expect("add");

        let report = fx.manager.perform_emergency_cleanup().await;
        assert_eq!(report.local_store.cleaned, 1);
        let ids: Vec<RecordId> = fx
            .store
            .records(StoreKind::AttendanceRecords)
            .await
            .expect("records")
            .iter()
            .map(|r| r.id())
            .collect();
        assert_eq!(ids, vec![keep]);
    }

    #[tokio::test]
    async fn test_routine_trim_removes_oldest_responses_first() {
        let config = CacheConfig {
            response_cache_quota_bytes: 1000,
            ..CacheConfig::default()
        };
        let fx = fixture(config);
        let responses = fx.manager.responses();
        let now = Utc::now();
        for (i, url) in ["/a", "/b", "/c"].iter().enumerate() {
            responses
                .put_at(
                    "kes-smart-static-v1",
                    &RequestKey::get(*url),
                    200,
                    None,
                    &[0u8; 300],
                    now - Duration::hours(3 - i as i64),
                )
                .expect("put");
        }

        let report = fx.manager.check_and_maybe_clean().await.expect("cleanup ran");
        assert_eq!(report.tier, CleanupTier::Routine);
        let urls: Vec<String> = responses
            .entries("kes-smart-static-v1")
            .expect("entries")
            .into_iter()
            .map(|e| e.key.url)
            .collect();
        assert_eq!(urls, vec!["/b", "/c"]);
    }

    #[tokio::test]
    async fn test_quick_cleanup_drops_expired_entries_and_old_synced() {
        let fx = fixture(CacheConfig::default());
        let old = now_millis() - Duration::days(8).num_milliseconds();
        let id = fx.store.add_record(record_at(old)).await.expect("add");
        fx.store.mark_synced(StoreKind::AttendanceRecords, id).await.expect("mark");
        fx.store
            .put_entry("temp_scan", serde_json::json!(1), Some(Duration::milliseconds(-1)))
            .await
            .expect("put");

        let report = fx.manager.quick_cleanup().await.expect("ran");
        assert_eq!(report.tier, CleanupTier::Quick);
        assert_eq!(report.local_store.cleaned, 1);
        assert_eq!(report.cache_entries.cleaned, 1);

        let stats = fx.manager.cleanup_stats().await;
        assert_eq!(stats.cleanup_count, 1);
        assert_eq!(stats.last_tier, Some(CleanupTier::Quick));
    }

    #[tokio::test]
    async fn test_quick_cleanup_holds_the_slot() {
        let fx = fixture(CacheConfig::default());

        let mut quick = Box::pin(fx.manager.quick_cleanup());
        assert!(futures::poll!(&mut quick).is_pending());
        let running = fx.manager.inner.slot().as_ref().map(|f| f.tier);
        assert_eq!(running, Some(CleanupTier::Quick));

        assert!(fx.manager.quick_cleanup().await.is_none());
        let (quick, routine) = tokio::join!(quick, fx.manager.perform_routine_cleanup());
        let quick = quick.expect("quick pass ran");
        assert_eq!(routine.tier, CleanupTier::Routine);
        assert!(routine.pass_id > quick.pass_id);
        assert!(fx.manager.inner.slot().is_none());
        assert_eq!(fx.manager.cleanup_stats().await.cleanup_count, 2);
    }
}
