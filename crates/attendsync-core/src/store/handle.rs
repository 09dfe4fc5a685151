use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::{
    now_millis, CacheDataEntry, NewRecord, PendingCounts, Record, RecordId, StoreKind,
};

use super::database::{Database, EvictionCandidate, RepairReport};
use super::{StoreError, StoreOptions};

/// How the store ended up being opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StoreMode {
    /// Disk-backed at the requested schema version.
    Full,
    /// Disk-backed at an older installed version because an upgrade was blocked.
    Compat { installed: u32, requested: u32 },
    /// Memory only; nothing survives a restart.
    Degraded { reason: String },
}

impl StoreMode {
    /// User-facing notice for anything other than a full open.
    pub fn notice(&self) -> Option<String> {
        match self {
            StoreMode::Full => None,
            StoreMode::Compat { .. } => Some(
                "Database upgrade blocked - please close other sessions of this app".to_string(),
            ),
            StoreMode::Degraded { reason } => Some(format!(
                "Offline storage unavailable ({}) - records are kept in memory only",
                reason
            )),
        }
    }
}

pub struct OpenOutcome {
    pub handle: StoreHandle,
    pub mode: StoreMode,
}

struct StoreInner {
    db: Option<Database>,
    mode: StoreMode,
    dir: Option<PathBuf>,
    options: StoreOptions,
}

impl StoreInner {
    /// The open database, with any store another process rewrote reloaded.
    fn db_mut(&mut self) -> Result<&mut Database, StoreError> {
        let db = self
            .db
            .as_mut()
            .ok_or_else(|| StoreError::Unavailable("store is closed".to_string()))?;
        db.refresh()?;
        Ok(db)
    }
}

/// Process-wide handle to the local record store. Clone is cheap.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<Mutex<StoreInner>>,
}

impl StoreHandle {
    fn from_parts(db: Database, mode: StoreMode, dir: Option<PathBuf>, options: StoreOptions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                db: Some(db),
                mode,
                dir,
                options,
            })),
        }
    }

    /// Open (creating or upgrading) the store in `dir`.
    pub fn open(dir: &Path, options: StoreOptions) -> Result<Self, StoreError> {
        let db = Database::open(dir, &options, None)?;
        Ok(Self::from_parts(db, StoreMode::Full, Some(dir.to_path_buf()), options))
    }

    /// Open the store at its installed version without upgrading.
    pub fn open_current_version(dir: &Path, options: StoreOptions) -> Result<OpenOutcome, StoreError> {
        let db = Database::open_installed(dir, &options)?;
        let mode = if db.version() >= options.version {
            StoreMode::Full
        } else {
            StoreMode::Compat {
                installed: db.version(),
                requested: options.version,
            }
        };
        Ok(Self::outcome(db, mode, dir, options))
    }

    /// Memory-only store.
    pub fn in_memory(options: StoreOptions, reason: impl Into<String>) -> Self {
        let db = Database::in_memory(&options);
        Self::from_parts(
            db,
            StoreMode::Degraded {
                reason: reason.into(),
            },
            None,
            options,
        )
    }

    /// Normal open, then (if blocked) a delayed retry and a compatibility open,
    /// then an in-memory store. Never fails.
    pub async fn open_with_fallback(dir: &Path, options: StoreOptions) -> OpenOutcome {
        match Database::open(dir, &options, None) {
            Ok(db) => return Self::outcome(db, StoreMode::Full, dir, options),
            Err(StoreError::SchemaBlocked {
                installed,
                requested,
                holders,
            }) => {
                warn!(installed, requested, holders, "Offline database upgrade blocked, retrying");
            }
            Err(e) => return Self::degraded(dir, options, e),
        }

        tokio::time::sleep(options.blocked_retry_delay).await;

        match Database::open(dir, &options, None) {
            Ok(db) => Self::outcome(db, StoreMode::Full, dir, options),
            Err(StoreError::SchemaBlocked { .. }) => {
                match Self::open_current_version(dir, options.clone()) {
                    Ok(outcome) => {
                        warn!(mode = ?outcome.mode, "Opened offline database in compatibility mode");
                        outcome
                    }
                    Err(e) => Self::degraded(dir, options, e),
                }
            }
            Err(e) => Self::degraded(dir, options, e),
        }
    }

    fn outcome(db: Database, mode: StoreMode, dir: &Path, options: StoreOptions) -> OpenOutcome {
        let handle = Self::from_parts(db, mode.clone(), Some(dir.to_path_buf()), options);
        OpenOutcome { handle, mode }
    }

    fn degraded(dir: &Path, options: StoreOptions, error: StoreError) -> OpenOutcome {
        warn!(dir = %dir.display(), error = %error, "Offline database unavailable, using memory store");
        let mode = StoreMode::Degraded {
            reason: error.to_string(),
        };
        let db = Database::in_memory(&options);
        let handle = Self::from_parts(db, mode.clone(), Some(dir.to_path_buf()), options);
        OpenOutcome { handle, mode }
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Database) -> Result<T, StoreError>,
    {
        let mut inner = self.inner.lock().await;
        f(inner.db_mut()?)
    }

    pub async fn mode(&self) -> StoreMode {
        self.inner.lock().await.mode.clone()
    }

    pub async fn version(&self) -> Option<u32> {
        self.inner.lock().await.db.as_ref().map(Database::version)
    }

    /// Retry a blocked or failed upgrade, swapping the backend in place on success.
    ///
    /// Rows captured while running from memory are copied into the disk store
    /// (receiving new ids there).
    pub async fn retry_upgrade(&self) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.mode == StoreMode::Full {
            return Ok(true);
        }
        let dir = match &inner.dir {
            Some(dir) => dir.clone(),
            None => return Ok(false),
        };

        let own_lease = inner
            .db
            .as_ref()
            .and_then(|db| db.lease_path().map(Path::to_path_buf));
        match Database::open(&dir, &inner.options, own_lease.as_deref()) {
            Ok(mut db) => {
                if let (StoreMode::Degraded { .. }, Some(memory)) = (&inner.mode, &inner.db) {
                    let moved = db.absorb(memory)?;
                    info!(moved, "Moved in-memory records into offline database");
                }
                inner.db = Some(db);
                inner.mode = StoreMode::Full;
                info!(dir = %dir.display(), "Offline database upgrade completed");
                Ok(true)
            }
            Err(StoreError::SchemaBlocked { holders, .. }) => {
                debug!(holders, "Offline database upgrade still blocked");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Retry the upgrade every `every` until it succeeds or `give_up_after` has passed.
    pub fn spawn_upgrade_retry(&self, every: Duration, give_up_after: Duration) -> JoinHandle<bool> {
        let handle = self.clone();
        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match handle.retry_upgrade().await {
                    Ok(true) => return true,
                    Ok(false) => {}
                    Err(e) => debug!(error = %e, "Offline database upgrade retry failed"),
                }
                if started.elapsed() >= give_up_after {
                    warn!("Giving up on offline database upgrade; close other sessions and restart");
                    return false;
                }
            }
        })
    }

    // ===== Records =====

    pub async fn add_record(&self, record: NewRecord) -> Result<RecordId, StoreError> {
        self.with_db(|db| db.add_record(record)).await
    }

    pub async fn get(&self, kind: StoreKind, id: RecordId) -> Result<Option<Record>, StoreError> {
        self.with_db(|db| db.get_record(kind, id)).await
    }

    pub async fn delete(&self, kind: StoreKind, id: RecordId) -> Result<bool, StoreError> {
        self.with_db(|db| db.delete_many(kind, &[id]).map(|n| n > 0)).await
    }

    pub async fn delete_many(&self, kind: StoreKind, ids: &[RecordId]) -> Result<usize, StoreError> {
        self.with_db(|db| db.delete_many(kind, ids)).await
    }

    pub async fn records(&self, kind: StoreKind) -> Result<Vec<Record>, StoreError> {
        self.with_db(|db| db.records(kind)).await
    }

    /// Unsynced records in insertion order. Never fails: errors yield an empty list.
    pub async fn query_unsynced(&self, kind: StoreKind) -> Vec<Record> {
        match self.with_db(|db| db.query_unsynced(kind)).await {
            Ok(records) => records,
            Err(e) => {
                warn!(store = %kind, error = %e, "Failed to query unsynced records");
                Vec::new()
            }
        }
    }

    pub async fn mark_synced(&self, kind: StoreKind, id: RecordId) -> Result<(), StoreError> {
        self.with_db(|db| db.mark_synced(kind, id)).await
    }

    pub async fn record_failure(
        &self,
        kind: StoreKind,
        id: RecordId,
        error: &str,
        next_retry_at: Option<i64>,
    ) -> Result<(), StoreError> {
        self.with_db(|db| db.record_failure(kind, id, error, next_retry_at)).await
    }

    pub async fn purge_older_than(
        &self,
        kind: StoreKind,
        cutoff_ms: i64,
        only_synced: bool,
    ) -> Result<usize, StoreError> {
        self.with_db(|db| db.purge_older_than(kind, cutoff_ms, only_synced)).await
    }

    pub async fn eviction_candidates(&self, kind: StoreKind) -> Result<Vec<EvictionCandidate>, StoreError> {
        self.with_db(|db| db.eviction_candidates(kind)).await
    }

    pub async fn repair(&self, kind: StoreKind) -> Result<RepairReport, StoreError> {
        self.with_db(|db| db.repair(kind)).await
    }

    /// Repair every syncable store present in the schema.
    pub async fn repair_all(&self) -> Result<Vec<(StoreKind, RepairReport)>, StoreError> {
        self.with_db(|db| {
            let kinds: Vec<StoreKind> = StoreKind::ALL.into_iter().filter(|kind| db.has_store(*kind)).collect();
            kinds
                .into_iter()
                .map(|kind| db.repair(kind).map(|report| (kind, report)))
                .collect()
        })
        .await
    }

    pub async fn pending_counts(&self) -> PendingCounts {
        let mut inner = self.inner.lock().await;
        let mut counts = PendingCounts::default();
        match inner.db_mut() {
            Ok(db) => {
                for kind in StoreKind::ALL {
                    counts.set(kind, db.pending_count(kind));
                }
            }
            Err(e) => debug!(error = %e, "Pending counts unavailable"),
        }
        counts
    }

    /// Bytes used by records in the syncable stores.
    pub async fn bytes_used(&self) -> u64 {
        let mut inner = self.inner.lock().await;
        inner.db_mut().map(|db| db.records_bytes()).unwrap_or(0)
    }

    // ===== Cache data =====

    pub async fn entry_bytes(&self) -> u64 {
        let mut inner = self.inner.lock().await;
        inner.db_mut().map(|db| db.entries_bytes()).unwrap_or(0)
    }

    pub async fn put_entry(
        &self,
        key: &str,
        value: Value,
        ttl: Option<chrono::Duration>,
    ) -> Result<(), StoreError> {
        let now = now_millis();
        let entry = CacheDataEntry {
            key: key.to_string(),
            value,
            timestamp: now,
            expires: ttl.map(|ttl| now + ttl.num_milliseconds()),
        };
        self.with_db(|db| db.put_entry(entry)).await
    }

    /// The entry under `key`, or `None` if it is missing or expired.
    pub async fn get_entry(&self, key: &str) -> Result<Option<CacheDataEntry>, StoreError> {
        let now = now_millis();
        let entry = self.with_db(|db| db.get_entry(key)).await?;
        Ok(entry.filter(|e| !e.is_expired(now)))
    }

    pub async fn delete_entry(&self, key: &str) -> Result<bool, StoreError> {
        let keys = [key.to_string()];
        self.with_db(|db| db.delete_entries(&keys).map(|n| n > 0)).await
    }

    pub async fn delete_entries(&self, keys: &[String]) -> Result<usize, StoreError> {
        self.with_db(|db| db.delete_entries(keys)).await
    }

    pub async fn entries(&self) -> Result<Vec<CacheDataEntry>, StoreError> {
        self.with_db(|db| db.list_entries()).await
    }

    // ===== Lifecycle =====

    /// Delete and recreate the database at the configured version.
    pub async fn reset(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let options = inner.options.clone();
        let db = inner
            .db
            .as_mut()
            .ok_or_else(|| StoreError::Unavailable("store is closed".to_string()))?;
        db.reset(&options)?;
        if db.is_persistent() {
            inner.mode = StoreMode::Full;
        }
        Ok(())
    }

    /// Release the connection lease. Later operations fail with `Unavailable`.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.db.take().is_some() {
            debug!("Offline database closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ScanData, ScanType};

    fn scan(student: &str) -> NewRecord {
        NewRecord::Attendance {
            scan_type: ScanType::Manual,
            scan_data: ScanData {
                student_id: Some(student.to_string()),
                subject_id: Some("5".to_string()),
                ..ScanData::default()
            },
            timestamp: now_millis(),
        }
    }

    fn v2() -> StoreOptions {
        StoreOptions {
            version: 2,
            ..StoreOptions::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_with_fallback_blocked_upgrade_uses_compat_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old = StoreHandle::open(dir.path(), v2()).expect("open v2");

        let outcome = StoreHandle::open_with_fallback(dir.path(), StoreOptions::default()).await;
        assert_eq!(
            outcome.mode,
            StoreMode::Compat {
                installed: 2,
                requested: 3
            }
        );
        assert!(outcome.mode.notice().is_some());
        assert_eq!(outcome.handle.version().await, Some(2));

        let id = outcome.handle.add_record(scan("42")).await.expect("add in compat mode");
        assert!(outcome.handle.put_entry("k", Value::Null, None).await.is_err());

        assert!(!outcome.handle.retry_upgrade().await.expect("retry"));
        old.close().await;
        assert!(outcome.handle.retry_upgrade().await.expect("retry"));
        assert_eq!(outcome.handle.mode().await, StoreMode::Full);
        assert_eq!(outcome.handle.version().await, Some(3));

        let record = outcome
            .handle
            .get(StoreKind::AttendanceRecords, id)
            .await
            .expect("get")
            .expect("kept across upgrade");
        assert_eq!(record.id(), id);
    }

    #[tokio::test]
    async fn test_two_handles_on_one_directory_keep_each_others_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let daemon = StoreHandle::open(dir.path(), StoreOptions::default()).expect("daemon");
        let first = daemon.add_record(scan("1")).await.expect("daemon add");

        let cli = StoreHandle::open(dir.path(), StoreOptions::default()).expect("cli");
        let second = cli.add_record(scan("2")).await.expect("cli add");
        assert_ne!(first, second);

        // The daemon sees the other connection's record and its write keeps it.
        assert_eq!(daemon.pending_counts().await.attendance, 2);
        daemon.mark_synced(StoreKind::AttendanceRecords, first).await.expect("mark");
        let third = daemon.add_record(scan("3")).await.expect("daemon add");
        assert!(third.0 > second.0);
        cli.close().await;
        daemon.close().await;

        let reopened = StoreHandle::open(dir.path(), StoreOptions::default()).expect("reopen");
        let ids: Vec<RecordId> = reopened
            .records(StoreKind::AttendanceRecords)
            .await
            .expect("records")
            .iter()
            .map(Record::id)
            .collect();
        assert_eq!(ids, vec![first, second, third]);
        let pending: Vec<RecordId> = reopened
            .query_unsynced(StoreKind::AttendanceRecords)
            .await
            .iter()
            .map(Record::id)
            .collect();
        assert_eq!(pending, vec![second, third]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_running_connection_still_blocks_upgrade() {
        let dir = tempfile::tempdir().expect("tempdir");
        let daemon = StoreHandle::open(dir.path(), v2()).expect("open v2");

        // Backdate every lease file as if the daemon had been up for days.
        for entry in std::fs::read_dir(dir.path().join("leases")).expect("leases").flatten() {
            let lease = serde_json::json!({
                "pid": std::process::id(),
                "opened_at": (chrono::Utc::now() - chrono::Duration::days(3)).to_rfc3339(),
            });
            std::fs::write(entry.path(), lease.to_string()).expect("backdate");
        }

        let outcome = StoreHandle::open_with_fallback(dir.path(), StoreOptions::default()).await;
        assert_eq!(
            outcome.mode,
            StoreMode::Compat {
                installed: 2,
                requested: 3
            }
        );
        daemon.close().await;
    }

    #[tokio::test]
    async fn test_open_with_fallback_degrades_to_memory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let not_a_dir = dir.path().join("file");
        std::fs::write(&not_a_dir, b"x").expect("write");

        let outcome = StoreHandle::open_with_fallback(&not_a_dir, StoreOptions::default()).await;
        assert!(matches!(outcome.mode, StoreMode::Degraded { .. }));

        outcome.handle.add_record(scan("1")).await.expect("memory add");
        assert_eq!(outcome.handle.pending_counts().await.attendance, 1);
    }

    #[tokio::test]
    async fn test_retry_upgrade_absorbs_memory_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().join("db");
        let blocker = dir.path().join("db");
        std::fs::write(&blocker, b"x").expect("write");

        let outcome = StoreHandle::open_with_fallback(&data_dir, StoreOptions::default()).await;
        outcome.handle.add_record(scan("1")).await.expect("memory add");

        std::fs::remove_file(&blocker).expect("remove");
        assert!(outcome.handle.retry_upgrade().await.expect("retry"));
        assert_eq!(outcome.handle.mode().await, StoreMode::Full);
        assert_eq!(outcome.handle.pending_counts().await.attendance, 1);

        outcome.handle.close().await;
        let reopened = StoreHandle::open(&data_dir, StoreOptions::default()).expect("reopen");
        assert_eq!(reopened.pending_counts().await.attendance, 1);
    }

    #[tokio::test]
    async fn test_query_unsynced_is_stable_and_shrinks_after_mark() {
        let handle = StoreHandle::in_memory(StoreOptions::default(), "test");
        let a = handle.add_record(scan("1")).await.expect("add");
        let b = handle.add_record(scan("2")).await.expect("add");

        let first = handle.query_unsynced(StoreKind::AttendanceRecords).await;
        let second = handle.query_unsynced(StoreKind::AttendanceRecords).await;
        assert_eq!(first, second);
        assert_eq!(first.iter().map(Record::id).collect::<Vec<_>>(), vec![a, b]);

        handle.mark_synced(StoreKind::AttendanceRecords, a).await.expect("mark");
        let after = handle.query_unsynced(StoreKind::AttendanceRecords).await;
        assert_eq!(after.iter().map(Record::id).collect::<Vec<_>>(), vec![b]);
    }

    #[tokio::test]
    async fn test_repair_all_reports_every_store() {
        let handle = StoreHandle::in_memory(StoreOptions::default(), "test");
        handle.add_record(scan("1")).await.expect("add");
        handle.add_record(scan("2")).await.expect("add");

        let reports = handle.repair_all().await.expect("repair");
        let kinds: Vec<StoreKind> = reports.iter().map(|(kind, _)| *kind).collect();
        assert_eq!(kinds, StoreKind::ALL.to_vec());
        let attendance = reports
            .iter()
            .find(|(kind, _)| *kind == StoreKind::AttendanceRecords)
            .map(|(_, report)| *report);
        assert_eq!(attendance, Some(RepairReport { repaired: 0, total: 2 }));
    }

    #[tokio::test]
    async fn test_closed_store_reports_unavailable() {
        let handle = StoreHandle::in_memory(StoreOptions::default(), "test");
        handle.close().await;
        assert!(matches!(
            handle.add_record(scan("1")).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(handle.query_unsynced(StoreKind::AttendanceRecords).await.is_empty());
    }

    #[tokio::test]
    async fn test_expired_entries_are_hidden() {
        let handle = StoreHandle::in_memory(StoreOptions::default(), "test");
        handle
            .put_entry("user_profile", serde_json::json!({"id": 1}), None)
            .await
            .expect("put");
        handle
            .put_entry("api_subjects", serde_json::json!([]), Some(chrono::Duration::milliseconds(-1)))
            .await
            .expect("put");

        assert!(handle.get_entry("user_profile").await.expect("get").is_some());
        assert!(handle.get_entry("api_subjects").await.expect("get").is_none());
        assert_eq!(handle.entries().await.expect("entries").len(), 2);
    }
}
