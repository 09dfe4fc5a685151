//! The versioned record database.
//!
//! On disk a database is a directory:
//!
//! ```text
//! <dir>/meta.json                 schema name, version, stores and indexes
//! <dir>/<store>.json              one file per record store
//! <dir>/cache_data.json           key/value cache entries
//! <dir>/store.lock                held exclusively during each write
//! <dir>/leases/<pid>-<n>.lease    one per open connection
//! ```
//!
//! Several processes may have the same directory open. Every mutation takes
//! the directory lock, reloads the affected store from disk, applies the
//! change and rewrites the store file atomically (write to a temporary file,
//! then rename). Reads reload any store whose file changed since it was last
//! seen. A `Database` without a directory is the in-memory backend used when
//! the disk store cannot be opened.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fs2::FileExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::models::{
    count_of, date_for_timestamp, is_set, now_millis, value_to_millis, CacheDataEntry, NewRecord,
    Record, RecordId, StoreKind,
};

use super::lease::{live_leases, Lease};
use super::schema::{upgrade, SchemaMeta, StoreSchema, CACHE_DATA_STORE};
use super::table::{row_bytes, IndexKey, Table, TableFile};
use super::{StoreError, StoreOptions};

const META_FILE: &str = "meta.json";
const LOCK_FILE: &str = "store.lock";

/// Modification time and length of a store file, `None` when it does not exist.
type FileStamp = Option<(SystemTime, u64)>;

/// Result of normalizing a store in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub repaired: usize,
    pub total: usize,
}

/// What the cache manager needs to know to decide whether a record may go.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionCandidate {
    pub id: RecordId,
    /// `None` when the stored timestamp is missing or unreadable; such rows are never aged out.
    pub timestamp: Option<i64>,
    pub synced: bool,
    pub retry_count: u32,
    pub bytes: u64,
}

struct Storage {
    dir: PathBuf,
    lease: Lease,
    stamps: HashMap<String, FileStamp>,
}

/// Exclusive lock on `<dir>/store.lock`, released on drop.
struct DirLock(File);

impl DirLock {
    fn acquire(dir: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        file.lock_exclusive()?;
        Ok(Self(file))
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

pub struct Database {
    meta: SchemaMeta,
    tables: BTreeMap<StoreKind, Table>,
    entries: Option<BTreeMap<String, CacheDataEntry>>,
    storage: Option<Storage>,
    quota_bytes: Option<u64>,
}

impl Database {
    /// Open `dir` at `options.version`, creating or upgrading the schema.
    ///
    /// `own_lease` is excluded from the blocking check so that a connection
    /// can retry its own upgrade while still holding the old lease.
    pub fn open(dir: &Path, options: &StoreOptions, own_lease: Option<&Path>) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;

        let installed_meta = read_meta(dir)?;
        let installed = installed_meta.as_ref().map(|m| m.version).unwrap_or(0);
        let requested = options.version;

        if requested < installed {
            return Err(StoreError::VersionTooLow { installed, requested });
        }

        if requested > installed && installed > 0 {
            let holders = live_leases(dir, own_lease);
            if !holders.is_empty() {
                return Err(StoreError::SchemaBlocked {
                    installed,
                    requested,
                    holders: holders.len(),
                });
            }
        }

        let lease = Lease::acquire(dir)?;
        let _lock = DirLock::acquire(dir)?;
        let mut meta = installed_meta.unwrap_or_else(SchemaMeta::empty);
        if requested > installed {
            upgrade(&mut meta, installed, requested);
            write_atomic(&dir.join(META_FILE), &meta)?;
            info!(dir = %dir.display(), from = installed, to = requested, "Upgraded offline database");
        }

        Self::load(dir, meta, lease, options)
    }

    /// Open `dir` at whatever version is installed, without upgrading.
    pub fn open_installed(dir: &Path, options: &StoreOptions) -> Result<Self, StoreError> {
        let meta = read_meta(dir)?
            .ok_or_else(|| StoreError::Unavailable(format!("no database installed in {}", dir.display())))?;
        let lease = Lease::acquire(dir)?;
        debug!(dir = %dir.display(), version = meta.version, "Opened offline database at installed version");
        Self::load(dir, meta, lease, options)
    }

    /// A database that lives only in memory, with the full schema at `options.version`.
    pub fn in_memory(options: &StoreOptions) -> Self {
        let mut meta = SchemaMeta::empty();
        upgrade(&mut meta, 0, options.version);
        let tables = build_tables(&meta, |_| Ok(TableFile::default())).unwrap_or_default();
        let entries = meta.has_store(CACHE_DATA_STORE).then(BTreeMap::new);
        Self {
            meta,
            tables,
            entries,
            storage: None,
            quota_bytes: options.quota_bytes,
        }
    }

    fn load(dir: &Path, meta: SchemaMeta, lease: Lease, options: &StoreOptions) -> Result<Self, StoreError> {
        let mut stamps = HashMap::new();
        let tables = build_tables(&meta, |name| {
            let path = store_path(dir, name);
            stamps.insert(name.to_string(), file_stamp(&path));
            read_json_or_default(&path)
        })?;
        let entries = if meta.has_store(CACHE_DATA_STORE) {
            let path = store_path(dir, CACHE_DATA_STORE);
            stamps.insert(CACHE_DATA_STORE.to_string(), file_stamp(&path));
            let map: BTreeMap<String, CacheDataEntry> = read_json_or_default(&path)?;
            Some(map)
        } else {
            None
        };

        Ok(Self {
            meta,
            tables,
            entries,
            storage: Some(Storage {
                dir: dir.to_path_buf(),
                lease,
                stamps,
            }),
            quota_bytes: options.quota_bytes,
        })
    }

    pub fn version(&self) -> u32 {
        self.meta.version
    }

    pub fn lease_path(&self) -> Option<&Path> {
        self.storage.as_ref().map(|s| s.lease.path())
    }

    pub fn is_persistent(&self) -> bool {
        self.storage.is_some()
    }

    pub fn has_store(&self, kind: StoreKind) -> bool {
        self.tables.contains_key(&kind)
    }

    fn table(&self, kind: StoreKind) -> Result<&Table, StoreError> {
        self.tables
            .get(&kind)
            .ok_or_else(|| StoreError::UnknownStore(kind.store_name().to_string()))
    }

    fn table_mut(&mut self, kind: StoreKind) -> Result<&mut Table, StoreError> {
        self.tables
            .get_mut(&kind)
            .ok_or_else(|| StoreError::UnknownStore(kind.store_name().to_string()))
    }

    fn entries(&self) -> Result<&BTreeMap<String, CacheDataEntry>, StoreError> {
        self.entries
            .as_ref()
            .ok_or_else(|| StoreError::UnknownStore(CACHE_DATA_STORE.to_string()))
    }

    fn entries_mut(&mut self) -> Result<&mut BTreeMap<String, CacheDataEntry>, StoreError> {
        self.entries
            .as_mut()
            .ok_or_else(|| StoreError::UnknownStore(CACHE_DATA_STORE.to_string()))
    }

    fn flush_table(&mut self, kind: StoreKind) -> Result<(), StoreError> {
        if let Some(storage) = &mut self.storage {
            let table = self
                .tables
                .get(&kind)
                .ok_or_else(|| StoreError::UnknownStore(kind.store_name().to_string()))?;
            let path = store_path(&storage.dir, kind.store_name());
            write_atomic(&path, &table.to_file())?;
            storage.stamps.insert(kind.store_name().to_string(), file_stamp(&path));
        }
        Ok(())
    }

    fn flush_entries(&mut self) -> Result<(), StoreError> {
        if let Some(storage) = &mut self.storage {
            let entries = self
                .entries
                .as_ref()
                .ok_or_else(|| StoreError::UnknownStore(CACHE_DATA_STORE.to_string()))?;
            let path = store_path(&storage.dir, CACHE_DATA_STORE);
            write_atomic(&path, entries)?;
            storage.stamps.insert(CACHE_DATA_STORE.to_string(), file_stamp(&path));
        }
        Ok(())
    }

    // ===== Sharing the directory =====

    /// Take the directory lock for one read-modify-write. `None` for memory stores.
    fn lock_dir(&self) -> Result<Option<DirLock>, StoreError> {
        match &self.storage {
            Some(storage) => DirLock::acquire(&storage.dir).map(Some),
            None => Ok(None),
        }
    }

    /// Replace the in-memory copy of `kind` with what is on disk.
    fn reload_table(&mut self, kind: StoreKind) -> Result<(), StoreError> {
        let Some(storage) = &mut self.storage else {
            return Ok(());
        };
        let Some(table) = self.tables.get_mut(&kind) else {
            return Ok(());
        };
        let path = store_path(&storage.dir, kind.store_name());
        let stamp = file_stamp(&path);
        table.reload(read_json_or_default(&path)?);
        storage.stamps.insert(kind.store_name().to_string(), stamp);
        Ok(())
    }

    fn reload_entries(&mut self) -> Result<(), StoreError> {
        let Some(storage) = &mut self.storage else {
            return Ok(());
        };
        let Some(entries) = self.entries.as_mut() else {
            return Ok(());
        };
        let path = store_path(&storage.dir, CACHE_DATA_STORE);
        let stamp = file_stamp(&path);
        *entries = read_json_or_default(&path)?;
        storage.stamps.insert(CACHE_DATA_STORE.to_string(), stamp);
        Ok(())
    }

    /// Reload every store whose file was rewritten by another connection.
    pub fn refresh(&mut self) -> Result<(), StoreError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let changed = |name: &str| {
            let current = file_stamp(&store_path(&storage.dir, name));
            storage.stamps.get(name) != Some(&current)
        };
        let tables: Vec<StoreKind> = self
            .tables
            .keys()
            .copied()
            .filter(|kind| changed(kind.store_name()))
            .collect();
        let entries = self.entries.is_some() && changed(CACHE_DATA_STORE);

        for kind in tables {
            debug!(store = %kind, "Reloading store changed by another connection");
            self.reload_table(kind)?;
        }
        if entries {
            self.reload_entries()?;
        }
        Ok(())
    }

    // ===== Records =====

    /// Serialized size of every record in the syncable stores.
    pub fn records_bytes(&self) -> u64 {
        self.tables.values().map(Table::approx_bytes).sum()
    }

    pub fn add_record(&mut self, record: NewRecord) -> Result<RecordId, StoreError> {
        let kind = record.kind();
        let row = record.into_row();

        let _lock = self.lock_dir()?;
        self.reload_table(kind)?;
        if let Some(quota) = self.quota_bytes {
            let used = self.records_bytes();
            if used + row_bytes(&row) > quota {
                return Err(StoreError::QuotaExceeded { used, quota });
            }
        }

        let id = self.table_mut(kind)?.insert(row);
        if let Err(e) = self.flush_table(kind) {
            self.table_mut(kind)?.remove(id);
            return Err(e);
        }
        debug!(store = %kind, record_id = id, "Stored offline record");
        Ok(RecordId(id))
    }

    pub fn get_record(&self, kind: StoreKind, id: RecordId) -> Result<Option<Record>, StoreError> {
        match self.table(kind)?.get(id.0) {
            Some(row) => decode(kind, row).map(Some),
            None => Ok(None),
        }
    }

    /// Every decodable record in `kind`, in insertion order. Malformed rows are skipped.
    pub fn records(&self, kind: StoreKind) -> Result<Vec<Record>, StoreError> {
        let table = self.table(kind)?;
        Ok(decode_all(kind, table.rows()))
    }

    /// Records with `synced == false`, in insertion order.
    ///
    /// Uses the `synced` index when it covers every row with a boolean key;
    /// otherwise (legacy rows with null or odd `synced` values) scans and filters.
    pub fn query_unsynced(&self, kind: StoreKind) -> Result<Vec<Record>, StoreError> {
        let table = self.table(kind)?;
        let boolean_keys = [IndexKey::Int(0), IndexKey::Int(1)];

        if table.index_is_limited_to("synced", &boolean_keys) {
            if let Some(ids) = table.lookup("synced", &IndexKey::Int(0)) {
                let rows = ids.into_iter().filter_map(|id| table.get(id).map(|row| (id, row)));
                return Ok(decode_all(kind, rows));
            }
        }

        debug!(store = %kind, "synced index incomplete, scanning store");
        let rows = table.rows().filter(|(_, row)| !is_set(row.get("synced")));
        Ok(decode_all(kind, rows))
    }

    pub fn pending_count(&self, kind: StoreKind) -> usize {
        self.table(kind)
            .map(|t| t.rows().filter(|(_, row)| !is_set(row.get("synced"))).count())
            .unwrap_or(0)
    }

    /// Apply `patch` to one row and persist it; the in-memory row is restored if the write fails.
    fn update_row<F>(&mut self, kind: StoreKind, id: RecordId, patch: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let _lock = self.lock_dir()?;
        self.reload_table(kind)?;
        let table = self.table_mut(kind)?;
        let mut row = table
            .get(id.0)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                store: kind.store_name().to_string(),
                id,
            })?;
        match row.as_object_mut() {
            Some(map) => patch(map),
            None => {
                return Err(StoreError::Malformed {
                    store: kind.store_name().to_string(),
                    reason: format!("record {} is not an object", id),
                })
            }
        }

        let old = table.replace(id.0, row);
        if let Err(e) = self.flush_table(kind) {
            if let Some(old) = old {
                self.table_mut(kind)?.restore(id.0, old);
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn mark_synced(&mut self, kind: StoreKind, id: RecordId) -> Result<(), StoreError> {
        let synced_at = chrono::Utc::now().to_rfc3339();
        self.update_row(kind, id, |row| {
            row.insert("synced".to_string(), Value::Bool(true));
            row.insert("synced_at".to_string(), Value::String(synced_at));
            row.remove("next_retry_at");
            row.remove("last_error");
        })
    }

    pub fn record_failure(
        &mut self,
        kind: StoreKind,
        id: RecordId,
        error: &str,
        next_retry_at: Option<i64>,
    ) -> Result<(), StoreError> {
        let now = now_millis();
        let error = error.to_string();
        self.update_row(kind, id, |row| {
            let attempts = count_of(row.get("sync_attempts")) + 1;
            let retries = count_of(row.get("retry_count")) + 1;
            row.insert("sync_attempts".to_string(), Value::from(attempts));
            row.insert("retry_count".to_string(), Value::from(retries));
            row.insert("last_retry".to_string(), Value::from(now));
            row.insert("last_error".to_string(), Value::String(error));
            match next_retry_at {
                Some(at) => row.insert("next_retry_at".to_string(), Value::from(at)),
                None => row.remove("next_retry_at"),
            };
        })
    }

    /// Delete `ids` from `kind` with a single write. Missing ids are ignored.
    pub fn delete_many(&mut self, kind: StoreKind, ids: &[RecordId]) -> Result<usize, StoreError> {
        let _lock = self.lock_dir()?;
        self.reload_table(kind)?;
        let table = self.table_mut(kind)?;
        let removed: Vec<(u64, Value)> = ids
            .iter()
            .filter_map(|id| table.remove(id.0).map(|row| (id.0, row)))
            .collect();
        if removed.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.flush_table(kind) {
            let table = self.table_mut(kind)?;
            for (id, row) in removed {
                table.restore(id, row);
            }
            return Err(e);
        }
        Ok(removed.len())
    }

    pub fn purge_older_than(&mut self, kind: StoreKind, cutoff_ms: i64, only_synced: bool) -> Result<usize, StoreError> {
        let ids: Vec<RecordId> = self
            .eviction_candidates(kind)?
            .into_iter()
            .filter(|c| c.timestamp.map(|ts| ts < cutoff_ms).unwrap_or(false))
            .filter(|c| !only_synced || c.synced)
            .map(|c| c.id)
            .collect();
        self.delete_many(kind, &ids)
    }

    pub fn eviction_candidates(&self, kind: StoreKind) -> Result<Vec<EvictionCandidate>, StoreError> {
        Ok(self
            .table(kind)?
            .rows()
            .map(|(id, row)| EvictionCandidate {
                id: RecordId(id),
                timestamp: row.get("timestamp").and_then(value_to_millis),
                synced: is_set(row.get("synced")),
                retry_count: count_of(row.get("retry_count")),
                bytes: row_bytes(row),
            })
            .collect())
    }

    /// Normalize missing or null fields in place. Never deletes.
    pub fn repair(&mut self, kind: StoreKind) -> Result<RepairReport, StoreError> {
        let _lock = self.lock_dir()?;
        self.reload_table(kind)?;
        let table = self.table_mut(kind)?;
        let total = table.len();
        let mut originals = Vec::new();

        for id in table.ids() {
            let Some(mut row) = table.get(id).cloned() else {
                continue;
            };
            let changed = match row.as_object_mut() {
                Some(map) => normalize_row(kind, map),
                None => false,
            };
            if changed {
                if let Some(old) = table.replace(id, row) {
                    originals.push((id, old));
                }
            }
        }

        let repaired = originals.len();
        if repaired > 0 {
            if let Err(e) = self.flush_table(kind) {
                let table = self.table_mut(kind)?;
                for (id, row) in originals {
                    table.restore(id, row);
                }
                return Err(e);
            }
            info!(store = %kind, repaired, total, "Repaired offline records");
        }
        Ok(RepairReport { repaired, total })
    }

    // ===== Cache data =====

    pub fn entries_bytes(&self) -> u64 {
        self.entries
            .as_ref()
            .map(|e| e.values().map(CacheDataEntry::approx_bytes).sum())
            .unwrap_or(0)
    }

    pub fn put_entry(&mut self, entry: CacheDataEntry) -> Result<(), StoreError> {
        let key = entry.key.clone();
        let _lock = self.lock_dir()?;
        self.reload_entries()?;
        let previous = self.entries_mut()?.insert(key.clone(), entry);
        if let Err(e) = self.flush_entries() {
            let entries = self.entries_mut()?;
            match previous {
                Some(prev) => entries.insert(key, prev),
                None => entries.remove(&key),
            };
            return Err(e);
        }
        Ok(())
    }

    pub fn get_entry(&self, key: &str) -> Result<Option<CacheDataEntry>, StoreError> {
        Ok(self.entries()?.get(key).cloned())
    }

    pub fn list_entries(&self) -> Result<Vec<CacheDataEntry>, StoreError> {
        Ok(self.entries()?.values().cloned().collect())
    }

    pub fn delete_entries(&mut self, keys: &[String]) -> Result<usize, StoreError> {
        let _lock = self.lock_dir()?;
        self.reload_entries()?;
        let entries = self.entries_mut()?;
        let removed: Vec<CacheDataEntry> = keys.iter().filter_map(|k| entries.remove(k)).collect();
        if removed.is_empty() {
            return Ok(0);
        }
        if let Err(e) = self.flush_entries() {
            let entries = self.entries_mut()?;
            for entry in removed {
                entries.insert(entry.key.clone(), entry);
            }
            return Err(e);
        }
        Ok(removed.len())
    }

    // ===== Maintenance =====

    /// Drop every store and recreate the schema at `options.version`.
    pub fn reset(&mut self, options: &StoreOptions) -> Result<(), StoreError> {
        let mut meta = SchemaMeta::empty();
        upgrade(&mut meta, 0, options.version);

        let _lock = self.lock_dir()?;
        if let Some(storage) = &self.storage {
            for name in self.meta.stores.keys().chain(meta.stores.keys()) {
                let path = store_path(&storage.dir, name);
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
            }
            write_atomic(&storage.dir.join(META_FILE), &meta)?;
        }

        self.tables = build_tables(&meta, |_| Ok(TableFile::default()))?;
        self.entries = meta.has_store(CACHE_DATA_STORE).then(BTreeMap::new);
        self.meta = meta;
        for kind in StoreKind::ALL {
            if self.has_store(kind) {
                self.flush_table(kind)?;
            }
        }
        if self.entries.is_some() {
            self.flush_entries()?;
        }
        warn!(version = self.meta.version, "Offline database reset");
        Ok(())
    }

    /// Move every row of `other` into this database. Ids are reassigned.
    pub fn absorb(&mut self, other: &Database) -> Result<usize, StoreError> {
        let _lock = self.lock_dir()?;
        let mut moved = 0;
        for (kind, table) in &other.tables {
            if !self.has_store(*kind) || table.is_empty() {
                continue;
            }
            self.reload_table(*kind)?;
            let target = self.table_mut(*kind)?;
            for (_, row) in table.rows() {
                let mut row = row.clone();
                if let Some(map) = row.as_object_mut() {
                    map.remove("id");
                }
                target.insert(row);
                moved += 1;
            }
            self.flush_table(*kind)?;
        }
        if let Some(theirs) = &other.entries {
            if self.entries.is_some() && !theirs.is_empty() {
                self.reload_entries()?;
                let ours = self.entries_mut()?;
                for (key, entry) in theirs {
                    ours.entry(key.clone()).or_insert_with(|| entry.clone());
                }
                self.flush_entries()?;
            }
        }
        Ok(moved)
    }
}

fn store_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.json", name))
}

fn file_stamp(path: &Path) -> FileStamp {
    let metadata = std::fs::metadata(path).ok()?;
    Some((metadata.modified().ok()?, metadata.len()))
}

fn read_meta(dir: &Path) -> Result<Option<SchemaMeta>, StoreError> {
    let path = dir.join(META_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&contents)?))
}

fn read_json_or_default<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn build_tables<F>(meta: &SchemaMeta, mut load: F) -> Result<BTreeMap<StoreKind, Table>, StoreError>
where
    F: FnMut(&str) -> Result<TableFile, StoreError>,
{
    let mut tables = BTreeMap::new();
    for kind in StoreKind::ALL {
        if let Some(schema) = meta.store(kind.store_name()) {
            let file = load(kind.store_name())?;
            tables.insert(kind, Table::from_file(StoreSchema::clone(schema), file));
        }
    }
    Ok(tables)
}

fn decode(kind: StoreKind, row: &Value) -> Result<Record, StoreError> {
    Record::from_value(kind, row.clone()).map_err(|e| StoreError::Malformed {
        store: kind.store_name().to_string(),
        reason: e.to_string(),
    })
}

fn decode_all<'a, I>(kind: StoreKind, rows: I) -> Vec<Record>
where
    I: Iterator<Item = (u64, &'a Value)>,
{
    rows.filter_map(|(id, row)| match decode(kind, row) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(store = %kind, record_id = id, error = %e, "Skipping malformed record");
            None
        }
    })
    .collect()
}

/// Fill in sync fields and derived attendance fields. Returns true if anything changed.
fn normalize_row(kind: StoreKind, row: &mut Map<String, Value>) -> bool {
    let mut changed = false;

    if !matches!(row.get("synced"), Some(Value::Bool(_))) {
        let synced = is_set(row.get("synced"));
        row.insert("synced".to_string(), Value::Bool(synced));
        changed = true;
    }

    for field in ["sync_attempts", "retry_count"] {
        if !matches!(row.get(field), Some(Value::Number(n)) if n.is_u64()) {
            let count = count_of(row.get(field));
            row.insert(field.to_string(), Value::from(count));
            changed = true;
        }
    }

    if kind == StoreKind::AttendanceRecords {
        let has_date = matches!(row.get("date"), Some(Value::String(s)) if !s.is_empty());
        if !has_date {
            if let Some(ts) = row.get("timestamp").and_then(value_to_millis) {
                row.insert("date".to_string(), Value::String(date_for_timestamp(ts)));
                changed = true;
            }
        }

        if row.get("student_id").map(Value::is_null).unwrap_or(true) {
            let student = row.get("scan_data").and_then(|data| {
                ["student_id", "lrn", "qr_data"]
                    .iter()
                    .filter_map(|field| match data.get(*field) {
                        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                        Some(Value::Number(n)) => Some(n.to_string()),
                        _ => None,
                    })
                    .next()
            });
            if let Some(student) = student {
                row.insert("student_id".to_string(), Value::String(student));
                changed = true;
            }
        }
    }

    changed
}
