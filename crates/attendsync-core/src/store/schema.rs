//! Schema metadata and the version migration callback.
//!
//! Version history:
//! - v1: `login_attempts`, `attendance_records` (indexes `student_id`, `timestamp`)
//! - v2: `form_submissions`, legacy `sync_queue`
//! - v3: `cache_data`; `synced`, `scan_type` and `date` indexes on attendance
//!
//! Migrations only ever add stores and indexes. Nothing is dropped, so a
//! database written by a newer schema stays readable by an older one.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::info;

/// Database name recorded in the metadata file.
pub const DATABASE_NAME: &str = "kes-smart-offline-data";

/// Schema version this build creates and upgrades to.
pub const CURRENT_VERSION: u32 = 3;

pub const CACHE_DATA_STORE: &str = "cache_data";

/// Retry queue from the v2 schema. Created for compatibility and never read.
pub const LEGACY_SYNC_QUEUE_STORE: &str = "sync_queue";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSchema {
    pub name: String,
    pub key_path: String,
    pub auto_increment: bool,
    #[serde(default)]
    pub indexes: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMeta {
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub stores: BTreeMap<String, StoreSchema>,
}

impl SchemaMeta {
    pub fn empty() -> Self {
        Self {
            name: DATABASE_NAME.to_string(),
            version: 0,
            stores: BTreeMap::new(),
        }
    }

    pub fn has_store(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    pub fn store(&self, name: &str) -> Option<&StoreSchema> {
        self.stores.get(name)
    }

    fn ensure_store(&mut self, name: &str, key_path: &str, auto_increment: bool, changes: &mut Vec<String>) {
        if !self.stores.contains_key(name) {
            self.stores.insert(
                name.to_string(),
                StoreSchema {
                    name: name.to_string(),
                    key_path: key_path.to_string(),
                    auto_increment,
                    indexes: BTreeSet::new(),
                },
            );
            changes.push(format!("created store {}", name));
        }
    }

    fn ensure_index(&mut self, store: &str, index: &str, changes: &mut Vec<String>) {
        if let Some(schema) = self.stores.get_mut(store) {
            if schema.indexes.insert(index.to_string()) {
                changes.push(format!("created index {}.{}", store, index));
            }
        }
    }
}

/// Bring `meta` from `old` to `new`, returning a description of every change made.
pub fn upgrade(meta: &mut SchemaMeta, old: u32, new: u32) -> Vec<String> {
    let mut changes = Vec::new();

    for version in (old + 1)..=new {
        match version {
            1 => {
                meta.ensure_store("login_attempts", "id", true, &mut changes);
                meta.ensure_index("login_attempts", "username", &mut changes);
                meta.ensure_index("login_attempts", "timestamp", &mut changes);

                meta.ensure_store("attendance_records", "id", true, &mut changes);
                meta.ensure_index("attendance_records", "student_id", &mut changes);
                meta.ensure_index("attendance_records", "timestamp", &mut changes);
            }
            2 => {
                meta.ensure_store("form_submissions", "id", true, &mut changes);
                meta.ensure_index("form_submissions", "form_type", &mut changes);
                meta.ensure_index("form_submissions", "timestamp", &mut changes);
                meta.ensure_index("form_submissions", "synced", &mut changes);

                meta.ensure_store(LEGACY_SYNC_QUEUE_STORE, "id", true, &mut changes);
                meta.ensure_index(LEGACY_SYNC_QUEUE_STORE, "timestamp", &mut changes);
            }
            3 => {
                meta.ensure_store(CACHE_DATA_STORE, "key", false, &mut changes);
                meta.ensure_index(CACHE_DATA_STORE, "timestamp", &mut changes);
                meta.ensure_index(CACHE_DATA_STORE, "expires", &mut changes);

                meta.ensure_index("attendance_records", "synced", &mut changes);
                meta.ensure_index("attendance_records", "scan_type", &mut changes);
                meta.ensure_index("attendance_records", "date", &mut changes);
                meta.ensure_index("login_attempts", "synced", &mut changes);
            }
            _ => {}
        }
    }

    if new > meta.version {
        meta.version = new;
    }

    for change in &changes {
        info!(from = old, to = new, "Schema migration: {}", change);
    }
    changes
}
