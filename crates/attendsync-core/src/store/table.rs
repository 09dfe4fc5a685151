//! A single auto-increment record store with in-memory secondary indexes.
//!
//! Rows are kept as raw JSON so that fields written by other client
//! versions survive a read-modify-write cycle untouched.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::schema::StoreSchema;

/// On-disk layout of a record store file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableFile {
    #[serde(default)]
    pub next_id: u64,
    #[serde(default)]
    pub rows: BTreeMap<u64, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexKey {
    Int(i64),
    Text(String),
}

impl IndexKey {
    /// Index key for a field value. Null, missing and compound values are not indexed.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(IndexKey::Int(i64::from(*b))),
            Value::Number(n) => n.as_i64().map(IndexKey::Int),
            Value::String(s) => Some(IndexKey::Text(s.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Index {
    entries: BTreeMap<IndexKey, BTreeSet<u64>>,
    covered: usize,
}

#[derive(Debug, Clone)]
pub struct Table {
    schema: StoreSchema,
    next_id: u64,
    rows: BTreeMap<u64, Value>,
    indexes: HashMap<String, Index>,
}

impl Table {
    pub fn new(schema: StoreSchema) -> Self {
        Self::from_file(schema, TableFile::default())
    }

    pub fn from_file(schema: StoreSchema, file: TableFile) -> Self {
        let max_id = file.rows.keys().next_back().copied().unwrap_or(0);
        let mut table = Self {
            indexes: schema
                .indexes
                .iter()
                .map(|name| (name.clone(), Index::default()))
                .collect(),
            schema,
            next_id: file.next_id.max(max_id + 1).max(1),
            rows: BTreeMap::new(),
        };
        for (id, mut row) in file.rows {
            if let Value::Object(ref mut map) = row {
                map.insert("id".to_string(), Value::from(id));
            }
            table.index_row(id, &row);
            table.rows.insert(id, row);
        }
        table
    }

    /// Replace every row with the contents of `file`, rebuilding the indexes.
    pub fn reload(&mut self, file: TableFile) {
        *self = Self::from_file(self.schema.clone(), file);
    }

    pub fn to_file(&self) -> TableFile {
        TableFile {
            next_id: self.next_id,
            rows: self.rows.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Peek at the id the next insert would receive.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn insert(&mut self, mut row: Value) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        if let Value::Object(ref mut map) = row {
            map.insert("id".to_string(), Value::from(id));
        }
        self.index_row(id, &row);
        self.rows.insert(id, row);
        id
    }

    pub fn get(&self, id: u64) -> Option<&Value> {
        self.rows.get(&id)
    }

    pub fn replace(&mut self, id: u64, row: Value) -> Option<Value> {
        let old = self.rows.remove(&id)?;
        self.unindex_row(id, &old);
        self.index_row(id, &row);
        self.rows.insert(id, row);
        Some(old)
    }

    pub fn remove(&mut self, id: u64) -> Option<Value> {
        let old = self.rows.remove(&id)?;
        self.unindex_row(id, &old);
        Some(old)
    }

    /// Re-insert a row under its original id (used to undo a failed write).
    pub fn restore(&mut self, id: u64, row: Value) {
        if let Some(old) = self.rows.remove(&id) {
            self.unindex_row(id, &old);
        }
        self.index_row(id, &row);
        self.rows.insert(id, row);
    }

    pub fn rows(&self) -> impl Iterator<Item = (u64, &Value)> {
        self.rows.iter().map(|(id, row)| (*id, row))
    }

    pub fn ids(&self) -> Vec<u64> {
        self.rows.keys().copied().collect()
    }

    /// Ids whose `index` field equals `key`, in id order. `None` if there is no such index.
    pub fn lookup(&self, index: &str, key: &IndexKey) -> Option<Vec<u64>> {
        let idx = self.indexes.get(index)?;
        Some(
            idx.entries
                .get(key)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default(),
        )
    }

    /// True when every row has an indexed value for `index`.
    pub fn index_covers_all(&self, index: &str) -> bool {
        self.indexes
            .get(index)
            .map(|idx| idx.covered == self.rows.len())
            .unwrap_or(false)
    }

    /// True when every row is indexed under `index` and only with one of `keys`.
    pub fn index_is_limited_to(&self, index: &str, keys: &[IndexKey]) -> bool {
        match self.indexes.get(index) {
            Some(idx) => {
                idx.covered == self.rows.len() && idx.entries.keys().all(|k| keys.contains(k))
            }
            None => false,
        }
    }

    /// Serialized size of all rows.
    pub fn approx_bytes(&self) -> u64 {
        self.rows.values().map(row_bytes).sum()
    }

    fn index_row(&mut self, id: u64, row: &Value) {
        for (field, idx) in self.indexes.iter_mut() {
            if let Some(key) = row.get(field).and_then(IndexKey::from_value) {
                if idx.entries.entry(key).or_default().insert(id) {
                    idx.covered += 1;
                }
            }
        }
    }

    fn unindex_row(&mut self, id: u64, row: &Value) {
        for (field, idx) in self.indexes.iter_mut() {
            if let Some(key) = row.get(field).and_then(IndexKey::from_value) {
                if let Some(ids) = idx.entries.get_mut(&key) {
                    if ids.remove(&id) {
                        idx.covered -= 1;
                    }
                    if ids.is_empty() {
                        idx.entries.remove(&key);
                    }
                }
            }
        }
    }
}

pub fn row_bytes(row: &Value) -> u64 {
    serde_json::to_vec(row).map(|v| v.len() as u64).unwrap_or(0)
}
