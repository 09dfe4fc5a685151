//! Named buckets of captured HTTP responses.
//!
//! Layout on disk:
//!
//! ```text
//! <root>/<bucket>/index.json   metadata for every entry in the bucket
//! <root>/<bucket>/<n>.body     raw response body
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub key: RequestKey,
    pub captured_at: DateTime<Utc>,
    pub size: u64,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    file: String,
}

impl CachedResponse {
    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.captured_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        crate::utils::format_age(self.captured_at)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BucketIndex {
    #[serde(default)]
    next_file: u64,
    #[serde(default)]
    entries: Vec<CachedResponse>,
}

struct Inner {
    root: PathBuf,
    lock: Mutex<()>,
}

/// On-disk response cache. Clone is cheap and clones share one lock.
#[derive(Clone)]
pub struct ResponseCache {
    inner: Arc<Inner>,
}

impl ResponseCache {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create response cache at {}", root.display()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                root,
                lock: Mutex::new(()),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.inner.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket.starts_with('.') {
            bail!("Invalid cache bucket name: {:?}", bucket);
        }
        Ok(self.inner.root.join(bucket))
    }

    fn load_index(&self, dir: &Path) -> Result<BucketIndex> {
        let path = dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(BucketIndex::default());
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read cache index: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse cache index: {}", path.display()))
    }

    fn save_index(&self, dir: &Path, index: &BucketIndex) -> Result<()> {
        let contents = serde_json::to_string_pretty(index)?;
        std::fs::write(dir.join(INDEX_FILE), contents)?;
        Ok(())
    }

    /// Names of every bucket on disk, sorted.
    pub fn bucket_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.inner.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn put(&self, bucket: &str, key: &RequestKey, status: u16, content_type: Option<&str>, body: &[u8]) -> Result<()> {
        self.put_at(bucket, key, status, content_type, body, Utc::now())
    }

    /// Store a response with an explicit capture time.
    pub fn put_at(
        &self,
        bucket: &str,
        key: &RequestKey,
        status: u16,
        content_type: Option<&str>,
        body: &[u8],
        captured_at: DateTime<Utc>,
    ) -> Result<()> {
        let dir = self.bucket_dir(bucket)?;
        let _guard = self.guard();
        std::fs::create_dir_all(&dir)?;
        let mut index = self.load_index(&dir)?;

        if let Some(pos) = index.entries.iter().position(|e| &e.key == key) {
            let old = index.entries.remove(pos);
            let _ = std::fs::remove_file(dir.join(&old.file));
        }

        let file = format!("{}.body", index.next_file);
        index.next_file += 1;
        std::fs::write(dir.join(&file), body)
            .with_context(|| format!("Failed to write cached body for {}", key.url))?;
        index.entries.push(CachedResponse {
            key: key.clone(),
            captured_at,
            size: body.len() as u64,
            status,
            content_type: content_type.map(str::to_string),
            file,
        });
        self.save_index(&dir, &index)?;
        debug!(bucket = bucket, url = %key.url, size = body.len(), "Cached response");
        Ok(())
    }

    pub fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<(CachedResponse, Vec<u8>)>> {
        let dir = self.bucket_dir(bucket)?;
        let _guard = self.guard();
        let index = self.load_index(&dir)?;
        match index.entries.into_iter().find(|e| &e.key == key) {
            Some(meta) => {
                let body = std::fs::read(dir.join(&meta.file))
                    .with_context(|| format!("Failed to read cached body for {}", key.url))?;
                Ok(Some((meta, body)))
            }
            None => Ok(None),
        }
    }

    /// Entries in `bucket`, oldest first.
    pub fn entries(&self, bucket: &str) -> Result<Vec<CachedResponse>> {
        let dir = self.bucket_dir(bucket)?;
        let _guard = self.guard();
        let mut entries = self.load_index(&dir)?.entries;
        entries.sort_by_key(|e| e.captured_at);
        Ok(entries)
    }

    pub fn delete(&self, bucket: &str, key: &RequestKey) -> Result<bool> {
        let dir = self.bucket_dir(bucket)?;
        let _guard = self.guard();
        let mut index = self.load_index(&dir)?;
        let Some(pos) = index.entries.iter().position(|e| &e.key == key) else {
            return Ok(false);
        };
        let removed = index.entries.remove(pos);
        self.save_index(&dir, &index)?;
        let body = dir.join(&removed.file);
        if body.exists() {
            std::fs::remove_file(&body)
                .with_context(|| format!("Failed to delete cached body {}", body.display()))?;
        }
        Ok(true)
    }

    pub fn delete_bucket(&self, bucket: &str) -> Result<bool> {
        let dir = self.bucket_dir(bucket)?;
        let _guard = self.guard();
        if !dir.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&dir)
            .with_context(|| format!("Failed to delete cache bucket {}", bucket))?;
        debug!(bucket = bucket, "Deleted cache bucket");
        Ok(true)
    }

    pub fn bucket_bytes(&self, bucket: &str) -> Result<u64> {
        Ok(self.entries(bucket)?.iter().map(|e| e.size).sum())
    }

    /// Total body bytes across every bucket.
    pub fn bytes_used(&self) -> Result<u64> {
        let mut total = 0;
        for bucket in self.bucket_names()? {
            total += self.bucket_bytes(&bucket)?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn cache() -> (tempfile::TempDir, ResponseCache) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ResponseCache::new(dir.path().join("responses")).expect("cache");
        (dir, cache)
    }

    #[test]
    fn test_put_get_and_replace() {
        let (_dir, cache) = cache();
        let key = RequestKey::get("https://school.test/api/check-version.php");
        cache.put("kes-smart-api-v1", &key, 200, Some("application/json"), b"{\"version\":\"1\"}")
            .expect("put");
        cache.put("kes-smart-api-v1", &key, 200, Some("application/json"), b"{\"version\":\"2\"}")
            .expect("put");

        let (meta, body) = cache.get("kes-smart-api-v1", &key).expect("get").expect("hit");
        assert_eq!(body, b"{\"version\":\"2\"}");
        assert_eq!(meta.size, body.len() as u64);
        assert_eq!(cache.entries("kes-smart-api-v1").expect("entries").len(), 1);
        assert_eq!(meta.age_display(), "just now");
    }

    #[test]
    fn test_entries_are_oldest_first() {
        let (_dir, cache) = cache();
        let now = Utc::now();
        cache.put_at("b", &RequestKey::get("/new"), 200, None, b"n", now).expect("put");
        cache.put_at("b", &RequestKey::get("/old"), 200, None, b"o", now - Duration::days(3)).expect("put");

        let urls: Vec<String> = cache.entries("b").expect("entries").into_iter().map(|e| e.key.url).collect();
        assert_eq!(urls, vec!["/old", "/new"]);
    }

    #[test]
    fn test_bytes_and_bucket_deletion() {
        let (_dir, cache) = cache();
        cache.put("a", &RequestKey::get("/1"), 200, None, &[0u8; 100]).expect("put");
        cache.put("b", &RequestKey::get("/2"), 200, None, &[0u8; 50]).expect("put");
        assert_eq!(cache.bytes_used().expect("bytes"), 150);
        assert_eq!(cache.bucket_names().expect("names"), vec!["a", "b"]);

        assert!(cache.delete_bucket("a").expect("delete"));
        assert!(!cache.delete_bucket("a").expect("delete"));
        assert_eq!(cache.bytes_used().expect("bytes"), 50);
    }

    #[test]
    fn test_rejects_path_like_bucket_names() {
        let (_dir, cache) = cache();
        assert!(cache.put("../escape", &RequestKey::get("/"), 200, None, b"x").is_err());
    }
}
