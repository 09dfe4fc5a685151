//! Connection leases.
//!
//! Each open connection drops a small file into `<dir>/leases/` and holds an
//! exclusive OS lock on it for as long as the connection lives. A schema
//! upgrade is blocked while another locked lease exists. A lease file nobody
//! holds a lock on belongs to a session that exited without closing and is
//! swept away, however recent it is.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::StoreError;

const LEASE_DIR: &str = "leases";
const LEASE_EXTENSION: &str = "lease";
const PENDING_EXTENSION: &str = "lease.tmp";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub pid: u32,
    pub opened_at: DateTime<Utc>,
    #[serde(skip)]
    pub path: PathBuf,
}

#[derive(Debug)]
pub struct Lease {
    path: PathBuf,
    file: File,
}

impl Lease {
    pub fn acquire(dir: &Path) -> Result<Self, StoreError> {
        let lease_dir = dir.join(LEASE_DIR);
        std::fs::create_dir_all(&lease_dir)?;

        let pid = std::process::id();
        let stem = format!("{}-{:08x}", pid, rand::random::<u32>());
        let pending = lease_dir.join(format!("{}.{}", stem, PENDING_EXTENSION));
        let path = lease_dir.join(format!("{}.{}", stem, LEASE_EXTENSION));

        // Locked before it gets the extension sweepers look at.
        let mut file = OpenOptions::new().create_new(true).write(true).open(&pending)?;
        file.try_lock_exclusive()?;
        let info = LeaseInfo {
            pid,
            opened_at: Utc::now(),
            path: path.clone(),
        };
        file.write_all(&serde_json::to_vec(&info)?)?;
        std::fs::rename(&pending, &path)?;

        debug!(lease = %path.display(), "Acquired connection lease");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(lease = %self.path.display(), error = %e, "Failed to release connection lease");
            }
        } else {
            debug!(lease = %self.path.display(), "Released connection lease");
        }
        let _ = FileExt::unlock(&self.file);
    }
}

/// Whether some open connection still holds the lock on `path`.
fn is_held(path: &Path) -> bool {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(_) => return false,
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            false
        }
        Err(_) => true,
    }
}

/// Live leases in `dir`, excluding `exclude` (the caller's own lease).
pub fn live_leases(dir: &Path, exclude: Option<&Path>) -> Vec<LeaseInfo> {
    let lease_dir = dir.join(LEASE_DIR);
    let entries = match std::fs::read_dir(&lease_dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut live = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let is_lease = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(&format!(".{}", LEASE_EXTENSION)))
            .unwrap_or(false);
        if !is_lease {
            continue;
        }
        if exclude.map(|ex| ex == path).unwrap_or(false) {
            continue;
        }

        if !is_held(&path) {
            debug!(lease = %path.display(), "Removing abandoned connection lease");
            let _ = std::fs::remove_file(&path);
            continue;
        }

        let parsed = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LeaseInfo>(&bytes).ok());
        let mut info = parsed.unwrap_or(LeaseInfo {
            pid: 0,
            opened_at: Utc::now(),
            path: PathBuf::new(),
        });
        info.path = path;
        live.push(info);
    }
    live
}
