//! Local file records.
//!
//! A record is never removed from the table: deletion flips the tombstone
//! so the fact of the deletion itself can propagate. `utime` is the logical
//! conflict-resolution clock and only ever moves forward; `mtime` is
//! whatever the filesystem says and carries no ordering meaning.

use serde::{Deserialize, Serialize};

use crate::message::FileEntry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    /// Logical update clock; bumped only by a change this node originated
    /// or accepted.
    pub utime: f64,
    pub size: u64,
    /// Seconds and nanosecond remainder, for sub-second precision.
    pub mtime: (i64, u32),
    /// Octal permission string, e.g. "100644".
    pub mode: String,
    /// None until the hasher has gotten to it.
    pub sha256: Option<String>,
    /// Random and stable across renames. Reserved for move detection.
    pub id: String,
    /// Random per-file secret. Reserved for per-file encryption.
    pub key: String,
    pub deleted: bool,
}

impl FileRecord {
    /// Fresh record for a path we just learned about.
    pub fn create(path: &str) -> Self {
        let mut id = [0u8; 16];
        getrandom::getrandom(&mut id).expect("failed to generate random bytes");
        let mut key = [0u8; 32];
        getrandom::getrandom(&mut key).expect("failed to generate random bytes");
        FileRecord {
            path: path.to_string(),
            utime: 0.0,
            size: 0,
            mtime: (0, 0),
            mode: "100644".to_string(),
            sha256: None,
            id: hex::encode(id),
            key: hex::encode(key),
            deleted: false,
        }
    }

    /// Record the committed on-disk state after a write.
    pub fn commit(&mut self, meta: &std::fs::Metadata) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            self.mode = format!("{:o}", meta.mode());
            self.mtime = (meta.mtime(), meta.mtime_nsec() as u32);
        }
        #[cfg(not(unix))]
        {
            if let Ok(modified) = meta.modified() {
                if let Ok(since) = modified.duration_since(std::time::UNIX_EPOCH) {
                    self.mtime = (since.as_secs() as i64, since.subsec_nanos());
                }
            }
        }
        self.size = meta.len();
        self.deleted = false;
    }

    /// Manifest form of this record. Tombstones carry only path, utime and
    /// id; live files carry the full metadata set.
    pub fn to_entry(&self) -> FileEntry {
        if self.deleted {
            FileEntry {
                path: self.path.clone(),
                utime: self.utime,
                size: None,
                mtime: None,
                mode: None,
                sha256: None,
                id: Some(self.id.clone()),
                key: None,
                deleted: true,
            }
        } else {
            FileEntry {
                path: self.path.clone(),
                utime: self.utime,
                size: Some(self.size),
                mtime: Some(self.mtime),
                mode: Some(self.mode.clone()),
                sha256: self.sha256.clone(),
                id: Some(self.id.clone()),
                key: Some(self.key.clone()),
                deleted: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_records_get_unique_ids() {
        let a = FileRecord::create("x.txt");
        let b = FileRecord::create("x.txt");
        assert_ne!(a.id, b.id);
        assert_ne!(a.key, b.key);
        assert!(!a.deleted);
        assert!(a.sha256.is_none());
    }

    #[test]
    fn tombstone_entry_is_minimal() {
        let mut record = FileRecord::create("gone.txt");
        record.utime = 42.0;
        record.deleted = true;
        let entry = record.to_entry();
        assert!(entry.deleted);
        assert!(entry.size.is_none());
        assert!(entry.sha256.is_none());
        assert_eq!(entry.utime, 42.0);
    }
}
