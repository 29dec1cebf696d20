//! On-disk share persistence.
//!
//! A share's records, keys and codes live in one JSON file under the
//! cirrus directory. Mutations happen in memory; `flush` serializes the
//! whole table and renames it into place, so a crash leaves either the old
//! file or the new one, never a torn write. Values are hex-encoded: the
//! table holds small metadata, not file contents, so legibility beats
//! compactness.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::share::Store;
use parking_lot::Mutex;

/// Where share store files live under the cirrus directory.
pub fn store_dir(dir: &Path) -> PathBuf {
    dir.join("shares")
}

/// Store file for a share configured by local path. Hashing the path keeps
/// the file name stable before the share id is known.
pub fn share_store_path(dir: &Path, share_path: &Path) -> PathBuf {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(share_path.display().to_string().as_bytes());
    store_dir(dir).join(format!("by-path-{}.json", hex::encode(&digest[..8])))
}

pub struct DiskStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl DiskStore {
    /// Open (or create) the store file at `path`.
    pub fn open(path: &Path) -> std::io::Result<Arc<Self>> {
        let entries = match std::fs::read_to_string(path) {
            Ok(text) => {
                let raw: BTreeMap<String, String> = serde_json::from_str(&text)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                let mut entries = BTreeMap::new();
                for (key, value) in raw {
                    let value = hex::decode(&value).map_err(|e| {
                        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
                    })?;
                    entries.insert(key, value);
                }
                entries
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Arc::new(DiskStore {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        }))
    }
}

impl Store for DiskStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &[u8]) {
        self.entries.lock().insert(key.to_string(), value.to_vec());
    }

    fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn flush(&self) -> std::io::Result<()> {
        let raw: BTreeMap<String, String> = self
            .entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), hex::encode(v)))
            .collect();
        let text = serde_json::to_string_pretty(&raw)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp = self.path.with_extension("json.tmp");
        std::fs::write(&temp, text)?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("share.json");
        {
            let store = DiskStore::open(&path).unwrap();
            store.set("peer_id", b"cafebabe");
            store.set("file/a.txt", b"{\"x\":1}");
            store.flush().unwrap();
        }
        let store = DiskStore::open(&path).unwrap();
        assert_eq!(store.get("peer_id").as_deref(), Some(&b"cafebabe"[..]));
        assert_eq!(store.keys_with_prefix("file/"), vec!["file/a.txt"]);
    }

    #[test]
    fn delete_persists_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("share.json");
        let store = DiskStore::open(&path).unwrap();
        store.set("code/abc", b"SYNC123");
        store.flush().unwrap();
        store.delete("code/abc");
        store.flush().unwrap();

        let store = DiskStore::open(&path).unwrap();
        assert!(store.get("code/abc").is_none());
    }

    #[test]
    fn unflushed_changes_are_not_durable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("share.json");
        {
            let store = DiskStore::open(&path).unwrap();
            store.set("k", b"v");
            // No flush.
        }
        let store = DiskStore::open(&path).unwrap();
        assert!(store.get("k").is_none());
    }
}
