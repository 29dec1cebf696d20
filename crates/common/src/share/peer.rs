//! A remote node's session-local view: its last full manifest and the
//! incremental updates received since. "What does this peer have for path
//! X" is answered by scanning updates most-recent-first, then the manifest.
//!
//! Peer records are keyed by peer_id and survive reconnects.

use crate::message::FileEntry;

#[derive(Debug, Default, Clone)]
pub struct Peer {
    pub id: String,
    pub friendly_name: Option<String>,
    manifest: Option<ManifestSnapshot>,
    updates: Vec<FileEntry>,
}

#[derive(Debug, Clone)]
pub struct ManifestSnapshot {
    pub version: f64,
    pub files: Vec<FileEntry>,
}

impl Peer {
    pub fn new(id: &str) -> Self {
        Peer {
            id: id.to_string(),
            ..Default::default()
        }
    }

    pub fn manifest(&self) -> Option<&ManifestSnapshot> {
        self.manifest.as_ref()
    }

    /// Replace the cached manifest and reset the incremental update log.
    pub fn set_manifest(&mut self, version: f64, files: Vec<FileEntry>) {
        self.manifest = Some(ManifestSnapshot { version, files });
        self.updates.clear();
    }

    pub fn push_update(&mut self, entry: FileEntry) {
        self.updates.push(entry);
    }

    /// Most recent knowledge about `path`, updates first.
    pub fn find_file(&self, path: &str) -> Option<&FileEntry> {
        if let Some(entry) = self.updates.iter().rev().find(|e| e.path == path) {
            return Some(entry);
        }
        self.manifest
            .as_ref()
            .and_then(|m| m.files.iter().find(|e| e.path == path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, utime: f64) -> FileEntry {
        FileEntry {
            path: path.into(),
            utime,
            size: Some(1),
            mtime: None,
            mode: None,
            sha256: None,
            id: None,
            key: None,
            deleted: false,
        }
    }

    #[test]
    fn updates_shadow_manifest() {
        let mut peer = Peer::new("p1");
        peer.set_manifest(1.0, vec![entry("a.txt", 10.0)]);
        assert_eq!(peer.find_file("a.txt").unwrap().utime, 10.0);

        peer.push_update(entry("a.txt", 20.0));
        peer.push_update(entry("a.txt", 30.0));
        assert_eq!(peer.find_file("a.txt").unwrap().utime, 30.0);
    }

    #[test]
    fn new_manifest_resets_updates() {
        let mut peer = Peer::new("p1");
        peer.set_manifest(1.0, vec![]);
        peer.push_update(entry("a.txt", 20.0));
        peer.set_manifest(2.0, vec![entry("a.txt", 15.0)]);
        assert_eq!(peer.find_file("a.txt").unwrap().utime, 15.0);
    }
}
