//! Share state: the one mutable resource every session attached to a share
//! reads and writes concurrently.
//!
//! A [`Share`] is internally synchronized — short critical sections behind a
//! parking_lot mutex, never held across I/O — so sessions, the scanner and
//! the hasher can all call into it without external locking. Every visible
//! file mutation bumps the share's version counter and fans out to
//! subscribed sessions (publish/subscribe, not polling).

mod file;
mod keys;
mod peer;
mod shares;
mod store;

pub use file::FileRecord;
pub use keys::{KeyRing, SigningTier, PSK_LEN};
pub use peer::{ManifestSnapshot, Peer};
pub use shares::{IdMatch, Shares};
pub use store::{MemoryStore, Store};

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ed25519_dalek::{SigningKey, VerifyingKey};
use parking_lot::Mutex;

use crate::access::{AccessCode, AccessLevel};

#[derive(Debug, thiserror::Error)]
pub enum ShareError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path escapes the share root: {0}")]
    PathEscape(String),
    #[error("invalid relative path: {0}")]
    InvalidPath(String),
    #[error("invalid key material for {0}")]
    InvalidKey(String),
    #[error("no {0} key at the negotiated access level")]
    MissingKey(String),
    #[error("corrupt persisted record: {0}")]
    Corrupt(String),
}

/// Token returned by [`Share::subscribe`]; pass to `unsubscribe` on
/// session teardown so dead sessions do not accumulate.
pub type SubscriptionId = u64;

struct State {
    peer_id: String,
    version: f64,
    keys: KeyRing,
    access: AccessLevel,
    files: BTreeMap<String, FileRecord>,
    peers: HashMap<String, Arc<Mutex<Peer>>>,
    codes: Vec<AccessCode>,
    subscribers: Vec<(SubscriptionId, flume::Sender<FileRecord>)>,
    next_subscriber: SubscriptionId,
}

struct Inner {
    id: String,
    path: PathBuf,
    /// Canonicalized root, when the directory exists; used by the
    /// symlink-escape guard.
    canonical_root: PathBuf,
    store: Arc<dyn Store>,
    temp_counter: AtomicU64,
    state: Mutex<State>,
}

/// A synchronized directory. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Share {
    inner: Arc<Inner>,
}

fn now_f64() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl Share {
    /// Create a brand-new share rooted at `path`, generating the full key
    /// set. The creating node gets read_write access by construction.
    pub fn create(path: &Path, store: Arc<dyn Store>) -> Result<Self, ShareError> {
        let keys = KeyRing::generate();
        let id = keys
            .share_id()
            .ok_or_else(|| ShareError::MissingKey("read_write psk".into()))?;
        let mut raw = [0u8; 16];
        getrandom::getrandom(&mut raw).expect("failed to generate random bytes");
        let peer_id = hex::encode(raw);
        Self::build(id, path, peer_id, AccessLevel::ReadWrite, keys, store, true)
    }

    /// Materialize a share from key material received in a key exchange.
    pub fn from_keys(
        share_id: &str,
        path: &Path,
        peer_id: &str,
        access: AccessLevel,
        keys: KeyRing,
        store: Arc<dyn Store>,
    ) -> Result<Self, ShareError> {
        Self::build(
            share_id.to_string(),
            path,
            peer_id.to_string(),
            access,
            keys,
            store,
            true,
        )
    }

    /// Reopen a share previously persisted into `store`. Returns `None`
    /// when the store holds no share.
    pub fn open(path: &Path, store: Arc<dyn Store>) -> Result<Option<Self>, ShareError> {
        let Some(keys_raw) = store.get("keys") else {
            return Ok(None);
        };
        let (untrusted, read_only, read_write): (
            crate::message::KeySet,
            crate::message::KeySet,
            crate::message::KeySet,
        ) = serde_json::from_slice(&keys_raw)
            .map_err(|e| ShareError::Corrupt(format!("keys: {e}")))?;
        let keys = KeyRing::from_wire(&untrusted, &read_only, &read_write)?;

        let id = match store.get("share_id") {
            Some(raw) => String::from_utf8(raw).map_err(|_| ShareError::Corrupt("share_id".into()))?,
            None => keys
                .share_id()
                .ok_or_else(|| ShareError::Corrupt("share_id".into()))?,
        };
        let peer_id = store
            .get("peer_id")
            .and_then(|raw| String::from_utf8(raw).ok())
            .ok_or_else(|| ShareError::Corrupt("peer_id".into()))?;
        let access = store
            .get("access")
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or(AccessLevel::ReadWrite);

        let share = Self::build(id, path, peer_id, access, keys, store, false)?;
        {
            let inner = &share.inner;
            let mut state = inner.state.lock();
            for key in inner.store.keys_with_prefix("file/") {
                let raw = inner.store.get(&key).unwrap_or_default();
                let record: FileRecord = serde_json::from_slice(&raw)
                    .map_err(|e| ShareError::Corrupt(format!("{key}: {e}")))?;
                state.files.insert(record.path.clone(), record);
            }
            for key in inner.store.keys_with_prefix("code/") {
                let raw = inner.store.get(&key).unwrap_or_default();
                let code = String::from_utf8(raw)
                    .ok()
                    .and_then(|text| crate::access::AccessCode::parse(&text).ok())
                    .ok_or_else(|| ShareError::Corrupt(key.clone()))?;
                state.codes.push(code);
            }
        }
        Ok(Some(share))
    }

    fn build(
        id: String,
        path: &Path,
        peer_id: String,
        access: AccessLevel,
        keys: KeyRing,
        store: Arc<dyn Store>,
        persist: bool,
    ) -> Result<Self, ShareError> {
        let canonical_root = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if persist {
            store.set("share_id", id.as_bytes());
            store.set("path", path.display().to_string().as_bytes());
            store.set("peer_id", peer_id.as_bytes());
            store.set(
                "access",
                &serde_json::to_vec(&access).expect("access level serializes"),
            );
            store.set(
                "keys",
                &serde_json::to_vec(&keys.to_wire()).expect("key sets serialize"),
            );
            store.flush()?;
        }
        Ok(Share {
            inner: Arc::new(Inner {
                id,
                path: path.to_path_buf(),
                canonical_root,
                store,
                temp_counter: AtomicU64::new(0),
                state: Mutex::new(State {
                    peer_id,
                    version: now_f64(),
                    keys,
                    access,
                    files: BTreeMap::new(),
                    peers: HashMap::new(),
                    codes: Vec::new(),
                    subscribers: Vec::new(),
                    next_subscriber: 0,
                }),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Local filesystem root.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn peer_id(&self) -> String {
        self.inner.state.lock().peer_id.clone()
    }

    pub fn version(&self) -> f64 {
        self.inner.state.lock().version
    }

    pub fn access_level(&self) -> AccessLevel {
        self.inner.state.lock().access
    }

    // --- keys ---

    pub fn psk(&self, level: AccessLevel) -> Option<Vec<u8>> {
        self.inner.state.lock().keys.psk(level).map(|k| k.to_vec())
    }

    pub fn signing_key(&self, level: AccessLevel) -> Option<SigningKey> {
        self.inner.state.lock().keys.signing_key(level).cloned()
    }

    pub fn verifying_key(&self, level: AccessLevel) -> Option<VerifyingKey> {
        self.inner.state.lock().keys.verifying_key(level)
    }

    pub fn keyring(&self) -> KeyRing {
        self.inner.state.lock().keys.clone()
    }

    // --- file records ---

    pub fn file(&self, path: &str) -> Option<FileRecord> {
        self.inner.state.lock().files.get(path).cloned()
    }

    /// Snapshot of every record, in path order.
    pub fn files(&self) -> Vec<FileRecord> {
        self.inner.state.lock().files.values().cloned().collect()
    }

    /// Insert or replace a record, persist it, bump the share version and
    /// notify subscribers.
    pub fn set_file(&self, record: FileRecord) {
        let mut state = self.inner.state.lock();
        self.persist_record(&record);
        state.files.insert(record.path.clone(), record.clone());
        Self::bump(&mut state);
        Self::notify(&mut state, record);
    }

    /// Re-persist and announce the current record for `path`. No-op if the
    /// path is unknown.
    pub fn save(&self, path: &str) {
        let mut state = self.inner.state.lock();
        let Some(record) = state.files.get(path).cloned() else {
            return;
        };
        self.persist_record(&record);
        Self::bump(&mut state);
        Self::notify(&mut state, record);
    }

    fn persist_record(&self, record: &FileRecord) {
        let raw = serde_json::to_vec(record).expect("file record serializes");
        self.inner.store.set(&format!("file/{}", record.path), &raw);
        if let Err(e) = self.inner.store.flush() {
            tracing::warn!(share = %self.inner.id, "failed to flush store: {e}");
        }
    }

    fn bump(state: &mut State) {
        state.version = now_f64().max(state.version + 1e-4);
    }

    fn notify(state: &mut State, record: FileRecord) {
        state
            .subscribers
            .retain(|(_, tx)| tx.send(record.clone()).is_ok());
    }

    // --- subscriptions ---

    /// Subscribe to file-change notifications. Unbounded: subscribers are
    /// sessions that drain promptly or die.
    pub fn subscribe(&self) -> (SubscriptionId, flume::Receiver<FileRecord>) {
        let mut state = self.inner.state.lock();
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        let (tx, rx) = flume::unbounded();
        state.subscribers.push((id, tx));
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner
            .state
            .lock()
            .subscribers
            .retain(|(sub_id, _)| *sub_id != id);
    }

    // --- peers ---

    /// Look up or create the persistent record for a remote peer.
    pub fn peer(&self, peer_id: &str) -> Arc<Mutex<Peer>> {
        let mut state = self.inner.state.lock();
        state
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Peer::new(peer_id))))
            .clone()
    }

    pub fn peers(&self) -> Vec<Arc<Mutex<Peer>>> {
        self.inner.state.lock().peers.values().cloned().collect()
    }

    // --- access codes we have issued ---

    pub fn add_code(&self, code: AccessCode) {
        self.inner
            .store
            .set(&format!("code/{}", code.id()), code.to_string().as_bytes());
        if let Err(e) = self.inner.store.flush() {
            tracing::warn!(share = %self.inner.id, "failed to flush store: {e}");
        }
        self.inner.state.lock().codes.push(code);
    }

    pub fn codes(&self) -> Vec<AccessCode> {
        self.inner.state.lock().codes.clone()
    }

    /// Invalidate a consumed code.
    pub fn delete_code(&self, id: &str) {
        self.inner.store.delete(&format!("code/{id}"));
        if let Err(e) = self.inner.store.flush() {
            tracing::warn!(share = %self.inner.id, "failed to flush store: {e}");
        }
        self.inner.state.lock().codes.retain(|c| c.id() != id);
    }

    // --- paths ---

    /// Absolute path for a relative manifest path, rejecting anything that
    /// tries to step outside the root.
    pub fn full_path(&self, rel: &str) -> Result<PathBuf, ShareError> {
        let rel_path = Path::new(rel);
        if rel.is_empty() || rel_path.is_absolute() {
            return Err(ShareError::InvalidPath(rel.to_string()));
        }
        for component in rel_path.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(ShareError::InvalidPath(rel.to_string())),
            }
        }
        Ok(self.inner.path.join(rel_path))
    }

    /// Symlink-escape guard: the deepest existing ancestor of `full` must
    /// resolve inside the share root. Fatal for the operation, never
    /// silently ignored.
    pub fn check_path(&self, full: &Path) -> Result<(), ShareError> {
        let mut probe = full;
        let resolved = loop {
            match probe.canonicalize() {
                Ok(resolved) => break resolved,
                Err(_) => match probe.parent() {
                    Some(parent) => probe = parent,
                    None => return Err(ShareError::PathEscape(full.display().to_string())),
                },
            }
        };
        if resolved.starts_with(&self.inner.canonical_root) {
            Ok(())
        } else {
            Err(ShareError::PathEscape(full.display().to_string()))
        }
    }

    /// Temp-file sibling for an in-flight download: a dotfile next to the
    /// destination so the change scanner ignores it until the rename.
    pub fn partial_path(&self, full: &Path) -> PathBuf {
        let dir = full.parent().unwrap_or(Path::new("."));
        let name = full
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        let seq = self.inner.temp_counter.fetch_add(1, Ordering::Relaxed);
        dir.join(format!(".{name}.{}.{seq}.!sync", std::process::id()))
    }

    /// Open a file within the share for reading, applying the path guards.
    pub fn open_file(&self, rel: &str) -> Result<std::fs::File, ShareError> {
        let full = self.full_path(rel)?;
        self.check_path(&full)?;
        Ok(std::fs::File::open(full)?)
    }
}

impl std::fmt::Debug for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Share")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .finish()
    }
}
