//! Opaque persistence interface.
//!
//! Stands in for the append-only key-value log the daemon persists share
//! state into. The core assumes nothing about the on-disk format — only
//! that a value is durable after a successful `flush`.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&self, key: &str, value: &[u8]);
    fn delete(&self, key: &str);
    /// All keys beginning with `prefix`, in lexical order.
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;
    fn flush(&self) -> std::io::Result<()>;
}

/// In-memory store for tests and ephemeral shares.
#[derive(Default, Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
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
        Ok(())
    }
}
