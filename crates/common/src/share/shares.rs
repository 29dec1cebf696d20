//! Registry of every share this node participates in, plus the access
//! codes we are waiting to redeem.
//!
//! The handshake resolves an incoming `id` three ways: a share we hold, a
//! code we issued (peer will request our keys), or a code we are holding
//! (peer will send us keys). [`Shares::find_id`] is that resolution.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Share;
use crate::access::{AccessCode, PendingCode};

/// Resolution of a handshake `id` against local state.
#[derive(Debug, Clone)]
pub enum IdMatch {
    /// A share we already hold.
    Share(Share),
    /// An unredeemed code we issued for one of our shares.
    Code { share: Share, code: AccessCode },
    /// A code we hold, waiting for a peer to hand us the share's keys.
    Pending(PendingCode),
}

#[derive(Default)]
struct SharesState {
    by_id: HashMap<String, Share>,
    pending: Vec<PendingCode>,
}

/// Cheaply clonable handle to the node-wide share table.
#[derive(Clone, Default)]
pub struct Shares {
    state: Arc<Mutex<SharesState>>,
}

impl Shares {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, share: Share) {
        self.state
            .lock()
            .by_id
            .insert(share.id().to_string(), share);
    }

    pub fn get(&self, id: &str) -> Option<Share> {
        self.state.lock().by_id.get(id).cloned()
    }

    pub fn all(&self) -> Vec<Share> {
        self.state.lock().by_id.values().cloned().collect()
    }

    /// Start waiting on a code someone gave us; `path` is where the share
    /// will be rooted once its keys arrive.
    pub fn add_pending(&self, code: AccessCode, path: PathBuf) -> PendingCode {
        let pending = PendingCode::new(code, path);
        self.state.lock().pending.push(pending.clone());
        pending
    }

    pub fn pending(&self) -> Vec<PendingCode> {
        self.state.lock().pending.clone()
    }

    /// Consume a pending code once its key exchange completed.
    pub fn remove_pending(&self, id: &str) {
        self.state.lock().pending.retain(|p| p.id() != id);
    }

    /// Every identity worth announcing or connecting for: share ids plus
    /// ids of codes, each with the peer_id to use on that channel.
    pub fn advertised(&self) -> Vec<(String, String)> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for share in state.by_id.values() {
            out.push((share.id().to_string(), share.peer_id()));
            for code in share.codes() {
                out.push((code.id(), share.peer_id()));
            }
        }
        for pending in &state.pending {
            out.push((pending.id(), pending.peer_id().to_string()));
        }
        out
    }

    /// Resolve a handshake `id` to the strongest local match.
    pub fn find_id(&self, id: &str) -> Option<IdMatch> {
        let state = self.state.lock();
        if let Some(share) = state.by_id.get(id) {
            return Some(IdMatch::Share(share.clone()));
        }
        for share in state.by_id.values() {
            if let Some(code) = share.codes().into_iter().find(|c| c.id() == id) {
                return Some(IdMatch::Code {
                    share: share.clone(),
                    code,
                });
            }
        }
        state
            .pending
            .iter()
            .find(|p| p.id() == id)
            .map(|p| IdMatch::Pending(p.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::CodeKind;
    use crate::share::MemoryStore;

    fn temp_share() -> (Share, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let share = Share::create(dir.path(), Arc::new(MemoryStore::new())).unwrap();
        (share, dir)
    }

    #[test]
    fn find_id_prefers_share_then_code_then_pending() {
        let shares = Shares::new();
        let (share, _dir) = temp_share();
        let code = AccessCode::create(CodeKind::Long);
        let code_id = code.id();
        share.add_code(code);
        shares.insert(share.clone());

        let other = AccessCode::create(CodeKind::Short);
        let other_id = other.id();
        shares.add_pending(other, PathBuf::from("/tmp/elsewhere"));

        assert!(matches!(
            shares.find_id(share.id()),
            Some(IdMatch::Share(_))
        ));
        assert!(matches!(
            shares.find_id(&code_id),
            Some(IdMatch::Code { .. })
        ));
        assert!(matches!(
            shares.find_id(&other_id),
            Some(IdMatch::Pending(_))
        ));
        assert!(shares.find_id("deadbeef").is_none());
    }

    #[test]
    fn advertised_lists_shares_codes_and_pending() {
        let shares = Shares::new();
        let (share, _dir) = temp_share();
        share.add_code(AccessCode::create(CodeKind::Long));
        shares.insert(share.clone());
        shares.add_pending(AccessCode::create(CodeKind::Short), PathBuf::from("/tmp/x"));

        let ids: Vec<String> = shares.advertised().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&share.id().to_string()));
    }

    #[test]
    fn remove_pending_consumes_the_code() {
        let shares = Shares::new();
        let code = AccessCode::create(CodeKind::Short);
        let id = code.id();
        shares.add_pending(code, PathBuf::from("/tmp/x"));
        assert_eq!(shares.pending().len(), 1);
        shares.remove_pending(&id);
        assert!(shares.pending().is_empty());
    }
}
