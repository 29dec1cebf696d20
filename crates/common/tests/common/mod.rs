//! Shared setup for two-node sync tests: a pair of nodes holding the same
//! share keys, connected over an in-memory duplex stream.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use common::access::AccessLevel;
use common::connection::{self, ConnectionRegistry};
use common::handshake::{self, HandshakeConfig};
use common::share::{MemoryStore, Share, Shares};

pub struct TestNode {
    pub shares: Shares,
    pub share: Share,
    pub dir: tempfile::TempDir,
    pub config: HandshakeConfig,
}

/// Two nodes that both already hold the share's full key set.
pub fn node_pair() -> (TestNode, TestNode) {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let share_a = Share::create(dir_a.path(), Arc::new(MemoryStore::new())).unwrap();
    let share_b = Share::from_keys(
        share_a.id(),
        dir_b.path(),
        "b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0",
        AccessLevel::ReadWrite,
        share_a.keyring(),
        Arc::new(MemoryStore::new()),
    )
    .unwrap();

    let shares_a = Shares::new();
    shares_a.insert(share_a.clone());
    let shares_b = Shares::new();
    shares_b.insert(share_b.clone());

    (
        TestNode {
            shares: shares_a,
            share: share_a,
            dir: dir_a,
            config: HandshakeConfig::new("cirrus test", "alpha"),
        },
        TestNode {
            shares: shares_b,
            share: share_b,
            dir: dir_b,
            config: HandshakeConfig::new("cirrus test", "beta"),
        },
    )
}

/// Connect two nodes and run both sessions in the background. The returned
/// handles end when the connection does.
pub fn connect(
    a: &TestNode,
    b: &TestNode,
    id: &str,
) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
    let (stream_a, stream_b) = tokio::io::duplex(1 << 20);

    let shares_a = a.shares.clone();
    let config_a = a.config.clone();
    let accept = tokio::spawn(async move {
        let auth = handshake::incoming(stream_a, &shares_a, &config_a)
            .await
            .expect("accepting handshake");
        let _ = connection::run(auth, ConnectionRegistry::new()).await;
    });

    let shares_b = b.shares.clone();
    let config_b = b.config.clone();
    let id = id.to_string();
    let dial = tokio::spawn(async move {
        let auth = handshake::outgoing(stream_b, &shares_b, &id, &config_b)
            .await
            .expect("dialing handshake");
        let _ = connection::run(auth, ConnectionRegistry::new()).await;
    });

    (accept, dial)
}

/// Put a file into the node's directory and record it the way the scanner
/// and hasher would have.
pub fn seed_file(node: &TestNode, path: &str, contents: &[u8], utime: f64) {
    let full = node.dir.path().join(path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&full, contents).unwrap();

    let mut record = common::share::FileRecord::create(path);
    record.commit(&std::fs::metadata(&full).unwrap());
    record.utime = utime;
    record.sha256 = Some(hex::encode(Sha256::digest(contents)));
    node.share.set_file(record);
}

/// Poll until `condition` holds, or fail the test after ten seconds.
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Duration::from_secs(10);
    let result = tokio::time::timeout(deadline, async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}
