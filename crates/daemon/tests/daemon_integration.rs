//! Daemon assembly tests: share loading from config, and a full
//! code-redemption sync between two daemons over real TCP loopback.

use std::path::Path;
use std::time::Duration;

use sha2::{Digest, Sha256};

use cirrus_daemon::config::{Config, PendingEntry, ShareEntry, StaticPeer};
use cirrus_daemon::daemon::Daemon;
use cirrus_daemon::store::{share_store_path, DiskStore};
use common::access::{AccessCode, CodeKind};
use common::share::Share;

/// Record a file the way the scanner and hasher would have.
fn seed_file(share: &Share, root: &Path, path: &str, contents: &[u8], utime: f64) {
    let full = root.join(path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&full, contents).unwrap();
    let mut record = common::share::FileRecord::create(path);
    record.commit(&std::fs::metadata(&full).unwrap());
    record.utime = utime;
    record.sha256 = Some(hex::encode(Sha256::digest(contents)));
    share.set_file(record);
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

#[test]
fn daemon_loads_shares_and_pending_codes() {
    let cirrus_dir = tempfile::tempdir().unwrap();
    let share_dir = tempfile::tempdir().unwrap();

    let store = DiskStore::open(&share_store_path(cirrus_dir.path(), share_dir.path())).unwrap();
    let created = Share::create(share_dir.path(), store).unwrap();
    let share_id = created.id().to_string();
    drop(created);

    let code = AccessCode::create(CodeKind::Long);
    let mut config = Config::default();
    config.shares.push(ShareEntry {
        path: share_dir.path().to_path_buf(),
    });
    config.pending.push(PendingEntry {
        code: code.to_string(),
        path: share_dir.path().join("elsewhere"),
    });

    let daemon = Daemon::new(cirrus_dir.path(), config).unwrap();
    assert!(daemon.shares().get(&share_id).is_some());
    assert_eq!(daemon.shares().pending().len(), 1);
    // Both the share and the pending code are dialable identities.
    assert_eq!(daemon.shares().advertised().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn code_redemption_and_sync_between_two_daemons() {
    let dir_a = tempfile::tempdir().unwrap();
    let share_a_root = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let joined_root = tempfile::tempdir().unwrap();

    // Node A: a share with one file and an issued access code.
    let store = DiskStore::open(&share_store_path(dir_a.path(), share_a_root.path())).unwrap();
    let share_a = Share::create(share_a_root.path(), store).unwrap();
    seed_file(
        &share_a,
        share_a_root.path(),
        "notes/plan.txt",
        b"rendezvous at dawn",
        42.0,
    );
    let code = AccessCode::create(CodeKind::Long);
    share_a.add_code(code.clone());
    let share_a_id = share_a.id().to_string();
    drop(share_a);

    let mut config_a = Config::default();
    config_a.listen_port = 44721;
    config_a.friendly_name = "alpha".to_string();
    config_a.shares.push(ShareEntry {
        path: share_a_root.path().to_path_buf(),
    });

    // Node B: holds only the code and a static pointer at A.
    let joined_path = joined_root.path().join("share");
    let mut config_b = Config::default();
    config_b.listen_port = 44722;
    config_b.friendly_name = "beta".to_string();
    config_b.pending.push(PendingEntry {
        code: code.to_string(),
        path: joined_path.clone(),
    });
    config_b.peers.push(StaticPeer {
        address: "127.0.0.1".to_string(),
        port: 44721,
    });

    let daemon_a = Daemon::new(dir_a.path(), config_a).unwrap();
    let daemon_b = Daemon::new(dir_b.path(), config_b).unwrap();
    let run_a = tokio::spawn(daemon_a.run());
    // A must be listening before B's first (and only prompt) announcement.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let run_b = tokio::spawn(daemon_b.run());

    wait_for("file to sync into the joined share", || {
        std::fs::read(joined_path.join("notes/plan.txt"))
            .map(|data| data == b"rendezvous at dawn")
            .unwrap_or(false)
    })
    .await;

    run_a.abort();
    run_b.abort();

    // The materialized share persisted; a fresh daemon finds it by its
    // store file alone, with no config entry at all.
    let reborn = Daemon::new(dir_b.path(), Config::default()).unwrap();
    let share = reborn.shares().get(&share_a_id).expect("share reloaded");
    assert_eq!(share.path(), joined_path);
    assert!(share.file("notes/plan.txt").is_some());
}
