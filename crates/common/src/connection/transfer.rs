//! Receiving file content.
//!
//! Bytes stream into a dotfile sibling of the destination while a running
//! SHA-256 is computed; only a payload whose digest matches the claimed
//! hash is committed, with a single atomic rename. A mismatch (the sender's
//! copy changed mid-transfer, or corruption) discards the temp file and
//! leaves local state untouched; the next manifest round will retry.

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::message::{FileEntry, MessageReader};
use crate::share::Share;
use crate::transport::Transport;

use super::{update, SessionError};

/// Drain the binary payload of a `file_data` message into the share,
/// verifying it against `entry`'s claimed hash. Returns whether the file
/// was committed.
pub(super) async fn receive_file<T: Transport>(
    share: &Share,
    reader: &mut MessageReader<T>,
    entry: &FileEntry,
) -> Result<bool, SessionError> {
    let full = share.full_path(&entry.path)?;
    share.check_path(&full)?;
    if let Some(parent) = full.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp = share.partial_path(&full);
    let mut out = tokio::fs::File::create(&temp).await?;
    let mut hasher = Sha256::new();
    let mut received: u64 = 0;

    let write_result: Result<(), SessionError> = async {
        while let Some(chunk) = reader.read_chunk().await? {
            hasher.update(&chunk);
            out.write_all(&chunk).await?;
            received += chunk.len() as u64;
        }
        out.flush().await?;
        Ok(())
    }
    .await;

    if let Err(e) = write_result {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e);
    }

    let digest = hex::encode(hasher.finalize());
    if entry.sha256.as_deref() != Some(digest.as_str()) {
        tracing::warn!(
            path = %entry.path,
            expected = entry.sha256.as_deref().unwrap_or("?"),
            got = %digest,
            "downloaded content does not match claimed hash, discarding"
        );
        let _ = tokio::fs::remove_file(&temp).await;
        return Ok(false);
    }
    drop(out);

    update::apply_metadata(&temp, entry);

    // Record first, rename second: the scanner that notices the rename
    // finds a record that already matches.
    let mut record = share
        .file(&entry.path)
        .unwrap_or_else(|| crate::share::FileRecord::create(&entry.path));
    record.utime = entry.utime;
    record.deleted = false;
    record.size = received;
    record.sha256 = Some(digest);
    if let Some(mtime) = entry.mtime {
        record.mtime = mtime;
    }
    if let Some(mode) = &entry.mode {
        record.mode = mode.clone();
    }
    if let Some(id) = &entry.id {
        record.id = id.clone();
    }
    if let Some(key) = &entry.key {
        record.key = key.clone();
    }
    share.set_file(record);

    tokio::fs::rename(&temp, &full).await?;
    update::commit_disk_state(share, &entry.path, &full);

    tracing::debug!(path = %entry.path, bytes = received, "file committed");
    Ok(true)
}
