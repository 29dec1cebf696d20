//! Applying remote file updates to local state.
//!
//! An update is a claim: "at logical time `utime`, path X looked like
//! this." The rules here decide whether to accept the claim, and in what
//! order to touch the record table versus the filesystem. The record is
//! always written before the filesystem syscall so the change scanner,
//! seeing the syscall's effect, finds matching metadata and stays quiet
//! instead of echoing the change back out.

use std::fs;
use std::path::Path;

use filetime::FileTime;

use crate::message::FileEntry;
use crate::share::{FileRecord, Share};

use super::SessionError;

/// What became of one received update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Record and filesystem now reflect the update.
    Applied,
    /// The update was stale or irrelevant; nothing changed.
    Ignored,
    /// Metadata recorded, but the file's contents must be fetched before
    /// the update is complete.
    NeedsContent,
}

/// True when `entry` describes content we do not have on disk.
pub fn need_file(share: &Share, entry: &FileEntry) -> bool {
    if entry.deleted {
        return false;
    }
    let Some(remote_sha) = &entry.sha256 else {
        // The remote hasher has not hashed it yet; nothing to fetch.
        return false;
    };
    match share.file(&entry.path) {
        None => true,
        Some(local) => {
            if local.utime >= entry.utime {
                return false;
            }
            local.deleted || local.sha256.as_deref() != Some(remote_sha.as_str())
        }
    }
}

/// Apply one update claim against local state.
pub fn apply(share: &Share, entry: &FileEntry) -> Result<UpdateOutcome, SessionError> {
    let local = share.file(&entry.path);

    // Stale claim: our knowledge is at least as recent.
    if let Some(local) = &local {
        if local.utime >= entry.utime {
            return Ok(UpdateOutcome::Ignored);
        }
    }

    if entry.deleted {
        return apply_tombstone(share, entry, local);
    }

    let full = share.full_path(&entry.path)?;
    share.check_path(&full)?;

    // Empty files carry no content to fetch; create them outright.
    if entry.size == Some(0) {
        let mut record = merge_record(local, entry);
        record.sha256 = entry.sha256.clone();
        share.set_file(record);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::File::create(&full)?;
        apply_metadata(&full, entry);
        commit_disk_state(share, &entry.path, &full);
        return Ok(UpdateOutcome::Applied);
    }

    let same_content = match (&local, &entry.sha256) {
        (Some(local), Some(remote_sha)) => {
            !local.deleted && local.sha256.as_deref() == Some(remote_sha.as_str())
        }
        _ => false,
    };

    if same_content {
        // Metadata-only change: accept the claim, then make the disk match.
        let record = merge_record(local, entry);
        share.set_file(record);
        apply_metadata(&full, entry);
        return Ok(UpdateOutcome::Applied);
    }

    // Content differs (or the file is new): record what we know, fetch the
    // rest. The record keeps its old sha256 until verified bytes land, so a
    // crash mid-download never claims content we do not have.
    if need_file(share, entry) {
        return Ok(UpdateOutcome::NeedsContent);
    }
    Ok(UpdateOutcome::Ignored)
}

fn apply_tombstone(
    share: &Share,
    entry: &FileEntry,
    local: Option<FileRecord>,
) -> Result<UpdateOutcome, SessionError> {
    let Some(mut record) = local else {
        // Deletion of a file we never knew about: record the tombstone so
        // the fact still propagates, but there is nothing to unlink.
        let mut record = FileRecord::create(&entry.path);
        if let Some(id) = &entry.id {
            record.id = id.clone();
        }
        record.utime = entry.utime;
        record.deleted = true;
        share.set_file(record);
        return Ok(UpdateOutcome::Applied);
    };

    record.utime = entry.utime;
    record.deleted = true;
    record.sha256 = None;
    share.set_file(record);

    let full = share.full_path(&entry.path)?;
    share.check_path(&full)?;
    match fs::remove_file(&full) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(UpdateOutcome::Applied)
}

/// Build the local record for an accepted claim, preserving the stable id
/// and per-file key when we already had one.
fn merge_record(local: Option<FileRecord>, entry: &FileEntry) -> FileRecord {
    let mut record = local.unwrap_or_else(|| FileRecord::create(&entry.path));
    record.utime = entry.utime;
    record.deleted = false;
    if let Some(size) = entry.size {
        record.size = size;
    }
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
    record
}

/// Push the claimed mtime and mode onto the file on disk. Failures here
/// are logged, not fatal: the content is right, the metadata lags.
pub(super) fn apply_metadata(full: &Path, entry: &FileEntry) {
    if let Some((secs, nanos)) = entry.mtime {
        let mtime = FileTime::from_unix_time(secs, nanos);
        if let Err(e) = filetime::set_file_mtime(full, mtime) {
            tracing::warn!(path = %full.display(), "failed to set mtime: {e}");
        }
    }
    #[cfg(unix)]
    if let Some(mode) = &entry.mode {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(bits) = u32::from_str_radix(mode, 8) {
            let perms = fs::Permissions::from_mode(bits & 0o7777);
            if let Err(e) = fs::set_permissions(full, perms) {
                tracing::warn!(path = %full.display(), "failed to set mode: {e}");
            }
        }
    }
}

/// Fold the real on-disk metadata back into the record after a write, so
/// the record describes what a scanner would observe.
pub(super) fn commit_disk_state(share: &Share, path: &str, full: &Path) {
    if let (Some(mut record), Ok(meta)) = (share.file(path), fs::metadata(full)) {
        record.commit(&meta);
        share.set_file(record);
    }
}
