//! The per-log sync controller.
//!
//! One run walks IDLE → FETCH_STH → VERIFY_CONSISTENCY → SYNC → COMMIT. Any
//! verification failure aborts the run before the trusted STH moves, so the
//! archive always reflects the last fully verified tree. The controller owns
//! the trusted-STH file and the shard directory for the duration of a run;
//! an advisory lockfile keeps concurrent runs off the same archive root.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::LogTransport;
use crate::entry::Entry;
use crate::error::MirrorError;
use crate::logs::LogDescriptor;
use crate::merkle::{verify_consistency, TreeBuilder};
use crate::pipeline::fetch_ordered;
use crate::shard::{Archive, ResumeState, ShardManifest, ShardWriter};
use crate::sth::SignedTreeHead;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub workers: usize,
    /// Work-unit size; also the `get-entries` batch hint.
    pub batch: u64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            batch: 1024,
        }
    }
}

/// What a completed run produced.
#[derive(Debug)]
pub struct SyncOutcome {
    /// The now-trusted STH.
    pub trusted: SignedTreeHead,
    pub new_entries: u64,
    /// Shards sealed by this run, ready for the packager.
    pub sealed: Vec<ShardManifest>,
}

/// Advisory lock on an archive root; held for the duration of a run and
/// removed on drop.
pub struct ArchiveLock {
    path: PathBuf,
}

impl ArchiveLock {
    pub fn acquire(archive: &Archive) -> Result<Self, MirrorError> {
        let path = archive.root().join(".lock");
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(MirrorError::ArchiveLocked(path))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ArchiveLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Run one sync of `log` against its archive.
///
/// Re-running against an unchanged log is a no-op; re-running after an abort
/// resumes from the last committed state.
pub async fn run_sync(
    log: &LogDescriptor,
    transport: Arc<dyn LogTransport>,
    archive: &Archive,
    options: &SyncOptions,
    cancel: &CancellationToken,
) -> Result<SyncOutcome, MirrorError> {
    let _lock = ArchiveLock::acquire(archive)?;

    // IDLE: an absent trusted STH means an empty local tree.
    let trusted = archive.load_trusted_sth()?;
    let old_size = trusted.as_ref().map_or(0, |sth| sth.tree_size);

    // FETCH_STH
    let new = transport.get_sth().await?;
    log.public_key.verify_sth(&new)?;
    info!(
        log = %log.id,
        old_size,
        new_size = new.tree_size,
        "fetched signed tree head"
    );

    if new.tree_size < old_size {
        return Err(MirrorError::TreeSizeRegression {
            trusted: old_size,
            new: new.tree_size,
        });
    }

    // VERIFY_CONSISTENCY: tie the new root to the trusted one before
    // downloading anything.
    if let Some(old) = &trusted {
        if new.tree_size == old.tree_size {
            if new.sha256_root_hash != old.sha256_root_hash {
                return Err(MirrorError::ConsistencyProofFailed {
                    first: old.tree_size,
                    second: new.tree_size,
                    reason: "log presented a different root for the trusted size".into(),
                });
            }
            info!(log = %log.id, "log has not advanced; nothing to do");
            return Ok(SyncOutcome {
                trusted: old.clone(),
                new_entries: 0,
                sealed: Vec::new(),
            });
        }
        if old.tree_size > 0 {
            let proof = transport
                .get_sth_consistency(old.tree_size, new.tree_size)
                .await?;
            verify_consistency(
                old.tree_size,
                new.tree_size,
                &old.sha256_root_hash,
                &new.sha256_root_hash,
                &proof,
            )?;
        }
    }

    // SYNC: resume the full-tree builder, then stream [old, new) through the
    // pipeline into the shard writer and the builder in lockstep.
    let mut builder = load_builder(archive, old_size)?;
    let mut writer = ShardWriter::resume(archive, old_size)?;
    let mut sealed = Vec::new();

    {
        let mut sink = |entry: Entry| -> Result<(), MirrorError> {
            if let Some(manifest) = writer.append(&entry)? {
                info!(
                    log = %log.id,
                    first = manifest.first_index,
                    last = manifest.last_index,
                    "sealed shard"
                );
                sealed.push(manifest);
            }
            builder.push(entry.leaf_hash);
            Ok(())
        };
        fetch_ordered(
            transport,
            old_size,
            new.tree_size,
            options.batch,
            options.workers,
            cancel,
            &mut sink,
        )
        .await?;
    }

    let computed = builder.root();
    if builder.size() != new.tree_size || computed != new.sha256_root_hash {
        // ABORT: nothing past the last committed state is recorded; the next
        // run rewinds the open shard to the old high-water mark.
        return Err(MirrorError::RootMismatch {
            tree_size: new.tree_size,
            expected: hex::encode(new.sha256_root_hash),
            computed: hex::encode(computed),
        });
    }

    // COMMIT: make every appended leaf durable, then advance the trusted STH,
    // then the resume state. A crash between the two writes is recovered by
    // rebuilding the builder from the already-durable shard files.
    writer.sync_open()?;
    archive.store_trusted_sth(&new)?;
    if new.tree_size % archive.shard_size() == 0 {
        archive.clear_resume()?;
    } else {
        archive.store_resume(&ResumeState {
            high_water: new.tree_size,
            tree: builder,
        })?;
    }

    info!(
        log = %log.id,
        tree_size = new.tree_size,
        fetched = new.tree_size - old_size,
        sealed = sealed.len(),
        "archive advanced"
    );
    Ok(SyncOutcome {
        new_entries: new.tree_size - old_size,
        trusted: new,
        sealed,
    })
}

/// Builder state at `old_size`: from `resume.json` when it matches, rebuilt
/// from the shard files on disk otherwise.
fn load_builder(archive: &Archive, old_size: u64) -> Result<TreeBuilder, MirrorError> {
    if old_size == 0 {
        return Ok(TreeBuilder::new());
    }
    if let Some(resume) = archive.load_resume()? {
        if resume.high_water == old_size && resume.tree.size() == old_size {
            return Ok(resume.tree);
        }
        warn!(
            resume = resume.high_water,
            trusted = old_size,
            "resume state does not match the trusted STH; rebuilding from disk"
        );
    }
    archive.rebuild_tree(old_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_lock_is_exclusive_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(dir.path(), "log", 4).unwrap();

        let lock = ArchiveLock::acquire(&archive).unwrap();
        assert!(matches!(
            ArchiveLock::acquire(&archive),
            Err(MirrorError::ArchiveLocked(_))
        ));
        drop(lock);
        ArchiveLock::acquire(&archive).unwrap();
    }
}
