//! Slice repository: lifecycle of slices of one file volume.
//!
//! Every operation is an [`AtomicOp`]: the read phase captures the slice,
//! its file and statistics from one snapshot, the write phase validates
//! and emits the changes, and a concurrent modification of anything read
//! restarts the cycle.

use std::fmt;
use std::sync::Arc;

use stream_core::{ByteSize, UtcTime};
use stream_kv::{AtomicOp, Compare, KvStore, Reader, WriteBatch, no_prepare};
use tracing::{debug, info};

use crate::definitions::read_sink;
use crate::error::{StorageError, StorageResult};
use crate::file::File;
use crate::file_repo::read_file;
use crate::level::Level;
use crate::retry::RetryBackoff;
use crate::schema;
use crate::slice::{FileVolumeKey, Slice, SliceKey};
use crate::state::{FileState, SliceState, validate_file_and_slice_states};
use crate::statistics::{self, StatsUpdate};

#[derive(Clone)]
pub struct SliceRepository {
    store: KvStore,
    backoff: Arc<dyn RetryBackoff>,
    recent_slices: usize,
}

struct RotateRead {
    file: File,
    opened: Vec<Slice>,
    max_used: ByteSize,
}

struct TransitionRead {
    slice: Slice,
    file: File,
    stats: StatsUpdate,
}

impl SliceRepository {
    pub fn new(store: KvStore, backoff: Arc<dyn RetryBackoff>, recent_slices: usize) -> Self {
        Self {
            store,
            backoff,
            recent_slices,
        }
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn get(&self, key: &SliceKey) -> StorageResult<Slice> {
        self.store
            .get(&schema::slice(key))?
            .ok_or_else(|| StorageError::not_found("slice", key, "file"))?
            .decode()
            .map_err(Into::into)
    }

    /// Slices under a sink, file, file volume or any other parent object.
    pub fn list_in(&self, parent: &dyn fmt::Display) -> StorageResult<Vec<Slice>> {
        self.list(&schema::slices_in(parent))
    }

    pub fn list_in_level(&self, parent: &dyn fmt::Display, level: Level) -> StorageResult<Vec<Slice>> {
        self.list(&schema::slices_in_level(level, parent))
    }

    pub fn list_in_state(&self, parent: &dyn fmt::Display, state: SliceState) -> StorageResult<Vec<Slice>> {
        Ok(self
            .list_in_level(parent, state.level())?
            .into_iter()
            .filter(|s| s.state == state)
            .collect())
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<Slice>> {
        self.store
            .get_prefix(prefix)?
            .iter()
            .map(|kv| kv.decode().map_err(Into::into))
            .collect()
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Close the writing slice of the file volume, if any, and open a new one.
    pub async fn rotate(&self, now: UtcTime, key: &FileVolumeKey) -> StorageResult<Slice> {
        self.rotate_inner(now, key, true)
            .await?
            .ok_or_else(|| StorageError::UnexpectedState(format!("no slice opened in the file volume \"{key}\"")))
    }

    /// Close the writing slice of the file volume, if any, without a replacement.
    pub async fn close(&self, now: UtcTime, key: &FileVolumeKey) -> StorageResult<()> {
        self.rotate_inner(now, key, false).await?;
        Ok(())
    }

    pub async fn increment_retry(&self, now: UtcTime, key: &SliceKey, reason: &str) -> StorageResult<Slice> {
        AtomicOp::new(
            "slice.increment_retry",
            |reader: &mut Reader| read_slice(reader, key),
            no_prepare,
            |old: Slice, batch: &mut WriteBatch<StorageError>| {
                let mut slice = old.clone();
                slice.increment_retry(self.backoff.as_ref(), now, reason);
                update_slice(batch, &old, &slice)?;
                debug!(slice = %key, attempt = slice.retry.retry_attempt, "slice retry incremented");
                Ok(slice)
            },
        )
        .run(&self.store)
        .await
    }

    /// Switch the slice from `from` to `to`.
    ///
    /// The new state must be legal together with the file state. Statistics
    /// are moved if the storage level changes.
    pub async fn state_transition(
        &self,
        now: UtcTime,
        key: &SliceKey,
        from: SliceState,
        to: SliceState,
    ) -> StorageResult<Slice> {
        AtomicOp::new(
            "slice.state_transition",
            |reader: &mut Reader| {
                Ok(TransitionRead {
                    slice: read_slice(reader, key)?,
                    file: read_file(reader, key.file_key())?,
                    stats: statistics::read_move(reader, key, from.level(), to.level())?,
                })
            },
            no_prepare,
            |read: TransitionRead, batch: &mut WriteBatch<StorageError>| {
                if to == SliceState::Closing {
                    return Err(StorageError::ClosingViaTransition {
                        kind: "slice",
                        methods: "Rotate or Close method",
                    });
                }
                if read.slice.state != from {
                    return Err(StorageError::StateMismatch {
                        kind: "slice",
                        key: key.to_string(),
                        actual: read.slice.state.to_string(),
                        expected: from.to_string(),
                    });
                }
                validate_file_and_slice_states(read.file.state, to).map_err(|e| {
                    StorageError::UnexpectedSliceState {
                        key: key.to_string(),
                        source: Box::new(e),
                    }
                })?;

                let slice = read.slice.with_state(now, to)?;
                update_slice(batch, &read.slice, &slice)?;
                read.stats.apply(batch)?;
                info!(slice = %key, %from, %to, "slice state changed");
                Ok(slice)
            },
        )
        .run(&self.store)
        .await
    }

    /// Delete the slice metadata. Statistics in the target level are added
    /// to the file sum.
    pub async fn delete(&self, key: &SliceKey) -> StorageResult<()> {
        AtomicOp::new(
            "slice.delete",
            |reader: &mut Reader| {
                let slice = read_slice(reader, key)?;
                Ok((slice, statistics::read_delete_slice(reader, key)?))
            },
            no_prepare,
            |(slice, stats): (Slice, StatsUpdate), batch: &mut WriteBatch<StorageError>| {
                batch.delete(schema::slice(&slice.key));
                for level in Level::ALL {
                    batch.delete(schema::slice_in_level(level, &slice.key));
                }
                stats.apply(batch)?;
                info!(slice = %key, "slice deleted");
                Ok(())
            },
        )
        .run(&self.store)
        .await
    }

    async fn rotate_inner(&self, now: UtcTime, key: &FileVolumeKey, open_new: bool) -> StorageResult<Option<Slice>> {
        AtomicOp::new(
            if open_new { "slice.rotate" } else { "slice.close" },
            |reader: &mut Reader| {
                read_sink(reader, &key.file_key.sink_key)?;
                let file = read_file(reader, &key.file_key)?;
                let opened = read_slices_in_state(reader, key, SliceState::Writing)?;
                let max_used = if open_new {
                    statistics::max_used_disk_size(
                        |prefix| reader.get_prefix_untracked(prefix),
                        &key.file_key.sink_key,
                        self.recent_slices,
                    )?
                } else {
                    ByteSize(0)
                };
                Ok(RotateRead { file, opened, max_used })
            },
            no_prepare,
            |read: RotateRead, batch: &mut WriteBatch<StorageError>| {
                if read.file.state != FileState::Writing {
                    return Err(StorageError::UnexpectedState(format!(
                        "slice cannot be created: unexpected file \"{}\" state \"{}\", expected \"{}\"",
                        key.file_key,
                        read.file.state,
                        FileState::Writing
                    )));
                }

                let new_slice = if open_new {
                    let slice = Slice::new(now, &read.file, key.volume_id.clone(), read.max_used)?;
                    create_slice(batch, &slice)?;
                    Some(slice)
                } else {
                    None
                };

                match read.opened.as_slice() {
                    [] => {}
                    [old] => {
                        if new_slice.as_ref().is_some_and(|s| s.key == old.key) {
                            return Err(StorageError::already_exists("slice", &old.key, "file"));
                        }
                        let closed = old.with_state(now, SliceState::Closing)?;
                        update_slice(batch, old, &closed)?;
                        info!(slice = %old.key, "slice closed");
                    }
                    opened => {
                        return Err(StorageError::UnexpectedState(format!(
                            "unexpected state, found {} opened slices in the file volume \"{key}\"",
                            opened.len()
                        )));
                    }
                }

                if let Some(slice) = &new_slice {
                    info!(slice = %slice.key, allocated = %slice.local.allocated_disk_space, "slice opened");
                }
                Ok(new_slice)
            },
        )
        .run(&self.store)
        .await
    }
}

// ── Shared with the file repository ─────────────────────────────────

pub(crate) fn read_slice(reader: &mut Reader, key: &SliceKey) -> StorageResult<Slice> {
    reader
        .get_json::<Slice>(&schema::slice(key))?
        .ok_or_else(|| StorageError::not_found("slice", key, "file"))
}

pub(crate) fn read_slices_in_state(
    reader: &mut Reader,
    parent: &dyn fmt::Display,
    state: SliceState,
) -> StorageResult<Vec<Slice>> {
    Ok(reader
        .list_json::<Slice>(&schema::slices_in_level(state.level(), parent))?
        .into_iter()
        .filter(|s| s.state == state)
        .collect())
}

/// Save a new slice; fails with "already exists" if the key is taken.
pub(crate) fn create_slice(batch: &mut WriteBatch<StorageError>, slice: &Slice) -> StorageResult<()> {
    let key = schema::slice(&slice.key);
    batch.guard(
        Compare::not_exists(key.clone()),
        StorageError::already_exists("slice", &slice.key, "file"),
    );
    batch.put_json(key, slice)?;
    batch.put_json(schema::slice_in_level(slice.state.level(), &slice.key), slice)?;
    Ok(())
}

/// Save a modified slice, keeping the level index in sync.
pub(crate) fn update_slice(batch: &mut WriteBatch<StorageError>, old: &Slice, new: &Slice) -> StorageResult<()> {
    batch.put_json(schema::slice(&new.key), new)?;
    batch.put_json(schema::slice_in_level(new.state.level(), &new.key), new)?;
    if old.state.level() != new.state.level() {
        batch.delete(schema::slice_in_level(old.state.level(), &old.key));
    }
    Ok(())
}
