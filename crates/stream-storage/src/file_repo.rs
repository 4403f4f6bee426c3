//! File repository: rotation and lifecycle of sink files.
//!
//! # Rotation
//!
//! A rotation closes the writing file of each sink together with its
//! writing slices, and opens a successor file with one slice per assigned
//! volume. It runs as one [`AtomicOp`]:
//!
//! 1. **read** sinks, writer volumes, recent slice statistics, and the
//!    writing files and slices;
//! 2. **prepare** remote file resources for every sink, in parallel;
//! 3. **write** close/open changes for all sinks into one transaction.
//!
//! A sink therefore never has zero or two writing files visible at once.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use stream_core::config::{LevelConfig, StorageConfig};
use stream_core::{ByteSize, Sink, SinkKey, UtcTime};
use stream_kv::{AtomicOp, Compare, KvStore, Reader, WriteBatch, no_prepare};
use stream_placement::{VolumeMetadata, volumes_for};
use tracing::{debug, info, warn};

use crate::definitions::{read_sink, read_sinks_in};
use crate::error::{MultiError, StorageError, StorageResult};
use crate::file::{File, FileKey};
use crate::level::Level;
use crate::parent::ParentKey;
use crate::provider::{FileResource, FileResourceProvider, ResourceProvisioner};
use crate::retry::RetryBackoff;
use crate::rollback::Rollback;
use crate::schema;
use crate::slice::Slice;
use crate::slice_repo::{create_slice, read_slices_in_state, update_slice};
use crate::state::{FileState, SliceState, validate_file_and_slice_states};
use crate::statistics::{self, StatsUpdate};
use crate::volumes::{VolumeRepository, read_writer_volumes};

#[derive(Clone)]
pub struct FileRepository {
    store: KvStore,
    config: LevelConfig,
    recent_slices: usize,
    backoff: Arc<dyn RetryBackoff>,
    provider: Arc<dyn FileResourceProvider>,
}

struct RotateRead {
    sinks: Vec<Sink>,
    volumes: Vec<VolumeMetadata>,
    max_used: BTreeMap<SinkKey, ByteSize>,
    opened_files: Vec<File>,
    opened_slices: Vec<Slice>,
}

struct RotatePrepared {
    read: RotateRead,
    resources: BTreeMap<SinkKey, FileResource>,
}

/// Everything a rotation of one sink needs from the read and prepare phases.
struct SinkRotation<'a> {
    sink: &'a Sink,
    open_new: bool,
    resource: Option<&'a FileResource>,
    volumes: &'a [VolumeMetadata],
    max_used: ByteSize,
    opened_files: Vec<File>,
    opened_slices: Vec<Slice>,
}

struct TransitionRead {
    file: File,
    slices: Vec<Slice>,
    stats: StatsUpdate,
}

impl FileRepository {
    pub fn new(
        store: KvStore,
        config: &StorageConfig,
        backoff: Arc<dyn RetryBackoff>,
        provider: Arc<dyn FileResourceProvider>,
    ) -> Self {
        Self {
            store,
            config: config.level.clone(),
            recent_slices: config.statistics.recent_slices_for_allocation,
            backoff,
            provider,
        }
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn get(&self, key: &FileKey) -> StorageResult<File> {
        self.store
            .get(&schema::file(key))?
            .ok_or_else(|| StorageError::not_found("file", key, "sink"))?
            .decode()
            .map_err(Into::into)
    }

    pub fn list_all(&self) -> StorageResult<Vec<File>> {
        self.list(&schema::files())
    }

    /// Files under a project, branch, source or sink.
    pub fn list_in(&self, parent: &dyn fmt::Display) -> StorageResult<Vec<File>> {
        self.list(&schema::files_in(parent))
    }

    pub fn list_in_level(&self, parent: &dyn fmt::Display, level: Level) -> StorageResult<Vec<File>> {
        self.list(&schema::files_in_level(level, parent))
    }

    pub fn list_in_state(&self, parent: &dyn fmt::Display, state: FileState) -> StorageResult<Vec<File>> {
        Ok(self
            .list_in_level(parent, state.level())?
            .into_iter()
            .filter(|f| f.state == state)
            .collect())
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<File>> {
        self.store
            .get_prefix(prefix)?
            .iter()
            .map(|kv| kv.decode().map_err(Into::into))
            .collect()
    }

    // ── Rotation ────────────────────────────────────────────────────

    /// Close the writing file of the sink, if any, and open a new one.
    ///
    /// Compensations for created file resources are registered in
    /// `rollback`; the caller runs them if the surrounding operation fails.
    pub async fn rotate(&self, rollback: &Rollback, now: UtcTime, key: &SinkKey) -> StorageResult<File> {
        let provisioner = self.provisioner(rollback);
        let files = self
            .rotate_all_in_inner(Some(provisioner), now, ParentKey::Sink(key.clone()), None)
            .await?;
        single_file(files)
    }

    /// Rotate every table sink under the parent.
    pub async fn rotate_all_in(
        &self,
        rollback: &Rollback,
        now: UtcTime,
        parent: impl Into<ParentKey>,
    ) -> StorageResult<Vec<File>> {
        let provisioner = self.provisioner(rollback);
        self.rotate_all_in_inner(Some(provisioner), now, parent.into(), None)
            .await
    }

    /// Rotate a sink whose definition has just changed.
    ///
    /// The given sink value is used instead of the stored definition.
    pub async fn rotate_on_sink_mod(&self, rollback: &Rollback, now: UtcTime, sink: Sink) -> StorageResult<File> {
        let provisioner = self.provisioner(rollback);
        let parent = ParentKey::Sink(sink.key.clone());
        let files = self
            .rotate_all_in_inner(Some(provisioner), now, parent, Some(vec![sink]))
            .await?;
        single_file(files)
    }

    /// Close the writing file of the sink without opening a new one.
    pub async fn close(&self, now: UtcTime, key: &SinkKey) -> StorageResult<()> {
        self.rotate_all_in_inner(None, now, ParentKey::Sink(key.clone()), None)
            .await?;
        Ok(())
    }

    /// Close writing files of every table sink under the parent.
    pub async fn close_all_in(&self, now: UtcTime, parent: impl Into<ParentKey>) -> StorageResult<()> {
        self.rotate_all_in_inner(None, now, parent.into(), None).await?;
        Ok(())
    }

    fn provisioner(&self, rollback: &Rollback) -> ResourceProvisioner {
        ResourceProvisioner::new(
            Arc::clone(&self.provider),
            rollback.clone(),
            self.config.staging.parallel_file_create_limit,
        )
    }

    /// Without a provisioner, files are only closed.
    async fn rotate_all_in_inner(
        &self,
        provisioner: Option<ResourceProvisioner>,
        now: UtcTime,
        parent: ParentKey,
        sinks: Option<Vec<Sink>>,
    ) -> StorageResult<Vec<File>> {
        let open_new = provisioner.is_some();
        let name = if open_new { "file.rotate" } else { "file.close" };
        if open_new {
            // Volumes of nodes that stopped renewing their lease must not be assigned.
            VolumeRepository::new(self.store.clone()).expire(now)?;
        }

        AtomicOp::new(
            name,
            |reader: &mut Reader| self.read_rotation(reader, &parent, sinks.as_deref(), open_new),
            |read: RotateRead| {
                let provisioner = provisioner.clone();
                async move {
                    let resources = match &provisioner {
                        Some(provisioner) => {
                            let keys = read.sinks.iter().map(|s| s.key.clone()).collect();
                            provisioner.resources(now, keys).await?
                        }
                        None => BTreeMap::new(),
                    };
                    Ok::<_, StorageError>(RotatePrepared { read, resources })
                }
            },
            |prepared: RotatePrepared, batch: &mut WriteBatch<StorageError>| {
                let RotatePrepared { read, resources } = prepared;

                let mut files_by_sink: BTreeMap<SinkKey, Vec<File>> = BTreeMap::new();
                for file in read.opened_files {
                    files_by_sink.entry(file.key.sink_key.clone()).or_default().push(file);
                }
                let mut slices_by_sink: BTreeMap<SinkKey, Vec<Slice>> = BTreeMap::new();
                for slice in read.opened_slices {
                    slices_by_sink.entry(slice.sink_key().clone()).or_default().push(slice);
                }

                let mut errs = MultiError::new();
                let mut opened = Vec::new();
                for sink in &read.sinks {
                    let rotation = SinkRotation {
                        sink,
                        open_new,
                        resource: resources.get(&sink.key),
                        volumes: &read.volumes,
                        max_used: read.max_used.get(&sink.key).copied().unwrap_or_default(),
                        opened_files: files_by_sink.remove(&sink.key).unwrap_or_default(),
                        opened_slices: slices_by_sink.remove(&sink.key).unwrap_or_default(),
                    };

                    let mut sink_batch = WriteBatch::new();
                    match self.rotate_sink(now, rotation, &mut sink_batch) {
                        Ok(file) => {
                            batch.merge(sink_batch);
                            opened.extend(file);
                        }
                        Err(e) => errs.push(e),
                    }
                }
                errs.into_result()?;
                Ok(opened)
            },
        )
        .run(&self.store)
        .await
    }

    fn read_rotation(
        &self,
        reader: &mut Reader,
        parent: &ParentKey,
        sinks: Option<&[Sink]>,
        open_new: bool,
    ) -> StorageResult<RotateRead> {
        let sinks = match (sinks, parent) {
            (Some(sinks), _) => sinks.to_vec(),
            (None, ParentKey::Sink(key)) => vec![read_sink(reader, key)?],
            (None, parent) => {
                let mut sinks = read_sinks_in(reader, parent)?;
                sinks.retain(Sink::is_table);
                sinks
            }
        };
        // A sink requested by key must be a table sink.
        if let Some(sink) = sinks.iter().find(|s| !s.is_table()) {
            return Err(StorageError::NotTableSink(sink.key.to_string()));
        }

        let mut volumes = Vec::new();
        let mut max_used = BTreeMap::new();
        if open_new {
            volumes = read_writer_volumes(reader)?;
            for sink in &sinks {
                // Untracked: statistics are only a sizing hint.
                let size = statistics::max_used_disk_size(
                    |prefix| reader.get_prefix_untracked(prefix),
                    &sink.key,
                    self.recent_slices,
                )?;
                max_used.insert(sink.key.clone(), size);
            }
        }

        Ok(RotateRead {
            opened_files: read_files_in_state(reader, parent, FileState::Writing)?,
            opened_slices: read_slices_in_state(reader, parent, SliceState::Writing)?,
            sinks,
            volumes,
            max_used,
        })
    }

    /// Write phase of one sink.
    fn rotate_sink(
        &self,
        now: UtcTime,
        rotation: SinkRotation<'_>,
        batch: &mut WriteBatch<StorageError>,
    ) -> StorageResult<Option<File>> {
        let sink = rotation.sink;

        let resource = if rotation.open_new {
            let resource = rotation
                .resource
                .ok_or_else(|| StorageError::MissingCredentials(sink.key.to_string()))?;
            Some(resource)
        } else {
            None
        };

        // Close the old file.
        match rotation.opened_files.as_slice() {
            [] => {}
            [old] => {
                if resource.is_some_and(|r| r.file_key == old.key) {
                    return Err(StorageError::already_exists("file", &old.key, "sink"));
                }
                let closed = old.with_state(now, FileState::Closing)?;
                update_file(batch, old, &closed)?;
                info!(file = %old.key, "file closed");
            }
            opened => {
                return Err(StorageError::UnexpectedState(format!(
                    "unexpected state, found {} opened files in the sink \"{}\"",
                    opened.len(),
                    sink.key
                )));
            }
        }

        for old in &rotation.opened_slices {
            let closed = old.with_state(now, SliceState::Closing)?;
            update_slice(batch, old, &closed)?;
            debug!(slice = %old.key, "slice closed");
        }

        let Some(resource) = resource else {
            return Ok(None);
        };

        // Open the new file.
        let config = match &sink.config {
            Some(patch) => self.config.apply_patch(patch)?,
            None => self.config.clone(),
        };
        let mut file = File::new(&config, resource, sink)?;

        file.assignment = volumes_for(rotation.volumes, &file.assignment.config, file.opened_at());
        if file.assignment.volumes.is_empty() {
            warn!(sink = %sink.key, available = rotation.volumes.len(), "cannot open file: no volume");
            return Err(StorageError::NoVolume);
        }

        for volume_id in &file.assignment.volumes {
            let slice = Slice::new(now, &file, volume_id.clone(), rotation.max_used)?;
            create_slice(batch, &slice)?;
        }
        create_file(batch, &file)?;

        info!(
            file = %file.key,
            volumes = file.assignment.volumes.len(),
            previous_max = %rotation.max_used,
            "file opened"
        );
        Ok(Some(file))
    }

    // ── Mutations ───────────────────────────────────────────────────

    /// Switch the file from `from` to `to`.
    ///
    /// Uploaded slices are switched to `imported` together with the file.
    /// Every slice must end up in a state allowed by the new file state.
    /// Statistics of the file are moved if the storage level changes.
    pub async fn state_transition(
        &self,
        now: UtcTime,
        key: &FileKey,
        from: FileState,
        to: FileState,
    ) -> StorageResult<File> {
        AtomicOp::new(
            "file.state_transition",
            |reader: &mut Reader| {
                Ok(TransitionRead {
                    file: read_file(reader, key)?,
                    slices: reader.list_json::<Slice>(&schema::slices_in(key))?,
                    stats: statistics::read_move_all(reader, key, from.level(), to.level())?,
                })
            },
            no_prepare,
            |read: TransitionRead, batch: &mut WriteBatch<StorageError>| {
                if to == FileState::Closing {
                    return Err(StorageError::ClosingViaTransition {
                        kind: "file",
                        methods: "Rotate* or Close* methods",
                    });
                }
                if read.file.state != from {
                    return Err(StorageError::StateMismatch {
                        kind: "file",
                        key: key.to_string(),
                        actual: read.file.state.to_string(),
                        expected: from.to_string(),
                    });
                }

                let file = read.file.with_state(now, to)?;
                update_file(batch, &read.file, &file)?;

                let mut errs = MultiError::new();
                for old in &read.slices {
                    let mut slice = old.clone();
                    if to == FileState::Imported && old.state == SliceState::Uploaded {
                        match old.with_state(now, SliceState::Imported) {
                            Ok(imported) => slice = imported,
                            Err(e) => {
                                errs.push(e);
                                continue;
                            }
                        }
                    }

                    validate_file_and_slice_states(file.state, slice.state).map_err(|e| {
                        StorageError::UnexpectedSliceState {
                            key: slice.key.to_string(),
                            source: Box::new(e),
                        }
                    })?;

                    if slice != *old {
                        update_slice(batch, old, &slice)?;
                    }
                }
                errs.into_result()?;

                if !read.stats.is_empty() {
                    debug!(file = %key, from = %from.level(), to = %to.level(), "file statistics moved");
                }
                read.stats.apply(batch)?;

                info!(file = %key, %from, %to, "file state changed");
                Ok(file)
            },
        )
        .run(&self.store)
        .await
    }

    pub async fn increment_retry(&self, now: UtcTime, key: &FileKey, reason: &str) -> StorageResult<File> {
        AtomicOp::new(
            "file.increment_retry",
            |reader: &mut Reader| read_file(reader, key),
            no_prepare,
            |old: File, batch: &mut WriteBatch<StorageError>| {
                let mut file = old.clone();
                file.increment_retry(self.backoff.as_ref(), now, reason);
                update_file(batch, &old, &file)?;
                debug!(
                    file = %key,
                    attempt = file.retry.retry_attempt,
                    retry_after = ?file.retry.retry_after,
                    "file retry incremented"
                );
                Ok(file)
            },
        )
        .run(&self.store)
        .await
    }

    /// Delete the file with all its slices and statistics. Statistics in
    /// the target level are added to the sink sum.
    pub async fn delete(&self, key: &FileKey) -> StorageResult<()> {
        AtomicOp::new(
            "file.delete",
            |reader: &mut Reader| {
                let file = read_file(reader, key)?;
                Ok((file, statistics::read_delete_file(reader, key)?))
            },
            no_prepare,
            |(file, stats): (File, StatsUpdate), batch: &mut WriteBatch<StorageError>| {
                batch.delete(schema::file(&file.key));
                batch.delete_prefix(schema::slices_in(&file.key));
                for level in Level::ALL {
                    batch.delete(schema::file_in_level(level, &file.key));
                    batch.delete_prefix(schema::slices_in_level(level, &file.key));
                }
                stats.apply(batch)?;
                info!(file = %key, "file deleted");
                Ok(())
            },
        )
        .run(&self.store)
        .await
    }
}

fn single_file(files: Vec<File>) -> StorageResult<File> {
    let count = files.len();
    let mut files = files.into_iter();
    match (files.next(), count) {
        (Some(file), 1) => Ok(file),
        _ => Err(StorageError::UnexpectedState(format!("expected 1 file, found {count}"))),
    }
}

// ── Shared with the slice repository ────────────────────────────────

pub(crate) fn read_file(reader: &mut Reader, key: &FileKey) -> StorageResult<File> {
    reader
        .get_json::<File>(&schema::file(key))?
        .ok_or_else(|| StorageError::not_found("file", key, "sink"))
}

pub(crate) fn read_files_in_state(
    reader: &mut Reader,
    parent: &dyn fmt::Display,
    state: FileState,
) -> StorageResult<Vec<File>> {
    Ok(reader
        .list_json::<File>(&schema::files_in_level(state.level(), parent))?
        .into_iter()
        .filter(|f| f.state == state)
        .collect())
}

/// Save a new file; fails with "already exists" if the key is taken.
pub(crate) fn create_file(batch: &mut WriteBatch<StorageError>, file: &File) -> StorageResult<()> {
    let key = schema::file(&file.key);
    batch.guard(
        Compare::not_exists(key.clone()),
        StorageError::already_exists("file", &file.key, "sink"),
    );
    batch.put_json(key, file)?;
    batch.put_json(schema::file_in_level(file.state.level(), &file.key), file)?;
    Ok(())
}

/// Save a modified file, keeping the level index in sync.
pub(crate) fn update_file(batch: &mut WriteBatch<StorageError>, old: &File, new: &File) -> StorageResult<()> {
    batch.put_json(schema::file(&new.key), new)?;
    batch.put_json(schema::file_in_level(new.state.level(), &new.key), new)?;
    if old.state.level() != new.state.level() {
        batch.delete(schema::file_in_level(old.state.level(), &old.key));
    }
    Ok(())
}
