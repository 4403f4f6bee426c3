//! Slice entity: one physical buffer segment of a file on one volume.

use std::fmt;

use serde::{Deserialize, Serialize};
use stream_core::config::{CompressionConfig, DiskSyncConfig};
use stream_core::{ByteSize, SinkKey, UtcTime};
use stream_placement::VolumeId;

use crate::diskalloc;
use crate::error::{StorageError, StorageResult};
use crate::file::{File, FileKey, normalize_dir};
use crate::retry::{RetryBackoff, Retryable};
use crate::state::SliceState;

const SLICE_FILENAME: &str = "slice.csv";

/// A file on one volume; slices of a file rotate independently per volume.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileVolumeKey {
    #[serde(flatten)]
    pub file_key: FileKey,
    pub volume_id: VolumeId,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceKey {
    #[serde(flatten)]
    pub file_volume_key: FileVolumeKey,
    pub slice_opened_at: UtcTime,
}

impl FileVolumeKey {
    pub fn new(file_key: FileKey, volume_id: impl Into<VolumeId>) -> Self {
        Self {
            file_key,
            volume_id: volume_id.into(),
        }
    }
}

impl SliceKey {
    pub fn new(file_volume_key: FileVolumeKey, opened_at: UtcTime) -> Self {
        Self {
            file_volume_key,
            slice_opened_at: opened_at,
        }
    }

    pub fn file_key(&self) -> &FileKey {
        &self.file_volume_key.file_key
    }

    pub fn sink_key(&self) -> &SinkKey {
        &self.file_volume_key.file_key.sink_key
    }

    pub fn volume_id(&self) -> &VolumeId {
        &self.file_volume_key.volume_id
    }

    pub fn opened_at(&self) -> UtcTime {
        self.slice_opened_at
    }
}

impl fmt::Display for FileVolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.file_key, self.volume_id)
    }
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.file_volume_key, self.slice_opened_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSlice {
    /// Directory of the slice, relative to the volume.
    pub dir: String,
    pub filename: String,
    pub compression: CompressionConfig,
    pub disk_sync: DiskSyncConfig,
    /// Disk space pre-allocated when the slice file is created, zero disables it.
    pub allocated_disk_space: ByteSize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingSlice {
    pub compression: CompressionConfig,
    /// Object path of the uploaded slice, relative to the file resource.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slice {
    #[serde(flatten)]
    pub key: SliceKey,
    pub state: SliceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploading_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<UtcTime>,
    #[serde(flatten)]
    pub retry: Retryable,
    pub local: LocalSlice,
    pub staging: StagingSlice,
}

impl Slice {
    /// A new slice of `file` in the `writing` state, opened at `now`.
    ///
    /// `previous_size` is the largest size of recently finished slices of
    /// the sink, used to size the disk pre-allocation.
    pub fn new(now: UtcTime, file: &File, volume_id: VolumeId, previous_size: ByteSize) -> StorageResult<Slice> {
        let key = SliceKey::new(FileVolumeKey::new(file.key.clone(), volume_id), now);
        let compression = file.local.compression.clone();
        let staging_compression = compression
            .for_staging()
            .ok_or_else(|| StorageError::UnsupportedCompression(compression.compression_type.to_string()))?;

        Ok(Slice {
            local: LocalSlice {
                dir: normalize_dir(&format!("{}/{}", file.local.dir, now)),
                filename: format!("{SLICE_FILENAME}{}", compression.compression_type.extension()),
                allocated_disk_space: diskalloc::allocated_size(&file.local.disk_allocation, previous_size),
                disk_sync: file.local.disk_sync.clone(),
                compression,
            },
            staging: StagingSlice {
                path: format!(
                    "{}_{}.csv{}",
                    now,
                    key.volume_id(),
                    staging_compression.compression_type.extension()
                ),
                compression: staging_compression,
            },
            key,
            state: SliceState::Writing,
            closing_at: None,
            uploading_at: None,
            uploaded_at: None,
            imported_at: None,
            retry: Retryable::default(),
        })
    }

    pub fn file_key(&self) -> &FileKey {
        self.key.file_key()
    }

    pub fn sink_key(&self) -> &SinkKey {
        self.key.sink_key()
    }

    /// Copy of the slice switched to the `to` state.
    pub fn with_state(&self, now: UtcTime, to: SliceState) -> StorageResult<Slice> {
        if !self.state.can_transition_to(to) {
            return Err(StorageError::InvalidTransition {
                kind: "slice",
                key: self.key.to_string(),
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }

        let mut out = self.clone();
        out.state = to;
        match to {
            SliceState::Writing => {}
            SliceState::Closing => out.closing_at = Some(now),
            SliceState::Uploading => out.uploading_at = Some(now),
            SliceState::Uploaded => out.uploaded_at = Some(now),
            SliceState::Imported => out.imported_at = Some(now),
        }
        out.retry.reset();
        Ok(out)
    }

    pub fn increment_retry(&mut self, backoff: &dyn RetryBackoff, now: UtcTime, reason: impl Into<String>) {
        self.retry.increment(backoff, now, reason);
    }
}
