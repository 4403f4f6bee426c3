//! File entity: one logical output file of a sink.

use std::fmt;

use serde::{Deserialize, Serialize};
use stream_core::config::{CompressionConfig, DiskAllocationConfig, DiskSyncConfig, LevelConfig};
use stream_core::{Column, Sink, SinkKey, UtcTime};
use stream_placement::Assignment;

use crate::error::{StorageError, StorageResult};
use crate::provider::{Credentials, FileResource};
use crate::retry::{RetryBackoff, Retryable};
use crate::state::FileState;

/// Identity of a file: the sink and the opening time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileKey {
    #[serde(flatten)]
    pub sink_key: SinkKey,
    pub file_opened_at: UtcTime,
}

impl FileKey {
    pub fn new(sink_key: SinkKey, opened_at: UtcTime) -> Self {
        Self {
            sink_key,
            file_opened_at: opened_at,
        }
    }

    pub fn opened_at(&self) -> UtcTime {
        self.file_opened_at
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sink_key, self.file_opened_at)
    }
}

/// Local level part of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalFile {
    /// Directory of the file slices, relative to a volume.
    pub dir: String,
    pub compression: CompressionConfig,
    pub disk_sync: DiskSyncConfig,
    pub disk_allocation: DiskAllocationConfig,
}

/// Staging level part of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingFile {
    pub compression: CompressionConfig,
    pub resource_name: String,
    pub credentials: Credentials,
}

/// Target level part of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetFile {
    pub table_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    #[serde(flatten)]
    pub key: FileKey,
    pub state: FileState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closing_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importing_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<UtcTime>,
    #[serde(flatten)]
    pub retry: Retryable,
    /// Columns of the sink mapping at the time the file was opened.
    pub columns: Vec<Column>,
    pub assignment: Assignment,
    pub local: LocalFile,
    pub staging: StagingFile,
    pub target: TargetFile,
}

impl File {
    /// A new file in the `writing` state, without assigned volumes.
    pub fn new(config: &LevelConfig, resource: &FileResource, sink: &Sink) -> StorageResult<File> {
        let local_compression = config.local.compression.clone();
        let staging_compression = local_compression.for_staging().ok_or_else(|| {
            StorageError::UnsupportedCompression(local_compression.compression_type.to_string())
        })?;

        let table_id = sink
            .table
            .as_ref()
            .map(|t| t.table_id.clone())
            .ok_or_else(|| StorageError::UnexpectedState(format!("sink \"{}\" is not a table sink", sink.key)))?;

        let key = resource.file_key.clone();
        Ok(File {
            local: LocalFile {
                dir: normalize_dir(&key.to_string()),
                compression: local_compression,
                disk_sync: config.local.disk_sync.clone(),
                disk_allocation: config.local.disk_allocation.clone(),
            },
            staging: StagingFile {
                compression: staging_compression,
                resource_name: resource.name.clone(),
                credentials: resource.credentials.clone(),
            },
            target: TargetFile { table_id },
            key,
            state: FileState::Writing,
            closing_at: None,
            importing_at: None,
            imported_at: None,
            retry: Retryable::default(),
            columns: sink.columns().to_vec(),
            assignment: Assignment {
                config: config.local.volume.assignment.clone(),
                volumes: Vec::new(),
            },
        })
    }

    pub fn sink_key(&self) -> &SinkKey {
        &self.key.sink_key
    }

    pub fn opened_at(&self) -> UtcTime {
        self.key.file_opened_at
    }

    /// Copy of the file switched to the `to` state.
    ///
    /// The state timestamp is set and the retry state is reset.
    pub fn with_state(&self, now: UtcTime, to: FileState) -> StorageResult<File> {
        if !self.state.can_transition_to(to) {
            return Err(StorageError::InvalidTransition {
                kind: "file",
                key: self.key.to_string(),
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }

        let mut out = self.clone();
        out.state = to;
        match to {
            FileState::Writing => {}
            FileState::Closing => out.closing_at = Some(now),
            FileState::Importing => out.importing_at = Some(now),
            FileState::Imported => out.imported_at = Some(now),
        }
        out.retry.reset();
        Ok(out)
    }

    pub fn increment_retry(&mut self, backoff: &dyn RetryBackoff, now: UtcTime, reason: impl Into<String>) {
        self.retry.increment(backoff, now, reason);
    }
}

/// Keys contain timestamps; `:` is not allowed in directory names on every
/// filesystem.
pub(crate) fn normalize_dir(path: &str) -> String {
    path.replace(':', "-")
}
