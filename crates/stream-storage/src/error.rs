//! Storage error types.

use std::fmt;

use stream_core::{ByteSize, ConfigError};
use stream_kv::KvError;
use thiserror::Error;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{kind} \"{key}\" not found in the {parent}")]
    NotFound {
        kind: &'static str,
        key: String,
        parent: &'static str,
    },

    #[error("{kind} \"{key}\" already exists in the {parent}")]
    AlreadyExists {
        kind: &'static str,
        key: String,
        parent: &'static str,
    },

    #[error("unexpected {kind} \"{key}\" state transition from \"{from}\" to \"{to}\"")]
    InvalidTransition {
        kind: &'static str,
        key: String,
        from: String,
        to: String,
    },

    #[error("{kind} \"{key}\" is in \"{actual}\" state, expected \"{expected}\"")]
    StateMismatch {
        kind: &'static str,
        key: String,
        actual: String,
        expected: String,
    },

    #[error("unexpected combination: file state \"{file_state}\" and slice state \"{slice_state}\"")]
    UnexpectedStateCombination {
        file_state: String,
        slice_state: String,
    },

    #[error("unexpected slice \"{key}\" state: {source}")]
    UnexpectedSliceState {
        key: String,
        #[source]
        source: Box<StorageError>,
    },

    #[error("unexpected {kind} transition to the state \"closing\", use {methods}")]
    ClosingViaTransition {
        kind: &'static str,
        methods: &'static str,
    },

    #[error("{0}")]
    UnexpectedState(String),

    #[error("no volume is available for the file")]
    NoVolume,

    #[error("file compression type \"{0}\" is not supported by the staging storage")]
    UnsupportedCompression(String),

    #[error("sink \"{0}\" is not a table sink")]
    NotTableSink(String),

    #[error("credentials for the sink \"{0}\" was not provided")]
    MissingCredentials(String),

    #[error(
        "no free space in the buffer: the \"{sink}\" sink has \"{buffered}\" buffered for upload, limit is \"{limit}\""
    )]
    QuotaExceeded {
        sink: String,
        buffered: ByteSize,
        limit: ByteSize,
    },

    #[error("{0}")]
    Multi(MultiError),

    #[error("file resource provider error: {0}")]
    Provider(#[source] anyhow::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("metadata store error: {0}")]
    Kv(#[from] KvError),

    #[error("serialization error: {0}")]
    Serde(String),
}

impl StorageError {
    pub fn not_found(kind: &'static str, key: impl fmt::Display, parent: &'static str) -> Self {
        StorageError::NotFound {
            kind,
            key: key.to_string(),
            parent,
        }
    }

    pub fn already_exists(kind: &'static str, key: impl fmt::Display, parent: &'static str) -> Self {
        StorageError::AlreadyExists {
            kind,
            key: key.to_string(),
            parent,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StorageError::AlreadyExists { .. })
    }
}

/// Failures collected from operations fanned out over many items.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<StorageError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: StorageError) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[StorageError] {
        &self.errors
    }

    /// `Ok` if nothing was collected, a single error is returned as is.
    pub fn into_result(mut self) -> StorageResult<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(StorageError::Multi(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "- {err}")?;
        }
        Ok(())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serde(e.to_string())
    }
}
