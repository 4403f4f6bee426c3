//! File and slice state machines.
//!
//! Both machines only move forward, one step at a time:
//!
//! ```text
//! File:  writing → closing → importing → imported
//! Slice: writing → closing → uploading → uploaded → imported
//! ```
//!
//! The `closing` state is entered only by rotation or close operations.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};
use crate::level::Level;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    Writing,
    Closing,
    Importing,
    Imported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SliceState {
    Writing,
    Closing,
    Uploading,
    Uploaded,
    Imported,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Writing => "writing",
            FileState::Closing => "closing",
            FileState::Importing => "importing",
            FileState::Imported => "imported",
        }
    }

    pub fn level(&self) -> Level {
        match self {
            FileState::Writing | FileState::Closing => Level::Local,
            FileState::Importing => Level::Staging,
            FileState::Imported => Level::Target,
        }
    }

    /// The only state reachable from this one.
    pub fn next(&self) -> Option<FileState> {
        match self {
            FileState::Writing => Some(FileState::Closing),
            FileState::Closing => Some(FileState::Importing),
            FileState::Importing => Some(FileState::Imported),
            FileState::Imported => None,
        }
    }

    pub fn can_transition_to(&self, to: FileState) -> bool {
        self.next() == Some(to)
    }
}

impl SliceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SliceState::Writing => "writing",
            SliceState::Closing => "closing",
            SliceState::Uploading => "uploading",
            SliceState::Uploaded => "uploaded",
            SliceState::Imported => "imported",
        }
    }

    pub fn level(&self) -> Level {
        match self {
            SliceState::Writing | SliceState::Closing | SliceState::Uploading => Level::Local,
            SliceState::Uploaded => Level::Staging,
            SliceState::Imported => Level::Target,
        }
    }

    pub fn next(&self) -> Option<SliceState> {
        match self {
            SliceState::Writing => Some(SliceState::Closing),
            SliceState::Closing => Some(SliceState::Uploading),
            SliceState::Uploading => Some(SliceState::Uploaded),
            SliceState::Uploaded => Some(SliceState::Imported),
            SliceState::Imported => None,
        }
    }

    pub fn can_transition_to(&self, to: SliceState) -> bool {
        self.next() == Some(to)
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for SliceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check that a slice may be in `slice` state while its file is in `file` state.
///
/// | File state        | Allowed slice states                       |
/// |-------------------|--------------------------------------------|
/// | writing, closing  | writing, closing, uploading, uploaded      |
/// | importing         | uploaded                                   |
/// | imported          | imported                                   |
pub fn validate_file_and_slice_states(file: FileState, slice: SliceState) -> StorageResult<()> {
    let valid = match file {
        FileState::Writing | FileState::Closing => matches!(
            slice,
            SliceState::Writing | SliceState::Closing | SliceState::Uploading | SliceState::Uploaded
        ),
        FileState::Importing => slice == SliceState::Uploaded,
        FileState::Imported => slice == SliceState::Imported,
    };

    if valid {
        Ok(())
    } else {
        Err(StorageError::UnexpectedStateCombination {
            file_state: file.to_string(),
            slice_state: slice.to_string(),
        })
    }
}
