//! Groups of sinks an operation applies to.

use std::fmt;

use stream_core::{BranchKey, ProjectId, SinkKey, SourceKey};

/// A project, branch, source or a single sink.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParentKey {
    Project(ProjectId),
    Branch(BranchKey),
    Source(SourceKey),
    Sink(SinkKey),
}

impl fmt::Display for ParentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParentKey::Project(id) => fmt::Display::fmt(id, f),
            ParentKey::Branch(key) => fmt::Display::fmt(key, f),
            ParentKey::Source(key) => fmt::Display::fmt(key, f),
            ParentKey::Sink(key) => fmt::Display::fmt(key, f),
        }
    }
}

impl From<ProjectId> for ParentKey {
    fn from(id: ProjectId) -> Self {
        ParentKey::Project(id)
    }
}

impl From<BranchKey> for ParentKey {
    fn from(key: BranchKey) -> Self {
        ParentKey::Branch(key)
    }
}

impl From<SourceKey> for ParentKey {
    fn from(key: SourceKey) -> Self {
        ParentKey::Source(key)
    }
}

impl From<SinkKey> for ParentKey {
    fn from(key: SinkKey) -> Self {
        ParentKey::Sink(key)
    }
}
