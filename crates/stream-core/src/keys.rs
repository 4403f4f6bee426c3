//! Hierarchical object keys: project / branch / source / sink.
//!
//! Each key renders as its parent key plus one `/`-separated segment, so a
//! key string is always a prefix of its descendants' key strings.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SinkId(pub String);

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&str> for SinkId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchKey {
    pub project_id: ProjectId,
    pub branch_id: BranchId,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceKey {
    #[serde(flatten)]
    pub branch_key: BranchKey,
    pub source_id: SourceId,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkKey {
    #[serde(flatten)]
    pub source_key: SourceKey,
    pub sink_id: SinkId,
}

impl BranchKey {
    pub fn new(project_id: u64, branch_id: u64) -> Self {
        Self {
            project_id: ProjectId(project_id),
            branch_id: BranchId(branch_id),
        }
    }
}

impl SourceKey {
    pub fn new(branch_key: BranchKey, source_id: impl Into<String>) -> Self {
        Self {
            branch_key,
            source_id: SourceId(source_id.into()),
        }
    }
}

impl SinkKey {
    pub fn new(source_key: SourceKey, sink_id: impl Into<String>) -> Self {
        Self {
            source_key,
            sink_id: SinkId(sink_id.into()),
        }
    }

    pub fn project_id(&self) -> ProjectId {
        self.source_key.branch_key.project_id
    }

    pub fn branch_key(&self) -> BranchKey {
        self.source_key.branch_key
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for BranchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.branch_id)
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.branch_key, self.source_id)
    }
}

impl fmt::Display for SinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_key, self.sink_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink_key() -> SinkKey {
        SinkKey::new(SourceKey::new(BranchKey::new(123, 456), "my-source"), "my-sink")
    }

    #[test]
    fn display_is_path_of_parents() {
        let key = sink_key();
        assert_eq!(key.to_string(), "123/456/my-source/my-sink");
        assert!(key.to_string().starts_with(&key.source_key.to_string()));
        assert!(key.to_string().starts_with(&key.branch_key().to_string()));
    }

    #[test]
    fn json_fields_are_flattened() {
        let json = serde_json::to_value(sink_key()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "projectId": 123,
                "branchId": 456,
                "sourceId": "my-source",
                "sinkId": "my-sink",
            })
        );
        let back: SinkKey = serde_json::from_value(json).unwrap();
        assert_eq!(back, sink_key());
    }
}
