//! Volume metadata registered by storage nodes.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One physical volume on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMetadata {
    pub volume_id: VolumeId,
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_address: String,
    pub path: String,
    /// Free-form tag matched against the preferred types, e.g. `ssd`.
    #[serde(rename = "type")]
    pub volume_type: String,
    pub label: String,
}

impl VolumeMetadata {
    pub fn new(
        volume_id: impl Into<String>,
        node_id: impl Into<String>,
        volume_type: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        let volume_type = volume_type.into();
        let label = label.into();
        Self {
            volume_id: VolumeId(volume_id.into()),
            node_id: NodeId(node_id.into()),
            node_address: String::new(),
            path: format!("{volume_type}/{label}"),
            volume_type,
            label,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_shape() {
        let volume = VolumeMetadata::new("my-volume-1", "node-a", "ssd", "1");
        let json = serde_json::to_value(&volume).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "volumeId": "my-volume-1",
                "nodeId": "node-a",
                "path": "ssd/1",
                "type": "ssd",
                "label": "1",
            })
        );
    }
}
