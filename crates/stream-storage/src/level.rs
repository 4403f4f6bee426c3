//! Storage levels a record passes through.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where the data of a file or slice currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Buffered on a local disk of a writer node.
    Local,
    /// Uploaded to the staging object storage.
    Staging,
    /// Imported into the destination table.
    Target,
}

impl Level {
    pub const ALL: [Level; 3] = [Level::Local, Level::Staging, Level::Target];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Local => "local",
            Level::Staging => "staging",
            Level::Target => "target",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
