//! Values, compares, operations and responses of the metadata store.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{KvError, KvResult};

pub type Revision = u64;
pub type LeaseId = u64;

/// Persisted form of a value, with its revision metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredValue {
    pub value: String,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<LeaseId>,
}

impl StoredValue {
    pub(crate) fn into_key_value(self, key: String) -> KeyValue {
        KeyValue {
            key,
            value: self.value,
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
            version: self.version,
            lease: self.lease,
        }
    }
}

/// A key with its current value and revision metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Revision of the transaction that created the key.
    pub create_revision: Revision,
    /// Revision of the transaction that last modified the key.
    pub mod_revision: Revision,
    /// Number of modifications since creation, starting at 1.
    pub version: u64,
    pub lease: Option<LeaseId>,
}

impl KeyValue {
    /// Decode the JSON value.
    pub fn decode<T: DeserializeOwned>(&self) -> KvResult<T> {
        serde_json::from_str(&self.value)
            .map_err(|e| KvError::Deserialize(format!("key \"{}\": {e}", self.key)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Lease {
    pub id: LeaseId,
    pub ttl_seconds: u64,
    pub expires_at: DateTime<Utc>,
    pub keys: Vec<String>,
}

/// Which keys a compare is evaluated on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareScope {
    Key(String),
    /// Every key with the prefix must satisfy the compare.
    /// An empty prefix compares as a single zero value.
    Prefix(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareTarget {
    ModRevision,
    CreateRevision,
    Version,
    /// Number of keys in the scope.
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    Less,
}

impl CompareOp {
    pub fn eval(&self, actual: u64, expected: u64) -> bool {
        match self {
            CompareOp::Equal => actual == expected,
            CompareOp::NotEqual => actual != expected,
            CompareOp::Greater => actual > expected,
            CompareOp::Less => actual < expected,
        }
    }
}

/// A transaction precondition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub scope: CompareScope,
    pub target: CompareTarget,
    pub op: CompareOp,
    pub value: u64,
}

impl Compare {
    pub fn mod_revision(key: impl Into<String>, op: CompareOp, value: Revision) -> Self {
        Self {
            scope: CompareScope::Key(key.into()),
            target: CompareTarget::ModRevision,
            op,
            value,
        }
    }

    pub fn create_revision(key: impl Into<String>, op: CompareOp, value: Revision) -> Self {
        Self {
            scope: CompareScope::Key(key.into()),
            target: CompareTarget::CreateRevision,
            op,
            value,
        }
    }

    pub fn version(key: impl Into<String>, op: CompareOp, value: u64) -> Self {
        Self {
            scope: CompareScope::Key(key.into()),
            target: CompareTarget::Version,
            op,
            value,
        }
    }

    pub fn prefix_mod_revision(prefix: impl Into<String>, op: CompareOp, value: Revision) -> Self {
        Self {
            scope: CompareScope::Prefix(prefix.into()),
            target: CompareTarget::ModRevision,
            op,
            value,
        }
    }

    pub fn prefix_count(prefix: impl Into<String>, op: CompareOp, value: u64) -> Self {
        Self {
            scope: CompareScope::Prefix(prefix.into()),
            target: CompareTarget::Count,
            op,
            value,
        }
    }

    /// The key must not exist.
    pub fn not_exists(key: impl Into<String>) -> Self {
        Self::mod_revision(key, CompareOp::Equal, 0)
    }

    /// The key must exist.
    pub fn exists(key: impl Into<String>) -> Self {
        Self::mod_revision(key, CompareOp::Greater, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Get(String),
    GetPrefix(String),
    Put {
        key: String,
        value: String,
        lease: Option<LeaseId>,
    },
    Delete(String),
    DeletePrefix(String),
}

impl Op {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Op::Put {
            key: key.into(),
            value: value.into(),
            lease: None,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Op::Get(_) | Op::GetPrefix(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResponse {
    Get(Option<KeyValue>),
    GetPrefix(Vec<KeyValue>),
    Put,
    Delete { deleted: usize },
}

/// Compares plus the operations executed when all compares hold
/// (`success`) or when any of them fails (`failure`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<Op>,
    pub failure: Vec<Op>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compares: impl IntoIterator<Item = Compare>) -> Self {
        self.compares.extend(compares);
        self
    }

    pub fn and_then(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.success.extend(ops);
        self
    }

    pub fn or_else(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.failure.extend(ops);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnResponse {
    pub succeeded: bool,
    /// Store revision after the transaction.
    pub revision: Revision,
    /// Indexes of the compares that did not hold.
    pub failed_compares: Vec<usize>,
    pub responses: Vec<OpResponse>,
}
