//! Optimistic atomic operations: read, prepare, write, retry on conflict.
//!
//! An [`AtomicOp`] runs three phases:
//!
//! 1. **read**: a closure reads through a tracking [`Reader`] over one
//!    consistent snapshot;
//! 2. **prepare**: an async closure validates the read values and may call
//!    external services (e.g. create remote resources);
//! 3. **write**: a closure fills a [`WriteBatch`] with puts, deletes and
//!    guards.
//!
//! The batch is committed as one transaction together with tracking
//! compares: every key read must still have the mod revision seen by the
//! reader, and every scanned prefix must still hold the same keys. When a
//! tracking compare fails, a concurrent writer won and the whole cycle runs
//! again from the read phase. When only a guard fails, the guard's own
//! error is returned.

use std::collections::BTreeMap;
use std::future::{Future, Ready, ready};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{KvError, KvResult};
use crate::store::{KvStore, Snapshot};
use crate::types::{Compare, CompareOp, KeyValue, LeaseId, Op, Revision, Txn};

/// Attempts before an operation gives up with [`KvError::RetriesExhausted`].
pub const DEFAULT_MAX_ATTEMPTS: usize = 10;

/// Prepare phase that passes the read result through unchanged.
pub fn no_prepare<R, E>(value: R) -> Ready<Result<R, E>> {
    ready(Ok(value))
}

/// Read access used in the read phase. Tracked reads become commit
/// preconditions.
pub struct Reader {
    snapshot: Snapshot,
    keys: BTreeMap<String, Revision>,
    prefixes: BTreeMap<String, u64>,
}

impl Reader {
    fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot,
            keys: BTreeMap::new(),
            prefixes: BTreeMap::new(),
        }
    }

    /// Revision of the snapshot.
    pub fn revision(&self) -> Revision {
        self.snapshot.revision()
    }

    pub fn get(&mut self, key: &str) -> KvResult<Option<KeyValue>> {
        let value = self.snapshot.get(key)?;
        let mod_revision = value.as_ref().map(|kv| kv.mod_revision).unwrap_or(0);
        self.keys.insert(key.to_string(), mod_revision);
        Ok(value)
    }

    pub fn get_json<T: DeserializeOwned>(&mut self, key: &str) -> KvResult<Option<T>> {
        self.get(key)?.map(|kv| kv.decode()).transpose()
    }

    pub fn get_prefix(&mut self, prefix: &str) -> KvResult<Vec<KeyValue>> {
        let values = self.snapshot.get_prefix(prefix)?;
        self.prefixes.insert(prefix.to_string(), values.len() as u64);
        Ok(values)
    }

    pub fn list_json<T: DeserializeOwned>(&mut self, prefix: &str) -> KvResult<Vec<T>> {
        self.get_prefix(prefix)?.iter().map(KeyValue::decode).collect()
    }

    /// Read without adding a commit precondition.
    pub fn get_untracked(&self, key: &str) -> KvResult<Option<KeyValue>> {
        self.snapshot.get(key)
    }

    /// Scan without adding a commit precondition.
    pub fn get_prefix_untracked(&self, prefix: &str) -> KvResult<Vec<KeyValue>> {
        self.snapshot.get_prefix(prefix)
    }

    fn tracking_compares(&self) -> Vec<Compare> {
        let mut compares = Vec::with_capacity(self.keys.len() + self.prefixes.len() * 2);
        for (key, mod_revision) in &self.keys {
            compares.push(Compare::mod_revision(key.clone(), CompareOp::Equal, *mod_revision));
        }
        let next = self.revision() + 1;
        for (prefix, count) in &self.prefixes {
            compares.push(Compare::prefix_count(prefix.clone(), CompareOp::Equal, *count));
            compares.push(Compare::prefix_mod_revision(prefix.clone(), CompareOp::Less, next));
        }
        compares
    }
}

/// Operations collected in the write phase.
pub struct WriteBatch<E> {
    ops: Vec<Op>,
    guards: Vec<(Compare, E)>,
}

impl<E> Default for WriteBatch<E> {
    fn default() -> Self {
        Self {
            ops: Vec::new(),
            guards: Vec::new(),
        }
    }
}

impl<E> WriteBatch<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.ops.push(Op::put(key, value));
    }

    pub fn put_json<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> KvResult<()> {
        let value = serde_json::to_string(value).map_err(|e| KvError::Serialize(e.to_string()))?;
        self.put(key, value);
        Ok(())
    }

    pub fn put_json_with_lease<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
        lease: LeaseId,
    ) -> KvResult<()> {
        let value = serde_json::to_string(value).map_err(|e| KvError::Serialize(e.to_string()))?;
        self.ops.push(Op::Put {
            key: key.into(),
            value,
            lease: Some(lease),
        });
        Ok(())
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push(Op::Delete(key.into()));
    }

    pub fn delete_prefix(&mut self, prefix: impl Into<String>) {
        self.ops.push(Op::DeletePrefix(prefix.into()));
    }

    /// Commit precondition; `err` is returned if it does not hold.
    pub fn guard(&mut self, compare: Compare, err: E) {
        self.guards.push((compare, err));
    }

    pub fn merge(&mut self, other: WriteBatch<E>) {
        self.ops.extend(other.ops);
        self.guards.extend(other.guards);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.guards.is_empty()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }
}

/// Read → prepare → write cycle, committed atomically and retried on conflict.
pub struct AtomicOp<Rd, Pr, Wr> {
    name: String,
    read: Rd,
    prepare: Pr,
    write: Wr,
    max_attempts: usize,
}

impl<Rd, Pr, Wr> AtomicOp<Rd, Pr, Wr> {
    pub fn new<R, P, T, E, Fut>(name: impl Into<String>, read: Rd, prepare: Pr, write: Wr) -> Self
    where
        Rd: FnMut(&mut Reader) -> Result<R, E>,
        Pr: FnMut(R) -> Fut,
        Fut: Future<Output = Result<P, E>>,
        Wr: FnMut(P, &mut WriteBatch<E>) -> Result<T, E>,
    {
        Self {
            name: name.into(),
            read,
            prepare,
            write,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run until the write commits, a phase fails, or attempts run out.
    pub async fn run<R, P, T, E, Fut>(mut self, store: &KvStore) -> Result<T, E>
    where
        Rd: FnMut(&mut Reader) -> Result<R, E>,
        Pr: FnMut(R) -> Fut,
        Fut: Future<Output = Result<P, E>>,
        Wr: FnMut(P, &mut WriteBatch<E>) -> Result<T, E>,
        E: From<KvError>,
    {
        for attempt in 1..=self.max_attempts {
            let (read, tracking) = {
                let mut reader = Reader::new(store.snapshot()?);
                let read = (self.read)(&mut reader)?;
                (read, reader.tracking_compares())
            };

            let prepared = (self.prepare)(read).await?;

            let mut batch = WriteBatch::new();
            let output = (self.write)(prepared, &mut batch)?;
            if batch.is_empty() {
                return Ok(output);
            }

            let tracked = tracking.len();
            let (guards, mut guard_errors): (Vec<Compare>, Vec<E>) =
                batch.guards.into_iter().unzip();
            let txn = Txn::new().when(tracking).when(guards).and_then(batch.ops);
            let response = store.txn(txn)?;

            if response.succeeded {
                debug!(op = %self.name, attempt, revision = response.revision, "atomic operation committed");
                return Ok(output);
            }

            if response.failed_compares.iter().any(|&index| index < tracked) {
                debug!(op = %self.name, attempt, "atomic operation conflict, retrying");
                continue;
            }

            // Only guards failed: report the first one.
            return match response.failed_compares.first() {
                Some(&index) if index - tracked < guard_errors.len() => {
                    Err(guard_errors.swap_remove(index - tracked))
                }
                _ => Err(KvError::Transaction(format!(
                    "atomic operation \"{}\" rejected without a failed compare",
                    self.name
                ))
                .into()),
            };
        }

        warn!(op = %self.name, attempts = self.max_attempts, "atomic operation retries exhausted");
        Err(KvError::RetriesExhausted {
            op: self.name,
            attempts: self.max_attempts,
        }
        .into())
    }

    /// Like [`AtomicOp::run`], bounded by a deadline. A timed-out operation
    /// never leaves a partially applied transaction.
    pub async fn run_with_deadline<R, P, T, E, Fut>(self, store: &KvStore, deadline: Instant) -> Result<T, E>
    where
        Rd: FnMut(&mut Reader) -> Result<R, E>,
        Pr: FnMut(R) -> Fut,
        Fut: Future<Output = Result<P, E>>,
        Wr: FnMut(P, &mut WriteBatch<E>) -> Result<T, E>,
        E: From<KvError>,
    {
        let name = self.name.clone();
        match tokio::time::timeout_at(deadline, self.run(store)).await {
            Ok(result) => result,
            Err(_) => Err(KvError::DeadlineExceeded { op: name }.into()),
        }
    }
}
