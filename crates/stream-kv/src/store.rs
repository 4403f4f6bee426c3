//! KvStore — redb-backed transactional key-value store.
//!
//! Every write goes through [`KvStore::txn`]: compares are evaluated and the
//! selected branch of operations is applied inside one redb write
//! transaction, so a transaction is either fully applied or not at all.
//! Transactions with at least one effective write bump the global revision
//! by one. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use redb::{Database, ReadOnlyTable, ReadTransaction, ReadableDatabase, ReadableTable, Table};
use tracing::{debug, info};

use crate::error::{KvError, KvResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `KvError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| KvError::$variant(e.to_string())
    };
}

type KvTable<'txn> = Table<'txn, &'static str, &'static [u8]>;
type LeaseTable<'txn> = Table<'txn, u64, &'static [u8]>;

/// Thread-safe metadata store backed by redb.
#[derive(Clone)]
pub struct KvStore {
    db: Arc<Database>,
}

/// Consistent read view of the store at one revision.
pub struct Snapshot {
    revision: Revision,
    kv: ReadOnlyTable<&'static str, &'static [u8]>,
    _txn: ReadTransaction,
}

impl KvStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> KvResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "metadata store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> KvResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory metadata store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> KvResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(KV).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.open_table(LEASES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Open a consistent read view.
    pub fn snapshot(&self) -> KvResult<Snapshot> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let revision = {
            let meta = txn.open_table(META).map_err(map_err!(Table))?;
            meta.get(META_REVISION)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0)
        };
        let kv = txn.open_table(KV).map_err(map_err!(Table))?;
        Ok(Snapshot {
            revision,
            kv,
            _txn: txn,
        })
    }

    /// Revision of the last committed write.
    pub fn revision(&self) -> KvResult<Revision> {
        Ok(self.snapshot()?.revision())
    }

    pub fn get(&self, key: &str) -> KvResult<Option<KeyValue>> {
        self.snapshot()?.get(key)
    }

    /// All keys with the prefix, in key order.
    pub fn get_prefix(&self, prefix: &str) -> KvResult<Vec<KeyValue>> {
        self.snapshot()?.get_prefix(prefix)
    }

    /// Unconditional put, returns the new revision.
    pub fn put(&self, key: &str, value: impl Into<String>) -> KvResult<Revision> {
        let resp = self.txn(Txn::new().and_then([Op::put(key, value)]))?;
        Ok(resp.revision)
    }

    /// Unconditional delete. Returns true if the key existed.
    pub fn delete(&self, key: &str) -> KvResult<bool> {
        let resp = self.txn(Txn::new().and_then([Op::Delete(key.to_string())]))?;
        Ok(matches!(resp.responses.first(), Some(OpResponse::Delete { deleted }) if *deleted > 0))
    }

    /// Evaluate the compares and apply the matching branch atomically.
    pub fn txn(&self, txn: Txn) -> KvResult<TxnResponse> {
        let wtx = self.db.begin_write().map_err(map_err!(Transaction))?;
        let response = {
            let mut kv = wtx.open_table(KV).map_err(map_err!(Table))?;
            let mut meta = wtx.open_table(META).map_err(map_err!(Table))?;
            let mut leases = wtx.open_table(LEASES).map_err(map_err!(Table))?;

            let current = meta
                .get(META_REVISION)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);

            let mut failed_compares = Vec::new();
            for (index, compare) in txn.compares.iter().enumerate() {
                if !evaluate(&kv, compare)? {
                    failed_compares.push(index);
                }
            }

            let succeeded = failed_compares.is_empty();
            let ops = if succeeded { &txn.success } else { &txn.failure };
            let next = current + 1;
            let mut changed = false;
            let mut responses = Vec::with_capacity(ops.len());
            for op in ops {
                responses.push(apply_op(&mut kv, &mut leases, op, next, &mut changed)?);
            }

            let revision = if changed {
                meta.insert(META_REVISION, next).map_err(map_err!(Write))?;
                next
            } else {
                current
            };

            TxnResponse {
                succeeded,
                revision,
                failed_compares,
                responses,
            }
        };
        wtx.commit().map_err(map_err!(Transaction))?;
        debug!(
            succeeded = response.succeeded,
            revision = response.revision,
            "txn committed"
        );
        Ok(response)
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Grant a new lease expiring `ttl` after `now`.
    pub fn grant_lease(&self, ttl: Duration, now: DateTime<Utc>) -> KvResult<LeaseId> {
        let wtx = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id = {
            let mut meta = wtx.open_table(META).map_err(map_err!(Table))?;
            let mut leases = wtx.open_table(LEASES).map_err(map_err!(Table))?;
            new_lease(&mut meta, &mut leases, ttl, now)?
        };
        wtx.commit().map_err(map_err!(Transaction))?;
        debug!(lease = id, ttl_seconds = ttl.as_secs(), "lease granted");
        Ok(id)
    }

    /// Grant a new lease and put the key under it in one write.
    pub fn put_with_new_lease(
        &self,
        key: &str,
        value: impl Into<String>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> KvResult<(LeaseId, Revision)> {
        let wtx = self.db.begin_write().map_err(map_err!(Transaction))?;
        let (id, revision) = {
            let mut kv = wtx.open_table(KV).map_err(map_err!(Table))?;
            let mut meta = wtx.open_table(META).map_err(map_err!(Table))?;
            let mut leases = wtx.open_table(LEASES).map_err(map_err!(Table))?;
            let id = new_lease(&mut meta, &mut leases, ttl, now)?;

            let next = meta
                .get(META_REVISION)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0)
                + 1;
            let op = Op::Put {
                key: key.to_string(),
                value: value.into(),
                lease: Some(id),
            };
            let mut changed = false;
            apply_op(&mut kv, &mut leases, &op, next, &mut changed)?;
            meta.insert(META_REVISION, next).map_err(map_err!(Write))?;
            (id, next)
        };
        wtx.commit().map_err(map_err!(Transaction))?;
        debug!(lease = id, key, revision, "key put under new lease");
        Ok((id, revision))
    }

    /// Extend the lease by its TTL, counted from `now`.
    pub fn keep_alive(&self, id: LeaseId, now: DateTime<Utc>) -> KvResult<()> {
        let wtx = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut leases = wtx.open_table(LEASES).map_err(map_err!(Table))?;
            let mut lease = load_lease(&leases, id)?.ok_or(KvError::LeaseNotFound(id))?;
            lease.expires_at = expires_at(now, Duration::from_secs(lease.ttl_seconds));
            save_lease(&mut leases, &lease)?;
        }
        wtx.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Revoke the lease and delete all keys still attached to it.
    /// Returns the number of deleted keys.
    pub fn revoke_lease(&self, id: LeaseId) -> KvResult<usize> {
        let deleted = self.revoke_where(|lease| lease.id == id)?;
        match deleted.first() {
            Some((_, count)) => Ok(*count),
            None => Err(KvError::LeaseNotFound(id)),
        }
    }

    /// Revoke all leases expired at `now`. Returns their IDs.
    pub fn expire_leases(&self, now: DateTime<Utc>) -> KvResult<Vec<LeaseId>> {
        let expired = self.revoke_where(|lease| lease.expires_at <= now)?;
        let ids: Vec<LeaseId> = expired.into_iter().map(|(id, _)| id).collect();
        if !ids.is_empty() {
            info!(leases = ?ids, "expired leases revoked");
        }
        Ok(ids)
    }

    fn revoke_where(&self, predicate: impl Fn(&Lease) -> bool) -> KvResult<Vec<(LeaseId, usize)>> {
        let wtx = self.db.begin_write().map_err(map_err!(Transaction))?;
        let revoked = {
            let mut kv = wtx.open_table(KV).map_err(map_err!(Table))?;
            let mut meta = wtx.open_table(META).map_err(map_err!(Table))?;
            let mut leases = wtx.open_table(LEASES).map_err(map_err!(Table))?;

            let mut matching = Vec::new();
            for entry in leases.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let lease: Lease =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if predicate(&lease) {
                    matching.push(lease);
                }
            }

            let mut revoked = Vec::with_capacity(matching.len());
            let mut total = 0;
            for lease in matching {
                let mut count = 0;
                for key in &lease.keys {
                    let attached = load(&kv, key)?.is_some_and(|v| v.lease == Some(lease.id));
                    if attached {
                        kv.remove(key.as_str()).map_err(map_err!(Write))?;
                        count += 1;
                    }
                }
                leases.remove(lease.id).map_err(map_err!(Write))?;
                total += count;
                revoked.push((lease.id, count));
            }

            if total > 0 {
                let current = meta
                    .get(META_REVISION)
                    .map_err(map_err!(Read))?
                    .map(|guard| guard.value())
                    .unwrap_or(0);
                meta.insert(META_REVISION, current + 1)
                    .map_err(map_err!(Write))?;
            }
            revoked
        };
        wtx.commit().map_err(map_err!(Transaction))?;
        Ok(revoked)
    }
}

impl Snapshot {
    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn get(&self, key: &str) -> KvResult<Option<KeyValue>> {
        Ok(load(&self.kv, key)?.map(|v| v.into_key_value(key.to_string())))
    }

    pub fn get_prefix(&self, prefix: &str) -> KvResult<Vec<KeyValue>> {
        Ok(scan(&self.kv, prefix)?
            .into_iter()
            .map(|(key, v)| v.into_key_value(key))
            .collect())
    }
}

fn new_lease(
    meta: &mut Table<'_, &'static str, u64>,
    leases: &mut LeaseTable<'_>,
    ttl: Duration,
    now: DateTime<Utc>,
) -> KvResult<LeaseId> {
    let id = meta
        .get(META_LEASE_SEQ)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0)
        + 1;
    meta.insert(META_LEASE_SEQ, id).map_err(map_err!(Write))?;
    save_lease(
        leases,
        &Lease {
            id,
            ttl_seconds: ttl.as_secs(),
            expires_at: expires_at(now, ttl),
            keys: Vec::new(),
        },
    )?;
    Ok(id)
}

fn expires_at(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn decode_stored(bytes: &[u8]) -> KvResult<StoredValue> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn load<T: ReadableTable<&'static str, &'static [u8]>>(
    table: &T,
    key: &str,
) -> KvResult<Option<StoredValue>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode_stored(guard.value())?)),
        None => Ok(None),
    }
}

fn scan<T: ReadableTable<&'static str, &'static [u8]>>(
    table: &T,
    prefix: &str,
) -> KvResult<Vec<(String, StoredValue)>> {
    let mut results = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        results.push((key.to_string(), decode_stored(value.value())?));
    }
    Ok(results)
}

fn compare_field(value: &StoredValue, target: CompareTarget) -> u64 {
    match target {
        CompareTarget::ModRevision => value.mod_revision,
        CompareTarget::CreateRevision => value.create_revision,
        CompareTarget::Version => value.version,
        CompareTarget::Count => 1,
    }
}

fn evaluate<T: ReadableTable<&'static str, &'static [u8]>>(
    table: &T,
    compare: &Compare,
) -> KvResult<bool> {
    match &compare.scope {
        CompareScope::Key(key) => {
            let actual = load(table, key)?
                .map(|v| compare_field(&v, compare.target))
                .unwrap_or(0);
            Ok(compare.op.eval(actual, compare.value))
        }
        CompareScope::Prefix(prefix) => {
            let values = scan(table, prefix)?;
            if compare.target == CompareTarget::Count {
                return Ok(compare.op.eval(values.len() as u64, compare.value));
            }
            if values.is_empty() {
                return Ok(compare.op.eval(0, compare.value));
            }
            Ok(values
                .iter()
                .all(|(_, v)| compare.op.eval(compare_field(v, compare.target), compare.value)))
        }
    }
}

fn apply_op(
    kv: &mut KvTable<'_>,
    leases: &mut LeaseTable<'_>,
    op: &Op,
    revision: Revision,
    changed: &mut bool,
) -> KvResult<OpResponse> {
    match op {
        Op::Get(key) => Ok(OpResponse::Get(
            load(&*kv, key)?.map(|v| v.into_key_value(key.clone())),
        )),
        Op::GetPrefix(prefix) => Ok(OpResponse::GetPrefix(
            scan(&*kv, prefix)?
                .into_iter()
                .map(|(key, v)| v.into_key_value(key))
                .collect(),
        )),
        Op::Put { key, value, lease } => {
            if let Some(id) = lease {
                let mut stored_lease = load_lease(&*leases, *id)?.ok_or(KvError::LeaseNotFound(*id))?;
                if !stored_lease.keys.contains(key) {
                    stored_lease.keys.push(key.clone());
                    save_lease(leases, &stored_lease)?;
                }
            }
            let prev = load(&*kv, key)?;
            let stored = StoredValue {
                value: value.clone(),
                create_revision: prev.as_ref().map(|p| p.create_revision).unwrap_or(revision),
                mod_revision: revision,
                version: prev.as_ref().map(|p| p.version).unwrap_or(0) + 1,
                lease: *lease,
            };
            let bytes = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            kv.insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
            *changed = true;
            Ok(OpResponse::Put)
        }
        Op::Delete(key) => {
            let existed = kv.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
            *changed |= existed;
            Ok(OpResponse::Delete {
                deleted: usize::from(existed),
            })
        }
        Op::DeletePrefix(prefix) => {
            let keys: Vec<String> = scan(&*kv, prefix)?.into_iter().map(|(k, _)| k).collect();
            for key in &keys {
                kv.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            *changed |= !keys.is_empty();
            Ok(OpResponse::Delete {
                deleted: keys.len(),
            })
        }
    }
}

fn load_lease<T: ReadableTable<u64, &'static [u8]>>(table: &T, id: LeaseId) -> KvResult<Option<Lease>> {
    match table.get(id).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(
            serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
        )),
        None => Ok(None),
    }
}

fn save_lease(table: &mut LeaseTable<'_>, lease: &Lease) -> KvResult<()> {
    let bytes = serde_json::to_vec(lease).map_err(map_err!(Serialize))?;
    table
        .insert(lease.id, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}
