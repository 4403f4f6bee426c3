//! Record and size statistics per slice and storage level.
//!
//! Writer nodes put per-slice values into the `local` level. State
//! transitions that change the level of a slice or file move the values
//! to the new level in the same transaction. When a slice or file is
//! deleted, its `target` values are rolled up into the `_sum` key of the
//! parent object, so totals survive the metadata cleanup.

use std::fmt;

use serde::{Deserialize, Serialize};
use stream_core::{ByteSize, ProjectId, SinkKey, SourceKey, UtcTime};
use stream_kv::{AtomicOp, KeyValue, KvResult, KvStore, Op, Reader, Txn, WriteBatch, no_prepare};
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::file::FileKey;
use crate::level::Level;
use crate::schema;
use crate::slice::SliceKey;

/// Counters of one object in one level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Value {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub slices_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_record_at: Option<UtcTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_record_at: Option<UtcTime>,
    #[serde(default)]
    pub records_count: u64,
    #[serde(default)]
    pub uncompressed_size: ByteSize,
    #[serde(default)]
    pub compressed_size: ByteSize,
    /// Size of the data in the staging storage, set when the data is uploaded.
    #[serde(default, skip_serializing_if = "is_zero_size")]
    pub staging_size: ByteSize,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn is_zero_size(v: &ByteSize) -> bool {
    v.as_u64() == 0
}

impl Value {
    pub fn add(&self, other: &Value) -> Value {
        Value {
            slices_count: self.slices_count + other.slices_count,
            first_record_at: match (self.first_record_at, other.first_record_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
            last_record_at: match (self.last_record_at, other.last_record_at) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
            records_count: self.records_count + other.records_count,
            uncompressed_size: self.uncompressed_size + other.uncompressed_size,
            compressed_size: self.compressed_size + other.compressed_size,
            staging_size: self.staging_size + other.staging_size,
        }
    }

    fn moved_to(mut self, to: Level) -> Value {
        if to == Level::Staging {
            self.staging_size = self.compressed_size;
        }
        self
    }
}

/// Statistics of an object summed per level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Aggregated {
    pub local: Value,
    pub staging: Value,
    pub target: Value,
    pub total: Value,
}

impl Aggregated {
    pub fn add(&mut self, level: Level, value: &Value) {
        let slot = match level {
            Level::Local => &mut self.local,
            Level::Staging => &mut self.staging,
            Level::Target => &mut self.target,
        };
        *slot = slot.add(value);
        self.total = self.total.add(value);
    }

    /// Data not yet imported: local and staging levels.
    pub fn buffered(&self) -> ByteSize {
        self.local.compressed_size + self.staging.compressed_size
    }
}

/// Statistics of one slice reported by a writer node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerSlice {
    pub slice_key: SliceKey,
    pub value: Value,
}

#[derive(Clone)]
pub struct StatisticsRepository {
    store: KvStore,
}

impl StatisticsRepository {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    /// Store local level values of slices, replacing previous values.
    pub fn put(&self, stats: &[PerSlice]) -> StorageResult<()> {
        let mut ops = Vec::with_capacity(stats.len());
        for item in stats {
            let value = serde_json::to_string(&item.value)?;
            ops.push(Op::put(schema::stats_value(Level::Local, &item.slice_key), value));
        }
        let response = self.store.txn(Txn::new().and_then(ops))?;
        debug!(count = stats.len(), revision = response.revision, "statistics stored");
        Ok(())
    }

    pub fn slice_stats(&self, key: &SliceKey) -> StorageResult<Aggregated> {
        self.aggregate_in(key)
    }

    pub fn file_stats(&self, key: &FileKey) -> StorageResult<Aggregated> {
        self.aggregate_in(key)
    }

    pub fn sink_stats(&self, key: &SinkKey) -> StorageResult<Aggregated> {
        self.aggregate_in(key)
    }

    pub fn source_stats(&self, key: &SourceKey) -> StorageResult<Aggregated> {
        self.aggregate_in(key)
    }

    pub fn project_stats(&self, id: ProjectId) -> StorageResult<Aggregated> {
        self.aggregate_in(&id)
    }

    /// Sum of all values and sums under `object`, per level.
    pub fn aggregate_in(&self, object: &dyn fmt::Display) -> StorageResult<Aggregated> {
        let snapshot = self.store.snapshot()?;
        let mut out = Aggregated::default();
        for level in Level::ALL {
            for kv in snapshot.get_prefix(&schema::stats_in(level, object))? {
                out.add(level, &kv.decode::<Value>()?);
            }
        }
        Ok(out)
    }

    /// Largest compressed size among the last `n` slices of the sink in
    /// the `staging` and `target` levels, zero if there are none.
    pub fn max_used_disk_size_by_slice_in(&self, sink: &SinkKey, n: usize) -> StorageResult<ByteSize> {
        let snapshot = self.store.snapshot()?;
        max_used_disk_size(|prefix| snapshot.get_prefix(prefix), sink, n)
    }

    /// Fail if the data buffered for the sink exceeds `limit`.
    pub fn check_sink_quota(&self, sink: &SinkKey, limit: ByteSize) -> StorageResult<()> {
        let buffered = self.sink_stats(sink)?.buffered();
        if buffered > limit {
            return Err(StorageError::QuotaExceeded {
                sink: sink.to_string(),
                buffered,
                limit,
            });
        }
        Ok(())
    }

    /// Move the values of a slice between levels.
    pub async fn move_slice(&self, key: &SliceKey, from: Level, to: Level) -> StorageResult<()> {
        AtomicOp::new(
            "statistics.move",
            |reader: &mut Reader| read_move(reader, key, from, to),
            no_prepare,
            |update: StatsUpdate, batch: &mut WriteBatch<StorageError>| update.apply(batch),
        )
        .run(&self.store)
        .await
    }

    /// Move the values of all slices under `object` between levels.
    pub async fn move_all(&self, object: &dyn fmt::Display, from: Level, to: Level) -> StorageResult<()> {
        AtomicOp::new(
            "statistics.move_all",
            |reader: &mut Reader| read_move_all(reader, object, from, to),
            no_prepare,
            |update: StatsUpdate, batch: &mut WriteBatch<StorageError>| update.apply(batch),
        )
        .run(&self.store)
        .await
    }

    /// Delete the values of a slice, the `target` value is kept in the file sum.
    pub async fn delete_slice(&self, key: &SliceKey) -> StorageResult<()> {
        AtomicOp::new(
            "statistics.delete_slice",
            |reader: &mut Reader| read_delete_slice(reader, key),
            no_prepare,
            |update: StatsUpdate, batch: &mut WriteBatch<StorageError>| update.apply(batch),
        )
        .run(&self.store)
        .await
    }

    /// Delete the values of a file, the `target` values are kept in the sink sum.
    pub async fn delete_file(&self, key: &FileKey) -> StorageResult<()> {
        AtomicOp::new(
            "statistics.delete_file",
            |reader: &mut Reader| read_delete_file(reader, key),
            no_prepare,
            |update: StatsUpdate, batch: &mut WriteBatch<StorageError>| update.apply(batch),
        )
        .run(&self.store)
        .await
    }
}

pub(crate) fn max_used_disk_size<F>(scan: F, sink: &SinkKey, n: usize) -> StorageResult<ByteSize>
where
    F: Fn(&str) -> KvResult<Vec<KeyValue>>,
{
    let mut max = ByteSize(0);
    for level in [Level::Staging, Level::Target] {
        let values: Vec<KeyValue> = scan(&schema::stats_in(level, sink))?
            .into_iter()
            .filter(|kv| kv.key.ends_with(&format!("/{}", schema::STATS_VALUE)))
            .collect();
        let skip = values.len().saturating_sub(n);
        for kv in &values[skip..] {
            max = max.max(kv.decode::<Value>()?.compressed_size);
        }
    }
    Ok(max)
}

// ── In-transaction updates ──────────────────────────────────────────

/// Statistics changes prepared in the read phase of an operation and
/// applied in its write phase.
#[derive(Debug, Default)]
pub(crate) struct StatsUpdate {
    puts: Vec<(String, Value)>,
    deletes: Vec<String>,
    delete_prefixes: Vec<String>,
}

impl StatsUpdate {
    pub(crate) fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty() && self.delete_prefixes.is_empty()
    }

    pub(crate) fn apply(self, batch: &mut WriteBatch<StorageError>) -> StorageResult<()> {
        for key in self.deletes {
            batch.delete(key);
        }
        for prefix in self.delete_prefixes {
            batch.delete_prefix(prefix);
        }
        for (key, value) in self.puts {
            batch.put_json(key, &value)?;
        }
        Ok(())
    }
}

pub(crate) fn read_move(reader: &mut Reader, key: &SliceKey, from: Level, to: Level) -> StorageResult<StatsUpdate> {
    let mut update = StatsUpdate::default();
    if from == to {
        return Ok(update);
    }

    let from_key = schema::stats_value(from, key);
    if let Some(value) = reader.get_json::<Value>(&from_key)? {
        update.puts.push((schema::stats_value(to, key), value.moved_to(to)));
        update.deletes.push(from_key);
    }
    Ok(update)
}

pub(crate) fn read_move_all(
    reader: &mut Reader,
    object: &dyn fmt::Display,
    from: Level,
    to: Level,
) -> StorageResult<StatsUpdate> {
    let mut update = StatsUpdate::default();
    if from == to {
        return Ok(update);
    }

    let from_level = schema::stats_level(from);
    let to_level = schema::stats_level(to);
    for kv in reader.get_prefix(&schema::stats_in(from, object))? {
        let Some(relative) = kv.key.strip_prefix(&from_level) else {
            continue;
        };
        let value = kv.decode::<Value>()?.moved_to(to);
        update.puts.push((format!("{to_level}{relative}"), value));
        update.deletes.push(kv.key);
    }
    Ok(update)
}

/// Delete all values of a slice, the `target` value is added to the file sum.
pub(crate) fn read_delete_slice(reader: &mut Reader, key: &SliceKey) -> StorageResult<StatsUpdate> {
    let mut update = StatsUpdate::default();
    if let Some(value) = reader.get_json::<Value>(&schema::stats_value(Level::Target, key))? {
        let sum_key = schema::stats_sum(Level::Target, key.file_key());
        let sum = reader.get_json::<Value>(&sum_key)?.unwrap_or_default();
        update.puts.push((sum_key, sum.add(&value)));
    }
    for level in Level::ALL {
        update.delete_prefixes.push(schema::stats_in(level, key));
    }
    Ok(update)
}

/// Delete all values of a file, the `target` values are added to the sink sum.
pub(crate) fn read_delete_file(reader: &mut Reader, key: &FileKey) -> StorageResult<StatsUpdate> {
    let mut update = StatsUpdate::default();
    let target = reader.get_prefix(&schema::stats_in(Level::Target, key))?;
    if !target.is_empty() {
        let mut rollup = Value::default();
        for kv in &target {
            rollup = rollup.add(&kv.decode::<Value>()?);
        }
        let sum_key = schema::stats_sum(Level::Target, &key.sink_key);
        let sum = reader.get_json::<Value>(&sum_key)?.unwrap_or_default();
        update.puts.push((sum_key, sum.add(&rollup)));
    }
    for level in Level::ALL {
        update.delete_prefixes.push(schema::stats_in(level, key));
    }
    Ok(update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_core::{BranchKey, SourceKey};

    use crate::slice::FileVolumeKey;

    fn time(s: &str) -> UtcTime {
        UtcTime::parse(s).unwrap()
    }

    fn sink_key() -> SinkKey {
        SinkKey::new(SourceKey::new(BranchKey::new(123, 456), "my-source"), "my-sink")
    }

    fn slice_key(opened_at: &str) -> SliceKey {
        let file = FileKey::new(sink_key(), time("2000-01-01T00:00:00.000Z"));
        SliceKey::new(FileVolumeKey::new(file, "my-volume"), time(opened_at))
    }

    fn value(compressed: u64) -> Value {
        Value {
            slices_count: 1,
            first_record_at: Some(time("2000-01-01T01:00:00.000Z")),
            last_record_at: Some(time("2000-01-01T02:00:00.000Z")),
            records_count: 1,
            uncompressed_size: ByteSize(1),
            compressed_size: ByteSize(compressed),
            staging_size: ByteSize(0),
        }
    }

    #[test]
    fn test_value_add() {
        let a = Value {
            first_record_at: Some(time("2000-01-01T01:00:00.000Z")),
            last_record_at: Some(time("2000-01-01T02:00:00.000Z")),
            ..value(10)
        };
        let b = Value {
            first_record_at: Some(time("2000-01-01T00:30:00.000Z")),
            last_record_at: Some(time("2000-01-01T01:30:00.000Z")),
            ..value(20)
        };
        let sum = a.add(&b).add(&Value::default());
        assert_eq!(sum.slices_count, 2);
        assert_eq!(sum.records_count, 2);
        assert_eq!(sum.compressed_size, ByteSize(30));
        assert_eq!(sum.first_record_at, Some(time("2000-01-01T00:30:00.000Z")));
        assert_eq!(sum.last_record_at, Some(time("2000-01-01T02:00:00.000Z")));
    }

    #[test]
    fn test_value_json() {
        let json = serde_json::to_string(&value(10)).unwrap();
        assert_eq!(
            json,
            r#"{"slicesCount":1,"firstRecordAt":"2000-01-01T01:00:00.000Z","lastRecordAt":"2000-01-01T02:00:00.000Z","recordsCount":1,"uncompressedSize":"1B","compressedSize":"10B"}"#
        );
    }

    #[tokio::test]
    async fn test_put_move_aggregate() {
        let repo = StatisticsRepository::new(KvStore::open_in_memory().unwrap());
        let k1 = slice_key("2000-01-01T01:00:00.000Z");
        let k2 = slice_key("2000-01-01T02:00:00.000Z");
        repo.put(&[
            PerSlice { slice_key: k1.clone(), value: value(100) },
            PerSlice { slice_key: k2.clone(), value: value(200) },
        ])
        .unwrap();

        repo.move_slice(&k1, Level::Local, Level::Staging).await.unwrap();

        let stats = repo.sink_stats(&sink_key()).unwrap();
        assert_eq!(stats.local.compressed_size, ByteSize(200));
        assert_eq!(stats.staging.compressed_size, ByteSize(100));
        assert_eq!(stats.staging.staging_size, ByteSize(100));
        assert_eq!(stats.total.slices_count, 2);
        assert_eq!(stats.total.compressed_size, ByteSize(300));

        let slice = repo.slice_stats(&k1).unwrap();
        assert_eq!(slice.local, Value::default());
        assert_eq!(slice.staging.compressed_size, ByteSize(100));

        // Missing source values are not an error.
        repo.move_slice(&k1, Level::Local, Level::Staging).await.unwrap();
        assert_eq!(repo.sink_stats(&sink_key()).unwrap(), stats);
    }

    #[tokio::test]
    async fn test_move_all() {
        let repo = StatisticsRepository::new(KvStore::open_in_memory().unwrap());
        let k1 = slice_key("2000-01-01T01:00:00.000Z");
        let k2 = slice_key("2000-01-01T02:00:00.000Z");
        repo.put(&[
            PerSlice { slice_key: k1.clone(), value: value(100) },
            PerSlice { slice_key: k2.clone(), value: value(200) },
        ])
        .unwrap();

        repo.move_all(k1.file_key(), Level::Local, Level::Staging).await.unwrap();
        repo.move_all(k1.file_key(), Level::Staging, Level::Target).await.unwrap();

        let stats = repo.file_stats(k1.file_key()).unwrap();
        assert_eq!(stats.local, Value::default());
        assert_eq!(stats.staging, Value::default());
        assert_eq!(stats.target.compressed_size, ByteSize(300));
        assert_eq!(stats.target.staging_size, ByteSize(300));
    }

    #[tokio::test]
    async fn test_delete_rolls_up_target() {
        let repo = StatisticsRepository::new(KvStore::open_in_memory().unwrap());
        let k1 = slice_key("2000-01-01T01:00:00.000Z");
        let k2 = slice_key("2000-01-01T02:00:00.000Z");
        repo.put(&[
            PerSlice { slice_key: k1.clone(), value: value(100) },
            PerSlice { slice_key: k2.clone(), value: value(200) },
        ])
        .unwrap();
        repo.move_slice(&k1, Level::Local, Level::Target).await.unwrap();

        // Only the target value survives in the file sum.
        repo.delete_slice(&k1).await.unwrap();
        repo.delete_slice(&k2).await.unwrap();
        let file = repo.file_stats(k1.file_key()).unwrap();
        assert_eq!(file.local, Value::default());
        assert_eq!(file.target.compressed_size, ByteSize(100));
        assert_eq!(repo.slice_stats(&k1).unwrap(), Aggregated::default());

        repo.delete_file(k1.file_key()).await.unwrap();
        assert_eq!(repo.file_stats(k1.file_key()).unwrap(), Aggregated::default());
        let sink = repo.sink_stats(&sink_key()).unwrap();
        assert_eq!(sink.target.compressed_size, ByteSize(100));
        assert_eq!(sink.total.slices_count, 1);
    }

    #[tokio::test]
    async fn test_max_used_disk_size_by_slice_in() {
        let repo = StatisticsRepository::new(KvStore::open_in_memory().unwrap());
        assert_eq!(repo.max_used_disk_size_by_slice_in(&sink_key(), 3).unwrap(), ByteSize(0));

        let sizes = [10, 500, 400, 20, 30, 300];
        let keys: Vec<SliceKey> = (1..=6)
            .map(|h| slice_key(&format!("2000-01-01T0{h}:00:00.000Z")))
            .collect();
        let stats: Vec<PerSlice> = keys
            .iter()
            .zip(sizes)
            .map(|(k, size)| PerSlice { slice_key: k.clone(), value: value(size) })
            .collect();
        repo.put(&stats).unwrap();

        for key in &keys {
            repo.move_slice(key, Level::Local, Level::Staging).await.unwrap();
        }
        for i in [1, 3, 5] {
            repo.move_slice(&keys[i], Level::Staging, Level::Target).await.unwrap();
        }

        let max = |n| repo.max_used_disk_size_by_slice_in(&sink_key(), n).unwrap();
        assert_eq!(max(1), ByteSize(300));
        assert_eq!(max(2), ByteSize(400));
        assert_eq!(max(3), ByteSize(500));
    }

    #[test]
    fn test_check_sink_quota() {
        let repo = StatisticsRepository::new(KvStore::open_in_memory().unwrap());
        let limit = ByteSize::kb(1000);
        let mut big = value(0);
        big.compressed_size = ByteSize::kb(600);

        repo.put(&[PerSlice { slice_key: slice_key("2000-01-01T01:00:00.000Z"), value: big.clone() }])
            .unwrap();
        repo.check_sink_quota(&sink_key(), limit).unwrap();

        repo.put(&[PerSlice { slice_key: slice_key("2000-01-01T02:00:00.000Z"), value: big }])
            .unwrap();
        let err = repo.check_sink_quota(&sink_key(), limit).unwrap_err();
        assert_eq!(
            err.to_string(),
            "no free space in the buffer: the \"123/456/my-source/my-sink\" sink has \"1200KB\" buffered for upload, limit is \"1000KB\""
        );
    }
}
