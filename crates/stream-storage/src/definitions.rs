//! Read access to sink definitions.
//!
//! Sinks are managed by the definition service; storage only reads the
//! active ones. [`SinkDefinitions::put`] exists for wiring and tests.

use std::fmt;

use stream_core::{Sink, SinkKey};
use stream_kv::{KvStore, Reader};

use crate::error::{StorageError, StorageResult};
use crate::schema;

#[derive(Clone)]
pub struct SinkDefinitions {
    store: KvStore,
}

impl SinkDefinitions {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    pub fn put(&self, sink: &Sink) -> StorageResult<()> {
        self.store.put(&schema::sink(&sink.key), serde_json::to_string(sink)?)?;
        Ok(())
    }

    pub fn get(&self, key: &SinkKey) -> StorageResult<Sink> {
        self.store
            .get(&schema::sink(key))?
            .ok_or_else(|| StorageError::not_found("sink", key, "source"))?
            .decode()
            .map_err(StorageError::from)
    }

    pub fn list_in(&self, parent: &dyn fmt::Display) -> StorageResult<Vec<Sink>> {
        self.store
            .get_prefix(&schema::sinks_in(parent))?
            .iter()
            .map(|kv| kv.decode().map_err(StorageError::from))
            .collect()
    }
}

/// Read a sink in the read phase of an operation, it must exist.
pub(crate) fn read_sink(reader: &mut Reader, key: &SinkKey) -> StorageResult<Sink> {
    reader
        .get_json::<Sink>(&schema::sink(key))?
        .ok_or_else(|| StorageError::not_found("sink", key, "source"))
}

pub(crate) fn read_sinks_in(reader: &mut Reader, parent: &dyn fmt::Display) -> StorageResult<Vec<Sink>> {
    Ok(reader.list_json::<Sink>(&schema::sinks_in(parent))?)
}
