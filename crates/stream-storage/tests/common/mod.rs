//! Shared fixtures for the storage integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use stream_core::{BranchKey, Column, ColumnType, Sink, SinkKey, SourceKey, StorageConfig, UtcTime};
use stream_kv::KvStore;
use stream_placement::VolumeMetadata;
use stream_storage::{Credentials, FileKey, FileResource, FileResourceProvider, StorageRepository};

/// Staging storage stub counting created and deleted resources.
///
/// Sinks with the ID `broken` fail with an error.
#[derive(Default)]
pub struct TestProvider {
    created: AtomicUsize,
    deleted: AtomicUsize,
}

impl TestProvider {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> usize {
        self.deleted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileResourceProvider for TestProvider {
    async fn create_file_resource(&self, key: &FileKey) -> anyhow::Result<FileResource> {
        if key.sink_key.sink_id.0 == "broken" {
            anyhow::bail!("staging storage is unavailable");
        }
        let id = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FileResource {
            file_key: key.clone(),
            name: FileResource::name_for(key),
            credentials: Credentials {
                file_id: id.to_string(),
                upload_url: format!("https://staging.local/upload/{id}"),
                token: "secret".into(),
                expiration: key.file_opened_at.add(Duration::from_secs(3600)),
            },
        })
    }

    async fn delete_file_resource(&self, _resource: &FileResource) -> anyhow::Result<()> {
        self.deleted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Fixture {
    pub repo: StorageRepository,
    pub provider: Arc<TestProvider>,
}

impl Fixture {
    /// In-memory repository with the given number of volumes per file.
    pub fn new(volumes_per_file: u32) -> Self {
        let mut config = StorageConfig::default();
        config.level.local.volume.assignment.count = volumes_per_file;
        Self::with_config(config)
    }

    pub fn with_config(config: StorageConfig) -> Self {
        let provider = Arc::new(TestProvider::default());
        let store = KvStore::open_in_memory().unwrap();
        let repo = StorageRepository::new(store, config, provider.clone()).unwrap();
        Self { repo, provider }
    }

    /// Register `count` writer volumes, each on its own node.
    pub fn register_volumes(&self, count: usize) {
        for i in 1..=count {
            let volume = VolumeMetadata::new(format!("my-volume-{i}"), format!("node-{i}"), "default", "1");
            self.repo
                .volume()
                .register_writer_volume(&volume, Duration::from_secs(24 * 3600), time("2000-01-01T00:00:00.000Z"))
                .unwrap();
        }
    }

    /// Store a table sink definition and return it.
    pub fn create_sink(&self, source: &SourceKey, sink_id: &str) -> Sink {
        let sink = test_sink(source, sink_id);
        self.repo.sinks().put(&sink).unwrap();
        sink
    }
}

pub fn time(s: &str) -> UtcTime {
    UtcTime::parse(s).unwrap()
}

pub fn source_key() -> SourceKey {
    SourceKey::new(BranchKey::new(123, 456), "my-source")
}

pub fn sink_key() -> SinkKey {
    SinkKey::new(source_key(), "my-sink")
}

pub fn test_sink(source: &SourceKey, sink_id: &str) -> Sink {
    Sink::new_table(
        SinkKey::new(source.clone(), sink_id),
        "in.c-bucket.my-table",
        vec![
            Column::new(ColumnType::Uuid, "id").primary_key(),
            Column::new(ColumnType::Body, "body"),
        ],
    )
}
