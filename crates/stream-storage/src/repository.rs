//! Storage repository facade.

use std::sync::Arc;

use stream_core::{SinkKey, StorageConfig};
use stream_kv::KvStore;
use tracing::info;

use crate::definitions::SinkDefinitions;
use crate::error::StorageResult;
use crate::file_repo::FileRepository;
use crate::provider::FileResourceProvider;
use crate::retry::{ExponentialBackoff, RetryBackoff};
use crate::slice_repo::SliceRepository;
use crate::statistics::StatisticsRepository;
use crate::volumes::VolumeRepository;

/// All storage repositories over one metadata store.
#[derive(Clone)]
pub struct StorageRepository {
    store: KvStore,
    config: StorageConfig,
    file: FileRepository,
    slice: SliceRepository,
    volume: VolumeRepository,
    sinks: SinkDefinitions,
    statistics: StatisticsRepository,
}

impl StorageRepository {
    /// Validates the configuration and wires the repositories with an
    /// exponential backoff built from `config.retry`.
    pub fn new(
        store: KvStore,
        config: StorageConfig,
        provider: Arc<dyn FileResourceProvider>,
    ) -> StorageResult<Self> {
        let backoff = Arc::new(ExponentialBackoff::new(config.retry.clone()));
        Self::with_backoff(store, config, provider, backoff)
    }

    pub fn with_backoff(
        store: KvStore,
        config: StorageConfig,
        provider: Arc<dyn FileResourceProvider>,
        backoff: Arc<dyn RetryBackoff>,
    ) -> StorageResult<Self> {
        config.validate()?;

        let recent_slices = config.statistics.recent_slices_for_allocation;
        let repo = Self {
            file: FileRepository::new(store.clone(), &config, Arc::clone(&backoff), provider),
            slice: SliceRepository::new(store.clone(), backoff, recent_slices),
            volume: VolumeRepository::new(store.clone()),
            sinks: SinkDefinitions::new(store.clone()),
            statistics: StatisticsRepository::new(store.clone()),
            store,
            config,
        };
        info!(
            volumes_per_file = repo.config.level.local.volume.assignment.count,
            quota = %repo.config.quota.max_buffered_size,
            "storage repository ready"
        );
        Ok(repo)
    }

    pub fn file(&self) -> &FileRepository {
        &self.file
    }

    pub fn slice(&self) -> &SliceRepository {
        &self.slice
    }

    pub fn volume(&self) -> &VolumeRepository {
        &self.volume
    }

    pub fn sinks(&self) -> &SinkDefinitions {
        &self.sinks
    }

    pub fn statistics(&self) -> &StatisticsRepository {
        &self.statistics
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    /// Fails if the sink buffers more data than the configured quota.
    pub fn check_quota(&self, sink: &SinkKey) -> StorageResult<()> {
        self.statistics
            .check_sink_quota(sink, self.config.quota.max_buffered_size)
    }
}
