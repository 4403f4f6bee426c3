//! Lease-bound volume registrations.
//!
//! Storage nodes register their volumes with a lease and keep it alive.
//! When a node stops renewing, the lease expires and its volumes disappear
//! from the listing and from volume assignment. Expired leases are revoked
//! lazily, at the `now` of the next listing or rotation.

use std::time::Duration;

use stream_core::UtcTime;
use stream_kv::{KvStore, LeaseId, Reader};
use stream_placement::VolumeMetadata;
use tracing::{debug, info};

use crate::error::StorageResult;
use crate::schema;

#[derive(Clone)]
pub struct VolumeRepository {
    store: KvStore,
}

impl VolumeRepository {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    /// Register a writer volume under a new lease.
    pub fn register_writer_volume(
        &self,
        volume: &VolumeMetadata,
        ttl: Duration,
        now: UtcTime,
    ) -> StorageResult<LeaseId> {
        self.register(schema::writer_volume(&volume.volume_id), volume, ttl, now)
    }

    /// Register a reader volume under a new lease.
    pub fn register_reader_volume(
        &self,
        volume: &VolumeMetadata,
        ttl: Duration,
        now: UtcTime,
    ) -> StorageResult<LeaseId> {
        self.register(schema::reader_volume(&volume.volume_id), volume, ttl, now)
    }

    /// Writer volumes with a live lease at `now`.
    pub fn list_writer_volumes(&self, now: UtcTime) -> StorageResult<Vec<VolumeMetadata>> {
        self.expire(now)?;
        self.list(&schema::writer_volumes())
    }

    /// Reader volumes with a live lease at `now`.
    pub fn list_reader_volumes(&self, now: UtcTime) -> StorageResult<Vec<VolumeMetadata>> {
        self.expire(now)?;
        self.list(&schema::reader_volumes())
    }

    /// Revoke leases expired at `now`, deleting their volume registrations.
    pub fn expire(&self, now: UtcTime) -> StorageResult<Vec<LeaseId>> {
        let expired = self.store.expire_leases(now.datetime())?;
        if !expired.is_empty() {
            debug!(leases = ?expired, %now, "expired volume leases revoked");
        }
        Ok(expired)
    }

    fn register(&self, key: String, volume: &VolumeMetadata, ttl: Duration, now: UtcTime) -> StorageResult<LeaseId> {
        let value = serde_json::to_string(volume)?;
        let (lease, _) = self.store.put_with_new_lease(&key, value, ttl, now.datetime())?;
        info!(volume = %volume.volume_id, node = %volume.node_id, lease, "volume registered");
        Ok(lease)
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<VolumeMetadata>> {
        self.store
            .get_prefix(prefix)?
            .iter()
            .map(|kv| kv.decode().map_err(Into::into))
            .collect()
    }
}

/// Writer volumes visible in the read phase of an operation.
pub(crate) fn read_writer_volumes(reader: &mut Reader) -> StorageResult<Vec<VolumeMetadata>> {
    Ok(reader.list_json::<VolumeMetadata>(&schema::writer_volumes())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_expire() {
        let store = KvStore::open_in_memory().unwrap();
        let repo = VolumeRepository::new(store.clone());
        let now = UtcTime::parse("2000-01-01T01:00:00.000Z").unwrap();
        let ttl = Duration::from_secs(10);

        let v1 = VolumeMetadata::new("my-volume-1", "node-a", "hdd", "1");
        let v2 = VolumeMetadata::new("my-volume-2", "node-b", "ssd", "1");
        let lease1 = repo.register_writer_volume(&v1, ttl, now).unwrap();
        repo.register_writer_volume(&v2, ttl, now).unwrap();
        repo.register_reader_volume(&v2, ttl, now).unwrap();

        assert_eq!(repo.list_writer_volumes(now).unwrap(), vec![v1.clone(), v2.clone()]);
        assert_eq!(repo.list_reader_volumes(now).unwrap(), vec![v2.clone()]);

        // Only the first node keeps its lease alive.
        let later = now.add(Duration::from_secs(8));
        store.keep_alive(lease1, later.datetime()).unwrap();

        let after = now.add(Duration::from_secs(12));
        assert_eq!(repo.list_writer_volumes(after).unwrap(), vec![v1]);
        assert!(repo.list_reader_volumes(after).unwrap().is_empty());
    }

    #[test]
    fn test_expired_volume_hidden_without_explicit_reaping() {
        let store = KvStore::open_in_memory().unwrap();
        let repo = VolumeRepository::new(store.clone());
        let now = UtcTime::parse("2000-01-01T00:00:00.000Z").unwrap();
        let volume = VolumeMetadata::new("dead-volume", "node-a", "hdd", "1");
        repo.register_writer_volume(&volume, Duration::from_secs(10), now)
            .unwrap();

        let later = now.add(Duration::from_secs(3600));
        assert!(repo.list_writer_volumes(later).unwrap().is_empty());
        assert!(store.get_prefix(&schema::writer_volumes()).unwrap().is_empty());
    }

    #[test]
    fn test_register_is_single_revision() {
        let store = KvStore::open_in_memory().unwrap();
        let repo = VolumeRepository::new(store.clone());
        let now = UtcTime::parse("2000-01-01T00:00:00.000Z").unwrap();
        let volume = VolumeMetadata::new("my-volume-1", "node-a", "hdd", "1");

        let lease = repo
            .register_writer_volume(&volume, Duration::from_secs(10), now)
            .unwrap();
        assert_eq!(store.revision().unwrap(), 1);
        assert_eq!(store.revoke_lease(lease).unwrap(), 1);
    }
}
