//! Remote file resources in the staging storage.
//!
//! A file resource (upload credentials for one file) must exist before the
//! file metadata is committed. Resources are created in the prepare phase
//! of a rotation, in parallel with a bounded concurrency, and each created
//! resource registers a compensation in the caller's [`Rollback`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stream_core::{SinkKey, UtcTime};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::error::{MultiError, StorageError, StorageResult};
use crate::file::FileKey;
use crate::rollback::Rollback;

/// Upload credentials for one file in the staging storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub file_id: String,
    pub upload_url: String,
    pub token: String,
    pub expiration: UtcTime,
}

/// A remote file prepared for a new file entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResource {
    pub file_key: FileKey,
    pub name: String,
    pub credentials: Credentials,
}

impl FileResource {
    /// Name of the remote file, e.g. `stream_my-source_my-sink_2000-01-01T01:00:00.000Z`.
    pub fn name_for(key: &FileKey) -> String {
        format!(
            "stream_{}_{}_{}",
            key.sink_key.source_key.source_id, key.sink_key.sink_id, key.file_opened_at
        )
    }
}

/// Creates and deletes file resources in the staging storage.
#[async_trait]
pub trait FileResourceProvider: Send + Sync {
    async fn create_file_resource(&self, key: &FileKey) -> anyhow::Result<FileResource>;

    async fn delete_file_resource(&self, resource: &FileResource) -> anyhow::Result<()>;
}

/// Creates file resources for a rotation.
///
/// Created resources are cached by file key, so a retried rotation with
/// the same timestamp reuses them, and exactly one compensation is
/// registered per resource.
#[derive(Clone)]
pub(crate) struct ResourceProvisioner {
    provider: Arc<dyn FileResourceProvider>,
    rollback: Rollback,
    limit: usize,
    created: Arc<Mutex<BTreeMap<FileKey, FileResource>>>,
}

impl ResourceProvisioner {
    pub(crate) fn new(provider: Arc<dyn FileResourceProvider>, rollback: Rollback, limit: usize) -> Self {
        Self {
            provider,
            rollback,
            limit: limit.max(1),
            created: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Resources for files of the given sinks opened at `now`.
    pub(crate) async fn resources(
        &self,
        now: UtcTime,
        sinks: Vec<SinkKey>,
    ) -> StorageResult<BTreeMap<SinkKey, FileResource>> {
        let mut out = BTreeMap::new();
        let mut missing = Vec::new();
        {
            let created = self.cache()?;
            for sink_key in sinks {
                let file_key = FileKey::new(sink_key.clone(), now);
                match created.get(&file_key) {
                    Some(resource) => {
                        out.insert(sink_key, resource.clone());
                    }
                    None => missing.push(file_key),
                }
            }
        }

        if missing.is_empty() {
            return Ok(out);
        }

        let semaphore = Arc::new(Semaphore::new(self.limit));
        let mut tasks = JoinSet::new();
        for file_key in missing {
            let provider = Arc::clone(&self.provider);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = provider.create_file_resource(&file_key).await;
                (file_key, result)
            });
        }

        let mut errs = MultiError::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((file_key, Ok(resource))) => {
                    debug!(file = %file_key, name = %resource.name, "file resource created");
                    self.register_rollback(&resource);
                    self.cache()?.insert(file_key.clone(), resource.clone());
                    out.insert(file_key.sink_key, resource);
                }
                Ok((file_key, Err(e))) => {
                    errs.push(StorageError::Provider(
                        e.context(format!("cannot create file resource for the sink \"{}\"", file_key.sink_key)),
                    ));
                }
                Err(e) => errs.push(StorageError::Provider(anyhow::Error::new(e))),
            }
        }
        errs.into_result()?;

        info!(count = out.len(), "file resources ready");
        Ok(out)
    }

    fn register_rollback(&self, resource: &FileResource) {
        let provider = Arc::clone(&self.provider);
        let resource = resource.clone();
        self.rollback.add(move || async move { provider.delete_file_resource(&resource).await });
    }

    fn cache(&self) -> StorageResult<std::sync::MutexGuard<'_, BTreeMap<FileKey, FileResource>>> {
        self.created
            .lock()
            .map_err(|_| StorageError::UnexpectedState("file resources cache is poisoned".into()))
    }
}
