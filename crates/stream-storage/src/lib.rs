//! stream-storage — file and slice lifecycle of the stream storage tier.
//!
//! Records received by a sink are written to local slices, uploaded to the
//! staging storage and imported into the target table. This crate keeps
//! the metadata of that pipeline in the [`stream_kv`] store:
//!
//! - Files and slices with forward-only state machines
//! - Rotation: closing the writing file and opening a successor atomically
//! - Volume assignment and disk pre-allocation for new slices
//! - Statistics moved between storage levels together with state changes
//! - Retry bookkeeping with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! StorageRepository
//!   ├── FileRepository   (rotate, close, state transitions, delete)
//!   │     ├── SinkDefinitions        (consumed sink definitions)
//!   │     ├── VolumeRepository       (lease-bound writer volumes)
//!   │     ├── FileResourceProvider   (remote staging files, + Rollback)
//!   │     └── volumes_for            (stream-placement)
//!   ├── SliceRepository  (rotate, close, state transitions, delete)
//!   └── StatisticsRepository (per-level values, sums, quota)
//! ```
//!
//! Every mutation is a `stream_kv::AtomicOp`: reads are tracked, the write
//! is committed as one transaction, and the whole cycle is retried when a
//! concurrent writer modified anything that was read.

pub mod definitions;
pub mod diskalloc;
pub mod error;
pub mod file;
pub mod file_repo;
pub mod level;
pub mod parent;
pub mod provider;
pub mod repository;
pub mod retry;
pub mod rollback;
pub mod schema;
pub mod slice;
pub mod slice_repo;
pub mod state;
pub mod statistics;
pub mod volumes;

pub use definitions::SinkDefinitions;
pub use error::{MultiError, StorageError, StorageResult};
pub use file::{File, FileKey};
pub use file_repo::FileRepository;
pub use level::Level;
pub use parent::ParentKey;
pub use provider::{Credentials, FileResource, FileResourceProvider};
pub use repository::StorageRepository;
pub use retry::{ExponentialBackoff, RetryBackoff, Retryable};
pub use rollback::Rollback;
pub use slice::{FileVolumeKey, Slice, SliceKey};
pub use slice_repo::SliceRepository;
pub use state::{FileState, SliceState};
pub use statistics::{Aggregated, PerSlice, StatisticsRepository, Value};
pub use volumes::VolumeRepository;
