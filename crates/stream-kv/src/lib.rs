//! stream-kv — transactional metadata store for stream storage.
//!
//! Backed by [redb](https://docs.rs/redb), provides an etcd-like key-value
//! model: a global revision counter, per-key create/mod revisions and
//! versions, compare-and-swap transactions, ordered prefix scans and
//! leases that delete their keys when they expire.
//!
//! # Architecture
//!
//! Values are JSON documents stored with their revision metadata in a
//! single `&str -> &[u8]` table. Keys are `/`-separated paths, so a prefix
//! scan returns a whole subtree in key order.
//!
//! On top of the raw store, [`AtomicOp`] runs the read, prepare and write
//! phases of a repository operation and retries the whole cycle when a
//! concurrent writer changed any key it read.
//!
//! The `KvStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod atomic;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use atomic::{AtomicOp, Reader, WriteBatch, no_prepare};
pub use error::{KvError, KvResult};
pub use store::{KvStore, Snapshot};
pub use types::*;
