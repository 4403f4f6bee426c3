//! stream-core — shared value types for the stream storage tier.
//!
//! Everything here is plain data: hierarchical object keys, millisecond
//! UTC timestamps, byte sizes, the consumed Sink definition model and the
//! storage configuration tree (with sink-level patches).

pub mod bytesize;
pub mod config;
pub mod definition;
pub mod duration;
pub mod error;
pub mod keys;
pub mod utctime;

pub use bytesize::ByteSize;
pub use config::StorageConfig;
pub use definition::{Column, ColumnType, Sink, SinkType, TableSink};
pub use error::{ConfigError, ConfigResult};
pub use keys::{BranchId, BranchKey, ProjectId, SinkId, SinkKey, SourceId, SourceKey};
pub use utctime::UtcTime;
