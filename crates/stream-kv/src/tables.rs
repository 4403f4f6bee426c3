//! redb table definitions for the metadata store.

use redb::TableDefinition;

/// Key-value pairs keyed by the full `/`-separated key.
/// Values are JSON-serialized `StoredValue`s (value + revision metadata).
pub const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Store-wide counters, see [`META_REVISION`] and [`META_LEASE_SEQ`].
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Leases keyed by lease ID, JSON-serialized `Lease` values.
pub const LEASES: TableDefinition<u64, &[u8]> = TableDefinition::new("leases");

/// Revision of the last committed write transaction.
pub const META_REVISION: &str = "revision";

/// Last granted lease ID.
pub const META_LEASE_SEQ: &str = "lease_seq";
