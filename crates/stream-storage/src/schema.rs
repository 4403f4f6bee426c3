//! Metadata store key layout.
//!
//! ```text
//! storage/file/all/<project>/<branch>/<source>/<sink>/<fileOpenedAt>
//! storage/file/level/<level>/<...file key>
//! storage/slice/all/<...file key>/<volume>/<sliceOpenedAt>
//! storage/slice/level/<level>/<...slice key>
//! storage/stats/<level>/<...slice key>/value
//! storage/stats/<level>/<...object key>/_sum
//! storage/volume/writer/<volume>
//! storage/volume/reader/<volume>
//! definition/sink/active/<...sink key>
//! ```
//!
//! Every entity is stored twice: under `all/` for CRUD and under
//! `level/<level>/` as an index of the storage level. Both copies are
//! written in the same transaction.
//!
//! A prefix of a parent object always ends with `/`, so project `12` does
//! not match project `123`.

use std::fmt;

use stream_core::SinkKey;
use stream_placement::VolumeId;

use crate::file::FileKey;
use crate::level::Level;
use crate::slice::SliceKey;

const FILE_ALL: &str = "storage/file/all/";
const FILE_LEVEL: &str = "storage/file/level/";
const SLICE_ALL: &str = "storage/slice/all/";
const SLICE_LEVEL: &str = "storage/slice/level/";
const STATS: &str = "storage/stats/";
const VOLUME_WRITER: &str = "storage/volume/writer/";
const VOLUME_READER: &str = "storage/volume/reader/";
const SINK_ACTIVE: &str = "definition/sink/active/";

pub const STATS_VALUE: &str = "value";
pub const STATS_SUM: &str = "_sum";

// ── Files ───────────────────────────────────────────────────────────

pub fn file(key: &FileKey) -> String {
    format!("{FILE_ALL}{key}")
}

pub fn file_in_level(level: Level, key: &FileKey) -> String {
    format!("{FILE_LEVEL}{level}/{key}")
}

pub fn files() -> String {
    FILE_ALL.to_string()
}

pub fn files_in(parent: &dyn fmt::Display) -> String {
    format!("{FILE_ALL}{parent}/")
}

pub fn files_in_level(level: Level, parent: &dyn fmt::Display) -> String {
    format!("{FILE_LEVEL}{level}/{parent}/")
}

// ── Slices ──────────────────────────────────────────────────────────

pub fn slice(key: &SliceKey) -> String {
    format!("{SLICE_ALL}{key}")
}

pub fn slice_in_level(level: Level, key: &SliceKey) -> String {
    format!("{SLICE_LEVEL}{level}/{key}")
}

pub fn slices_in(parent: &dyn fmt::Display) -> String {
    format!("{SLICE_ALL}{parent}/")
}

pub fn slices_in_level(level: Level, parent: &dyn fmt::Display) -> String {
    format!("{SLICE_LEVEL}{level}/{parent}/")
}

// ── Statistics ──────────────────────────────────────────────────────

pub fn stats_value(level: Level, key: &SliceKey) -> String {
    format!("{STATS}{level}/{key}/{STATS_VALUE}")
}

pub fn stats_sum(level: Level, object: &dyn fmt::Display) -> String {
    format!("{STATS}{level}/{object}/{STATS_SUM}")
}

pub fn stats_in(level: Level, object: &dyn fmt::Display) -> String {
    format!("{STATS}{level}/{object}/")
}

pub fn stats_level(level: Level) -> String {
    format!("{STATS}{level}/")
}

// ── Volumes ─────────────────────────────────────────────────────────

pub fn writer_volume(id: &VolumeId) -> String {
    format!("{VOLUME_WRITER}{id}")
}

pub fn writer_volumes() -> String {
    VOLUME_WRITER.to_string()
}

pub fn reader_volume(id: &VolumeId) -> String {
    format!("{VOLUME_READER}{id}")
}

pub fn reader_volumes() -> String {
    VOLUME_READER.to_string()
}

// ── Definitions ─────────────────────────────────────────────────────

pub fn sink(key: &SinkKey) -> String {
    format!("{SINK_ACTIVE}{key}")
}

pub fn sinks_in(parent: &dyn fmt::Display) -> String {
    format!("{SINK_ACTIVE}{parent}/")
}
