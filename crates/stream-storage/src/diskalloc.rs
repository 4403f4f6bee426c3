//! Disk space pre-allocated for a new slice.

use stream_core::ByteSize;
use stream_core::config::DiskAllocationConfig;

/// Size to pre-allocate for a new slice.
///
/// `previous` is the largest compressed size among recently finished
/// slices of the sink, zero if there is no history.
pub fn allocated_size(config: &DiskAllocationConfig, previous: ByteSize) -> ByteSize {
    if !config.enabled {
        return ByteSize(0);
    }
    if previous.as_u64() > 0 && config.relative > 0 {
        previous.percent(config.relative)
    } else {
        config.static_size
    }
}
