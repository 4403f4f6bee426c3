//! stream-placement — which volumes a new file is written to.
//!
//! Writer nodes register their local volumes; every new file is spread
//! over a configured number of them. The assignment is a pure function of
//! the visible volumes, the assignment config and a seed (the file opening
//! time), so the same file always maps to the same volumes.
//!
//! # Components
//!
//! - **`volume`**: Volume metadata registered by writer/reader nodes
//! - **`assignment`**: Deterministic assignment spreading over nodes and
//!   preferring configured volume types

pub mod assignment;
pub mod volume;

pub use assignment::{Assignment, assign_volumes, volumes_for};
pub use volume::{NodeId, VolumeId, VolumeMetadata};
