//! Deterministic volume assignment.
//!
//! 1. Shuffle all volumes with a PRNG seeded by the file opening time.
//! 2. Group them by node. Within a node, order volumes by type priority
//!    (preferred types first, unlisted types last); equal priorities are
//!    ordered by a hash of the seed, type and label.
//! 3. Shuffle the node groups with the same PRNG.
//! 4. For each preferred type, then for any type, take at most one volume
//!    per node per round until the requested count is reached.
//!
//! Volumes are thus spread over nodes before a second volume is taken from
//! the same node, and a preferred type is exhausted before falling back to
//! a less preferred one.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use stream_core::UtcTime;
use stream_core::config::AssignmentConfig;
use tracing::{debug, warn};

use crate::volume::{NodeId, VolumeId, VolumeMetadata};

/// Volumes assigned to a file, with the config used to pick them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub config: AssignmentConfig,
    pub volumes: Vec<VolumeId>,
}

/// Assign volumes to a file opened at `opened_at`.
pub fn volumes_for(all: &[VolumeMetadata], config: &AssignmentConfig, opened_at: UtcTime) -> Assignment {
    let seed = opened_at.unix_nanos();
    let mut rng = StdRng::seed_from_u64(seed as u64);
    let volumes = assign_volumes(all, config.count as usize, &config.preferred_types, seed, &mut rng);
    if volumes.is_empty() {
        warn!(%opened_at, available = all.len(), "no volume assigned");
    }
    Assignment {
        config: config.clone(),
        volumes,
    }
}

/// Pick up to `count` volumes using the given random source.
///
/// The output never contains more than `min(count, all.len())` volumes.
pub fn assign_volumes<G: Rng + ?Sized>(
    all: &[VolumeMetadata],
    count: usize,
    preferred_types: &[String],
    seed: i64,
    rng: &mut G,
) -> Vec<VolumeId> {
    let mut shuffled: Vec<&VolumeMetadata> = all.iter().collect();
    shuffled.shuffle(rng);

    // Group by node, keep the first-seen order of nodes.
    let mut node_index: HashMap<&NodeId, usize> = HashMap::new();
    let mut nodes: Vec<Vec<&VolumeMetadata>> = Vec::new();
    for volume in shuffled {
        let index = *node_index.entry(&volume.node_id).or_insert_with(|| {
            nodes.push(Vec::new());
            nodes.len() - 1
        });
        nodes[index].push(volume);
    }

    let priority = |volume_type: &str| {
        preferred_types
            .iter()
            .position(|t| t == volume_type)
            .unwrap_or(preferred_types.len())
    };
    for group in &mut nodes {
        group.sort_by_cached_key(|v| (priority(&v.volume_type), tie_hash(seed, &v.volume_type, &v.label)));
    }
    nodes.shuffle(rng);

    let mut levels: Vec<Option<&str>> = preferred_types.iter().map(|t| Some(t.as_str())).collect();
    levels.push(None);

    let mut selected = Vec::with_capacity(count.min(all.len()));
    'levels: for level in levels {
        loop {
            let mut picked_in_round = false;
            for group in &mut nodes {
                if selected.len() >= count {
                    break 'levels;
                }
                let position = group
                    .iter()
                    .position(|v| level.is_none_or(|t| v.volume_type == t));
                if let Some(position) = position {
                    selected.push(group.remove(position).volume_id.clone());
                    picked_in_round = true;
                }
            }
            if !picked_in_round {
                break;
            }
        }
    }

    debug!(requested = count, assigned = selected.len(), "volumes assigned");
    selected
}

fn tie_hash(seed: i64, volume_type: &str, label: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(volume_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(label.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}
