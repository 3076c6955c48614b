//! The data model's `Team` and `Image` concepts (§3).
//!
//! Per §9's design notes, the reference treats the team handle as a placeholder supporting only
//! the universal team; a full team implementation (arbitrary subsets, team creation/splitting) is
//! explicitly out of scope here. `Team` therefore only models what §3 actually requires: an id, a
//! rank count, and a per-team monotonically-advancing sequence counter used to stamp every op
//! submitted against it.

use std::sync::atomic::{AtomicU32, Ordering};

/// The distinguished id naming the universal team (all images in the job).
pub const TEAM_ALL_ID: u32 = 0;

/// An opaque team handle: id, total rank count, and an op-sequence counter.
///
/// Sequence numbers wrap at `u32::MAX`; comparisons that matter (the P2P table's lookup, the
/// active list's uniqueness invariant I1) only ever test equality of `(team_id, sequence)` pairs,
/// so wraparound is safe without a signed modular-difference comparison here (unlike the
/// consensus token counter in [`crate::consensus`], which *is* compared with `<`).
pub struct Team {
    id: u32,
    nranks: u32,
    seq: AtomicU32,
}

impl Team {
    /// The universal team spanning `nranks` ranks.
    pub fn team_all(nranks: u32) -> Team {
        Team {
            id: TEAM_ALL_ID,
            nranks,
            seq: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn nranks(&self) -> u32 {
        self.nranks
    }

    /// Assign the next sequence number for an op submitted against this team.
    pub fn next_sequence(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

/// Process-wide image topology, initialized once at [`crate::init`] and never mutated after.
///
/// An image is a logical participant; a process hosts one or more images. In single-image-per-
/// process mode `image_counts` is all-ones and an image id equals its owning node id.
pub struct ImageTopology {
    /// Number of images hosted by each node, indexed by node id.
    image_counts: Vec<u32>,
    /// Prefix sum of `image_counts`: `offsets[node]` is the first image id hosted by `node`.
    offsets: Vec<u32>,
    /// Image id -> owning node id.
    image_to_node: Vec<u32>,
    my_image: u32,
}

impl ImageTopology {
    pub fn new(image_counts: &[u32], my_image: u32) -> ImageTopology {
        let mut offsets = Vec::with_capacity(image_counts.len());
        let mut image_to_node = Vec::new();
        let mut acc = 0u32;
        for (node, &count) in image_counts.iter().enumerate() {
            offsets.push(acc);
            for _ in 0..count {
                image_to_node.push(node as u32);
            }
            acc += count;
        }
        ImageTopology {
            image_counts: image_counts.to_vec(),
            offsets,
            image_to_node,
            my_image,
        }
    }

    /// Single-image-per-process topology over `nnodes` nodes: image id == node id.
    pub fn single_image_per_process(nnodes: u32, my_node: u32) -> ImageTopology {
        ImageTopology::new(&vec![1u32; nnodes as usize], my_node)
    }

    pub fn image_count(&self) -> u32 {
        self.image_to_node.len() as u32
    }

    pub fn node_count(&self) -> u32 {
        self.image_counts.len() as u32
    }

    pub fn node_of_image(&self, image: u32) -> u32 {
        self.image_to_node[image as usize]
    }

    pub fn first_image_of(&self, node: u32) -> u32 {
        self.offsets[node as usize]
    }

    pub fn image_count_of(&self, node: u32) -> u32 {
        self.image_counts[node as usize]
    }

    pub fn my_image(&self) -> u32 {
        self.my_image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_monotonic_and_unique_per_call() {
        let team = Team::team_all(4);
        let a = team.next_sequence();
        let b = team.next_sequence();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn single_image_per_process_topology() {
        let topo = ImageTopology::single_image_per_process(4, 2);
        assert_eq!(topo.image_count(), 4);
        assert_eq!(topo.node_of_image(2), 2);
        assert_eq!(topo.my_image(), 2);
    }

    #[test]
    fn multi_image_topology_offsets() {
        let topo = ImageTopology::new(&[2, 1, 3], 0);
        assert_eq!(topo.image_count(), 6);
        assert_eq!(topo.first_image_of(0), 0);
        assert_eq!(topo.first_image_of(1), 2);
        assert_eq!(topo.first_image_of(2), 3);
        assert_eq!(topo.node_of_image(4), 2);
    }
}
