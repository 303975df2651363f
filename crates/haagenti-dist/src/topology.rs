//! Process topology of a computation model

use crate::{DistError, Result};
use serde::{Deserialize, Serialize};

/// Placement of one process within the world
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    world_size: usize,
    rank: usize,
    local_rank: usize,
    ntasks_per_node: usize,
    num_nodes: usize,
    node_rank: usize,
}

impl Topology {
    /// Create topology, checking rank bounds
    pub fn new(
        world_size: usize,
        rank: usize,
        local_rank: usize,
        ntasks_per_node: usize,
        num_nodes: usize,
        node_rank: usize,
    ) -> Result<Self> {
        let check = |what: &str, value: usize, bound: usize| {
            if value < bound {
                Ok(())
            } else {
                Err(DistError::InvalidConfig(format!(
                    "{} {} out of range 0..{}",
                    what, value, bound
                )))
            }
        };
        check("rank", rank, world_size)?;
        check("local_rank", local_rank, ntasks_per_node)?;
        check("node_rank", node_rank, num_nodes)?;

        Ok(Self {
            world_size,
            rank,
            local_rank,
            ntasks_per_node,
            num_nodes,
            node_rank,
        })
    }

    /// Single process
    pub fn serial() -> Self {
        Self {
            world_size: 1,
            rank: 0,
            local_rank: 0,
            ntasks_per_node: 1,
            num_nodes: 1,
            node_rank: 0,
        }
    }

    /// Derive node layout from global ranks and tasks per node.
    ///
    /// Nodes are filled in rank order, so `node_rank = rank / ntasks_per_node`.
    /// A short last node still counts as a node.
    pub fn from_ranks(
        world_size: usize,
        rank: usize,
        local_rank: usize,
        ntasks_per_node: usize,
    ) -> Result<Self> {
        if ntasks_per_node == 0 {
            return Err(DistError::InvalidConfig(
                "ntasks_per_node must be >= 1".into(),
            ));
        }
        let num_nodes = world_size.div_ceil(ntasks_per_node);
        Self::new(
            world_size,
            rank,
            local_rank,
            ntasks_per_node,
            num_nodes,
            rank / ntasks_per_node,
        )
    }

    /// World size
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Global rank
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Rank within the node
    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    /// Processes per node
    pub fn ntasks_per_node(&self) -> usize {
        self.ntasks_per_node
    }

    /// Number of nodes
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Node index
    pub fn node_rank(&self) -> usize {
        self.node_rank
    }

    /// Every node runs the same number of processes
    pub fn is_homogeneous(&self) -> bool {
        self.world_size == self.num_nodes * self.ntasks_per_node
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::serial()
    }
}

/// Ring topology helper
pub struct Ring;

impl Ring {
    /// Get left neighbor in ring
    pub fn left(rank: usize, world_size: usize) -> usize {
        (rank + world_size - 1) % world_size
    }

    /// Get right neighbor in ring
    pub fn right(rank: usize, world_size: usize) -> usize {
        (rank + 1) % world_size
    }

    /// Index `steps` positions behind `rank`
    pub fn behind(rank: usize, steps: usize, world_size: usize) -> usize {
        (rank + world_size - steps % world_size) % world_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_topology() {
        let t = Topology::serial();
        assert_eq!(t.world_size(), 1);
        assert_eq!(t.rank(), 0);
        assert_eq!(t.local_rank(), 0);
        assert_eq!(t.ntasks_per_node(), 1);
        assert_eq!(t.num_nodes(), 1);
        assert_eq!(t.node_rank(), 0);
        assert!(t.is_homogeneous());
    }

    #[test]
    fn test_from_ranks() {
        let t = Topology::from_ranks(8, 5, 1, 4).unwrap();
        assert_eq!(t.num_nodes(), 2);
        assert_eq!(t.node_rank(), 1);
        assert!(t.is_homogeneous());

        let t = Topology::from_ranks(5, 4, 0, 2).unwrap();
        assert_eq!(t.num_nodes(), 3);
        assert_eq!(t.node_rank(), 2);
        assert!(!t.is_homogeneous());
    }

    #[test]
    fn test_out_of_range() {
        assert!(Topology::new(4, 4, 0, 4, 1, 0).is_err());
        assert!(Topology::from_ranks(4, 1, 2, 2).is_err());
        assert!(Topology::from_ranks(4, 1, 0, 0).is_err());
    }

    #[test]
    fn test_ring_helpers() {
        assert_eq!(Ring::left(0, 4), 3);
        assert_eq!(Ring::right(3, 4), 0);
        assert_eq!(Ring::behind(1, 2, 4), 3);
        assert_eq!(Ring::behind(2, 0, 4), 2);
    }
}
