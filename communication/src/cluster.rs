//! The in-process node cluster.
//!
//! Stands in for the one-rank-per-node communicator: each node handle knows
//! its rank and peer count and can rendezvous at a barrier. Handles are
//! created together and each moves onto its node's thread.

use std::sync::{Arc, Barrier};

/// One node's handle into the cluster.
pub struct ProcessCluster {
    rank: usize,
    num_node: usize,
    barrier: Arc<Barrier>,
}

impl ProcessCluster {
    /// Allocates a vector of connected handles, one per node.
    pub fn new_vector(num_node: usize) -> Vec<ProcessCluster> {
        assert!(num_node > 0);
        let barrier = Arc::new(Barrier::new(num_node));
        (0..num_node)
            .map(|rank| ProcessCluster {
                rank,
                num_node,
                barrier: Arc::clone(&barrier),
            })
            .collect()
    }

    /// This node's rank in the cluster.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of nodes in the cluster.
    pub fn num_node(&self) -> usize {
        self.num_node
    }

    /// Blocks until every node has arrived.
    pub fn barrier(&self) {
        self.barrier.wait();
    }
}
