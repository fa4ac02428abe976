//! Tree communication for the steer runtime.
//!
//! One communicator per compute node, arranged as a k-ary tree. Fixed-width
//! sample vectors travel upward and policy vectors travel downward through
//! one-sided windows: a writer takes an exclusive lock on the target's
//! window and deposits `[is_ready, values…]`; the reader polls under a
//! shared lock and drains under an exclusive one. Policy sends are
//! suppressed when equal to the last send, so re-sending an unchanged
//! policy is idempotent and produces no window traffic.
//!
//! The fabric is wired in-process: [`TreeComm::new_vector`] builds the
//! window cells for every node of the tree and returns one builder per
//! node, each of which is `Send` and is built into a [`TreeComm`] on its
//! node's own thread.
//!
//! ```
//! use steer_communication::TreeComm;
//!
//! let builders = TreeComm::new_vector(4, 1, 2);
//! let mut nodes: Vec<_> = builders.into_iter().map(|b| b.build()).collect();
//!
//! // Node 3 sends a sample up; the level root gathers all four.
//! for node in nodes.iter_mut().skip(1) {
//!     node.send_up(0, &[1.0, 2.0]).unwrap();
//! }
//! nodes[0].send_up(0, &[1.0, 2.0]).unwrap();
//! let mut gathered = vec![vec![0.0; 2]; 4];
//! assert!(nodes[0].receive_up(0, &mut gathered).unwrap());
//! ```

mod cluster;
mod window;
mod level;
mod tree;

pub use cluster::ProcessCluster;
pub use level::TreeCommLevel;
pub use tree::{TreeComm, TreeCommBuilder, fan_out, dimension_create};

/// Hard ceiling on the branching factor of any tree level.
pub const MAX_FAN_OUT: usize = 16;

/// Errors raised by the tree communicator.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    /// A level index outside this node's controlled range.
    #[error("tree comm: level {0} out of range")]
    LevelRange(usize),
    /// A sample or policy vector of the wrong arity.
    #[error("tree comm: {what} vector sized {got}, expected {expected}")]
    InvalidSize {
        /// Which vector was mis-sized.
        what: &'static str,
        /// Declared arity.
        expected: usize,
        /// Supplied length.
        got: usize,
    },
    /// An operation invoked from the wrong rank of a level.
    #[error("tree comm: {0}")]
    Logic(&'static str),
}
