//! The per-node tree communicator.
//!
//! The node count is factored into a list of per-level fan-outs, each at
//! most [`MAX_FAN_OUT`](crate::MAX_FAN_OUT), dropping any trailing
//! single-child level. The factors, read root-to-leaf, are the dimensions
//! of a Cartesian grid over node ranks; a node controls level `l` exactly
//! when its coordinates are zero in every dimension below `l`. Controlling
//! a level means being the level root there: the node gathers its
//! children's samples and distributes their policies.
//!
//! [`TreeComm::new_vector`] wires the window fabric for the whole tree and
//! hands back one `Send` builder per node.

use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;

use steer_logging::{CommEvent, Logger};

use crate::level::TreeCommLevel;
use crate::window::Window;
use crate::{CommError, MAX_FAN_OUT};

type Dims = SmallVec<[usize; 4]>;

/// Factors `num_node` into `dims.len()` balanced dimensions whose product
/// is `num_node`, in non-increasing order.
pub fn dimension_create(num_node: usize, dims: &mut [usize]) {
    dims.fill(1);
    let mut factors = prime_factors(num_node);
    // Largest factors first, each onto the currently smallest dimension.
    factors.sort_unstable_by(|a, b| b.cmp(a));
    for factor in factors {
        let smallest = dims
            .iter()
            .enumerate()
            .min_by_key(|(_, d)| **d)
            .map(|(i, _)| i)
            .expect("dims must not be empty");
        dims[smallest] *= factor;
    }
    dims.sort_unstable_by(|a, b| b.cmp(a));
}

fn prime_factors(mut num: usize) -> Vec<usize> {
    let mut result = Vec::new();
    let mut p = 2;
    while p * p <= num {
        while num % p == 0 {
            result.push(p);
            num /= p;
        }
        p += 1;
    }
    if num > 1 {
        result.push(num);
    }
    result
}

/// Chooses per-level sizes for a tree over `num_node` nodes, leaf level
/// first.
///
/// Dimensions are added until every level's fan-out fits under
/// [`MAX_FAN_OUT`](crate::MAX_FAN_OUT) or the factorization degenerates;
/// a trailing single-child level is dropped. One node yields an empty
/// tree (depth zero).
pub fn fan_out(num_node: usize) -> Vec<usize> {
    let mut result = Vec::new();
    if num_node > 1 {
        result.push(num_node);
        while result[0] > MAX_FAN_OUT && *result.last().expect("nonempty") != 1 {
            result.push(0);
            dimension_create(num_node, &mut result);
        }
        if result.len() > 1 && *result.last().expect("nonempty") == 1 {
            result.pop();
        }
    }
    result
}

struct LevelWiring {
    rank: usize,
    size: usize,
    sample_window: Arc<Window>,
    policy_windows: Vec<Arc<Window>>,
}

/// Everything one node needs to assemble its communicator, detached from
/// any thread-local state so it can move onto the node's thread.
pub struct TreeCommBuilder {
    rank: usize,
    num_node: usize,
    level_size: Vec<usize>,
    num_level_ctl: usize,
    num_send_up: usize,
    num_send_down: usize,
    levels: Vec<LevelWiring>,
}

impl TreeCommBuilder {
    /// Assembles the communicator on the node's own thread.
    pub fn build(self) -> TreeComm {
        let levels = self
            .levels
            .into_iter()
            .enumerate()
            .map(|(level, wiring)| {
                TreeCommLevel::new(level, wiring.rank, wiring.size,
                                   self.num_send_up, self.num_send_down,
                                   wiring.sample_window, wiring.policy_windows)
            })
            .collect();
        TreeComm {
            rank: self.rank,
            num_node: self.num_node,
            level_size: self.level_size,
            num_level_ctl: self.num_level_ctl,
            levels,
        }
    }
}

/// A node's view of the whole tree: one [`TreeCommLevel`] per level it
/// participates in, lowest level first.
pub struct TreeComm {
    rank: usize,
    num_node: usize,
    level_size: Vec<usize>,
    num_level_ctl: usize,
    levels: Vec<TreeCommLevel>,
}

impl TreeComm {
    /// Wires a tree over `num_node` nodes exchanging `num_send_down`-wide
    /// policies and `num_send_up`-wide samples, returning one builder per
    /// node rank.
    pub fn new_vector(num_node: usize,
                      num_send_down: usize,
                      num_send_up: usize) -> Vec<TreeCommBuilder> {
        let level_size = fan_out(num_node);
        let depth = level_size.len();
        // Cartesian dimensions, root level outermost.
        let dims: Dims = level_size.iter().rev().copied().collect();

        // Window cells per (level, group root rank), created on first use.
        let mut groups: HashMap<(usize, usize), (Arc<Window>, Vec<Arc<Window>>)> = HashMap::new();

        (0..num_node)
            .map(|rank| {
                let coords = coordinate(rank, &dims);
                let num_level_ctl = num_level_controlled(&coords);
                let max_level = if num_level_ctl == depth { depth } else { num_level_ctl + 1 };

                let levels = (0..max_level)
                    .map(|level| {
                        let dim = depth - 1 - level;
                        let size = dims[dim];
                        let mut root_coords: Dims = coords.clone();
                        root_coords[dim] = 0;
                        let root_rank = cart_rank(&root_coords, &dims);
                        let (sample_window, policy_windows) = groups
                            .entry((level, root_rank))
                            .or_insert_with(|| {
                                let sample = Window::new(size * (num_send_up + 1));
                                let policies =
                                    (0..size).map(|_| Window::new(num_send_down + 1)).collect();
                                (sample, policies)
                            });
                        LevelWiring {
                            rank: coords[dim],
                            size,
                            sample_window: Arc::clone(sample_window),
                            policy_windows: policy_windows.iter().map(Arc::clone).collect(),
                        }
                    })
                    .collect();

                TreeCommBuilder {
                    rank,
                    num_node,
                    level_size: level_size.clone(),
                    num_level_ctl,
                    num_send_up,
                    num_send_down,
                    levels,
                }
            })
            .collect()
    }

    /// This node's rank in the cluster.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of nodes in the tree.
    pub fn num_node(&self) -> usize {
        self.num_node
    }

    /// Number of levels at which this node is the level root.
    pub fn num_level_controlled(&self) -> usize {
        self.num_level_ctl
    }

    /// The tree depth; only the global root controls this many levels.
    pub fn root_level(&self) -> usize {
        self.level_size.len()
    }

    /// This node's rank within a controlled or adjacent level.
    pub fn level_rank(&self, level: usize) -> Result<usize, CommError> {
        self.level(level).map(TreeCommLevel::level_rank)
    }

    /// The fan-out of the given level of the tree.
    pub fn level_size(&self, level: usize) -> Result<usize, CommError> {
        self.level_size.get(level).copied().ok_or(CommError::LevelRange(level))
    }

    /// Routes events from every level into `logger`.
    pub fn set_logger(&mut self, logger: Logger<CommEvent>) {
        for level in &mut self.levels {
            level.set_logger(logger.clone());
        }
    }

    /// Deposits this node's sample at the given level.
    pub fn send_up(&mut self, level: usize, sample: &[f64]) -> Result<(), CommError> {
        self.level_mut(level)?.send_up(sample)
    }

    /// Distributes per-child policies at a controlled level.
    pub fn send_down(&mut self, level: usize, policy: &[Vec<f64>]) -> Result<(), CommError> {
        self.controlled_mut(level)?.send_down(policy)
    }

    /// Gathers children's samples at a controlled level.
    pub fn receive_up(&mut self,
                      level: usize,
                      sample: &mut [Vec<f64>]) -> Result<bool, CommError> {
        self.controlled_mut(level)?.receive_up(sample)
    }

    /// Polls this node's policy window at the given level.
    pub fn receive_down(&mut self,
                        level: usize,
                        policy: &mut Vec<f64>) -> Result<bool, CommError> {
        self.level_mut(level)?.receive_down(policy)
    }

    /// Total bytes deposited into remote windows by this node.
    pub fn overhead_send(&self) -> usize {
        self.levels.iter().map(TreeCommLevel::overhead_send).sum()
    }

    fn level(&self, level: usize) -> Result<&TreeCommLevel, CommError> {
        self.levels.get(level).ok_or(CommError::LevelRange(level))
    }

    fn level_mut(&mut self, level: usize) -> Result<&mut TreeCommLevel, CommError> {
        self.levels.get_mut(level).ok_or(CommError::LevelRange(level))
    }

    fn controlled_mut(&mut self, level: usize) -> Result<&mut TreeCommLevel, CommError> {
        if level >= self.num_level_ctl {
            return Err(CommError::LevelRange(level));
        }
        self.level_mut(level)
    }
}

/// The Cartesian coordinates of a rank, root dimension first.
fn coordinate(rank: usize, dims: &[usize]) -> Dims {
    let mut result: Dims = SmallVec::with_capacity(dims.len());
    let mut remainder = rank;
    for stride in (0..dims.len()).map(|d| dims[d + 1..].iter().product::<usize>()) {
        result.push(remainder / stride);
        remainder %= stride;
    }
    result
}

fn cart_rank(coords: &[usize], dims: &[usize]) -> usize {
    coords
        .iter()
        .enumerate()
        .map(|(d, c)| c * dims[d + 1..].iter().product::<usize>())
        .sum()
}

/// Number of levels a node with these coordinates controls: the count of
/// trailing zero coordinates, lowest dimension first.
fn num_level_controlled(coords: &[usize]) -> usize {
    coords.iter().rev().take_while(|c| **c == 0).count()
}
