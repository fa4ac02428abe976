//! One level of the tree communicator.
//!
//! A level is a group of nodes with a common parent: rank 0 of the level is
//! the parent (the level root) and every member, root included, deposits
//! upward samples into the root's sample window. Policies travel the other
//! way, one window per member. Frames are `[is_ready, values…]`; a NaN in
//! any value position makes the frame count as not ready.

use std::mem;
use std::sync::Arc;

use steer_logging::{CommEvent, Logger};

use crate::window::Window;
use crate::CommError;

/// A single level of the tree: one sample window at the root, one policy
/// window per member.
pub struct TreeCommLevel {
    level: usize,
    rank: usize,
    size: usize,
    num_send_up: usize,
    num_send_down: usize,
    sample_window: Arc<Window>,
    policy_windows: Vec<Arc<Window>>,
    policy_last: Vec<Vec<f64>>,
    overhead_send: usize,
    logger: Option<Logger<CommEvent>>,
}

impl TreeCommLevel {
    pub(crate) fn new(
        level: usize,
        rank: usize,
        size: usize,
        num_send_up: usize,
        num_send_down: usize,
        sample_window: Arc<Window>,
        policy_windows: Vec<Arc<Window>>) -> TreeCommLevel
    {
        let policy_last = if rank == 0 {
            vec![vec![0.0; num_send_down]; size]
        }
        else {
            Vec::new()
        };
        TreeCommLevel {
            level,
            rank,
            size,
            num_send_up,
            num_send_down,
            sample_window,
            policy_windows,
            policy_last,
            overhead_send: 0,
            logger: None,
        }
    }

    /// This node's rank within the level; rank 0 is the level root.
    pub fn level_rank(&self) -> usize {
        self.rank
    }

    /// Number of members of the level.
    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn set_logger(&mut self, logger: Logger<CommEvent>) {
        self.logger = Some(logger);
    }

    /// Deposits this node's sample into the level root's sample window.
    pub fn send_up(&mut self, sample: &[f64]) -> Result<(), CommError> {
        if sample.len() != self.num_send_up {
            return Err(CommError::InvalidSize {
                what: "sample",
                expected: self.num_send_up,
                got: sample.len(),
            });
        }
        let frame = self.num_send_up + 1;
        let base = self.rank * frame;
        {
            let mut window = self.sample_window.lock_exclusive();
            window[base] = 1.0;
            window[base + 1..base + frame].copy_from_slice(sample);
        }
        if self.rank != 0 {
            // Rank 0 copies into its own mailbox; only remote deposits count
            // as controller network traffic.
            let bytes = frame * mem::size_of::<f64>();
            self.overhead_send += bytes;
            if let Some(logger) = &self.logger {
                logger.log(CommEvent::SentUp { level: self.level, bytes });
            }
        }
        Ok(())
    }

    /// Distributes one policy per member, skipping members whose policy is
    /// unchanged since the last send.
    ///
    /// Only the level root may call this.
    pub fn send_down(&mut self, policy: &[Vec<f64>]) -> Result<(), CommError> {
        if self.rank != 0 {
            return Err(CommError::Logic("send_down() called from rank not at root of level"));
        }
        if policy.len() != self.size {
            return Err(CommError::InvalidSize {
                what: "policy",
                expected: self.size,
                got: policy.len(),
            });
        }
        for child in policy {
            if child.len() != self.num_send_down {
                return Err(CommError::InvalidSize {
                    what: "policy",
                    expected: self.num_send_down,
                    got: child.len(),
                });
            }
        }
        // Copy message to self for rank zero, unconditionally.
        {
            let mut window = self.policy_windows[0].lock_exclusive();
            window[0] = 1.0;
            window[1..].copy_from_slice(&policy[0]);
        }
        let bytes = (self.num_send_down + 1) * mem::size_of::<f64>();
        for child_rank in 1..self.size {
            if policy[child_rank] != self.policy_last[child_rank] {
                let mut window = self.policy_windows[child_rank].lock_exclusive();
                window[0] = 1.0;
                window[1..].copy_from_slice(&policy[child_rank]);
                drop(window);
                self.overhead_send += bytes;
                self.policy_last[child_rank].copy_from_slice(&policy[child_rank]);
                if let Some(logger) = &self.logger {
                    logger.log(CommEvent::SentDown { level: self.level, child: child_rank, bytes });
                }
            }
            else if let Some(logger) = &self.logger {
                logger.log(CommEvent::Suppressed { level: self.level, child: child_rank });
            }
        }
        Ok(())
    }

    /// Gathers every member's sample at the level root.
    ///
    /// Returns false, exposing no partial progress, unless every member's
    /// frame is ready and NaN-free; on success all ready flags are cleared.
    pub fn receive_up(&mut self, sample: &mut [Vec<f64>]) -> Result<bool, CommError> {
        if self.rank != 0 {
            return Err(CommError::Logic("receive_up() called from rank not at root of level"));
        }
        if sample.len() != self.size {
            return Err(CommError::InvalidSize {
                what: "sample",
                expected: self.size,
                got: sample.len(),
            });
        }
        let frame = self.num_send_up + 1;
        let mut is_complete = {
            let window = self.sample_window.lock_shared();
            (0..self.size).all(|child| window[child * frame] != 0.0)
        };
        if is_complete {
            let mut window = self.sample_window.lock_exclusive();
            for (child, out) in sample.iter_mut().enumerate() {
                out.resize(self.num_send_up, 0.0);
                let base = child * frame;
                out.copy_from_slice(&window[base + 1..base + frame]);
                window[base] = 0.0;
            }
            is_complete = !sample.iter().flatten().any(|value| value.is_nan());
        }
        Ok(is_complete)
    }

    /// Polls this member's policy window.
    ///
    /// On a ready frame the policy is copied out and the flag is cleared;
    /// a frame containing NaN is copied but reported not ready.
    pub fn receive_down(&mut self, policy: &mut Vec<f64>) -> Result<bool, CommError> {
        let mut window = self.policy_windows[self.rank].lock_exclusive();
        let mut is_complete = false;
        if window[0] != 0.0 {
            policy.resize(self.num_send_down, 0.0);
            policy.copy_from_slice(&window[1..]);
            window[0] = 0.0;
            is_complete = !policy.iter().any(|value| value.is_nan());
        }
        Ok(is_complete)
    }

    /// Bytes this node has deposited into remote windows at this level.
    pub fn overhead_send(&self) -> usize {
        self.overhead_send
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_level(size: usize, num_up: usize, num_down: usize) -> Vec<TreeCommLevel> {
        let sample_window = Window::new(size * (num_up + 1));
        let policy_windows: Vec<_> = (0..size).map(|_| Window::new(num_down + 1)).collect();
        (0..size)
            .map(|rank| {
                TreeCommLevel::new(0, rank, size, num_up, num_down,
                                   Arc::clone(&sample_window),
                                   policy_windows.iter().map(Arc::clone).collect())
            })
            .collect()
    }

    #[test]
    fn gather_waits_for_all_members() {
        let mut members = make_level(3, 2, 1);
        let mut gathered = vec![vec![0.0; 2]; 3];

        members[1].send_up(&[1.0, 10.0]).unwrap();
        let (root, rest) = members.split_at_mut(1);
        assert!(!root[0].receive_up(&mut gathered).unwrap());

        rest[1].send_up(&[2.0, 20.0]).unwrap();
        root[0].send_up(&[0.0, 0.5]).unwrap();
        assert!(root[0].receive_up(&mut gathered).unwrap());
        assert_eq!(gathered, vec![vec![0.0, 0.5], vec![1.0, 10.0], vec![2.0, 20.0]]);

        // Flags were cleared by the gather.
        assert!(!root[0].receive_up(&mut gathered).unwrap());
    }

    #[test]
    fn nan_sample_is_not_ready() {
        let mut members = make_level(2, 1, 1);
        members[1].send_up(&[f64::NAN]).unwrap();
        members[0].send_up(&[1.0]).unwrap();
        let mut gathered = vec![vec![0.0; 1]; 2];
        assert!(!members[0].receive_up(&mut gathered).unwrap());
    }

    #[test]
    fn policy_reaches_each_member_once() {
        let mut members = make_level(3, 1, 2);
        let policy = vec![vec![100.0, 0.0], vec![101.0, 0.0], vec![102.0, 0.0]];
        members[0].send_down(&policy).unwrap();

        let mut received = Vec::new();
        for (rank, member) in members.iter_mut().enumerate() {
            assert!(member.receive_down(&mut received).unwrap());
            assert_eq!(received, vec![100.0 + rank as f64, 0.0]);
            // Cleared by the receive.
            assert!(!member.receive_down(&mut received).unwrap());
        }
    }

    #[test]
    fn unchanged_policy_send_is_suppressed() {
        let mut members = make_level(2, 1, 1);
        let policy = vec![vec![7.0], vec![8.0]];
        members[0].send_down(&policy).unwrap();
        let after_first = members[0].overhead_send();
        assert!(after_first > 0);

        members[0].send_down(&policy).unwrap();
        assert_eq!(members[0].overhead_send(), after_first);

        members[0].send_down(&[vec![7.0], vec![9.0]]).unwrap();
        assert!(members[0].overhead_send() > after_first);
    }

    #[test]
    fn nan_policy_is_not_ready() {
        let mut members = make_level(2, 1, 1);
        members[0].send_down(&[vec![0.0], vec![f64::NAN]]).unwrap();
        let mut received = Vec::new();
        assert!(!members[1].receive_down(&mut received).unwrap());
    }

    #[test]
    fn missized_vectors_rejected() {
        let mut members = make_level(2, 2, 1);
        assert!(matches!(members[1].send_up(&[1.0]),
                         Err(CommError::InvalidSize { .. })));
        assert!(matches!(members[0].send_down(&[vec![1.0]]),
                         Err(CommError::InvalidSize { .. })));
        assert!(matches!(members[1].send_down(&[vec![1.0], vec![2.0]]),
                         Err(CommError::Logic(_))));
    }

    #[test]
    fn overhead_counts_remote_deposits_only() {
        let mut members = make_level(2, 3, 1);
        members[0].send_up(&[0.0; 3]).unwrap();
        assert_eq!(members[0].overhead_send(), 0);
        members[1].send_up(&[0.0; 3]).unwrap();
        assert_eq!(members[1].overhead_send(), 4 * mem::size_of::<f64>());
    }
}
