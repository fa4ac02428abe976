//! The reference agent: redistribute a job-wide average power cap to
//! equalize epoch runtime across nodes.
//!
//! The tree runs a three-step cycle driven from the root:
//!
//! 1. `SEND_DOWN_LIMIT`: every node adopts its cap (the average plus any
//!    redistributed slack).
//! 2. `MEASURE_RUNTIME`: every node measures a stable epoch runtime; the
//!    maximum across the job becomes the target.
//! 3. `REDUCE_LIMIT`: every node shrinks its limit until it is as slow as
//!    the target, then reports its slack; the root folds the sum into the
//!    next cycle's cap.
//!
//! Step counts ride in both policy and sample vectors: a child reports the
//! last step it completed, and the root advances only once every node has
//! reported the current one. On the wire, zero stands for "unset" so that
//! vectors stay NaN-free (a NaN frame parks the receiving window).

use std::time::{Duration, Instant};

use crate::agent::power_balancer::PowerBalancer;
use crate::agent::{aggregate_sample, broadcast, Agent, AgentSpec, Aggregation, TickClock};
use crate::error::{Error, Result};
use crate::helper::format_float;
use crate::platform::{Domain, PlatformIo, SIGNAL_EPOCH_COUNT, SIGNAL_EPOCH_RUNTIME};

/// Policy channel order.
pub const POLICY_POWER_CAP: usize = 0;
/// See [`POLICY_POWER_CAP`].
pub const POLICY_STEP_COUNT: usize = 1;
/// See [`POLICY_POWER_CAP`].
pub const POLICY_MAX_EPOCH_RUNTIME: usize = 2;
/// See [`POLICY_POWER_CAP`].
pub const POLICY_POWER_SLACK: usize = 3;

/// Sample channel order.
pub const SAMPLE_STEP_COUNT: usize = 0;
/// See [`SAMPLE_STEP_COUNT`].
pub const SAMPLE_MAX_EPOCH_RUNTIME: usize = 1;
/// See [`SAMPLE_STEP_COUNT`].
pub const SAMPLE_SUM_POWER_SLACK: usize = 2;

const NUM_STEP: u64 = 3;
const STEP_SEND_DOWN_LIMIT: u64 = 0;
const STEP_MEASURE_RUNTIME: u64 = 1;
const STEP_REDUCE_LIMIT: u64 = 2;

const SAMPLE_AGGREGATION: [Aggregation; 3] =
    [Aggregation::ExpectSame, Aggregation::Max, Aggregation::Sum];

/// Seconds the platform needs before a new power limit shows in runtimes.
const CONTROL_LATENCY: f64 = 0.045;
/// Seconds a leaf may sit in one step before reporting NaN upward.
const STALL_TIMEOUT: Duration = Duration::from_secs(60);

const TICK_PERIOD: Duration = Duration::from_millis(5);

fn step_of(step_count: f64) -> u64 {
    (step_count.max(0.0) as u64) % NUM_STEP
}

struct LeafRole {
    balancer: PowerBalancer,
    num_package: usize,
    limit_handles: Vec<usize>,
    runtime_handle: usize,
    count_handle: usize,
    step_count: f64,
    is_step_complete: bool,
    step_enter: Instant,
    last_cap: f64,
    last_adjusted_limit: f64,
    last_epoch_count: f64,
    reported_slack: f64,
    last_runtime: f64,
}

impl LeafRole {
    fn new(platform: &mut PlatformIo) -> Result<LeafRole> {
        let num_package = platform.topo().num_domain(Domain::Package);
        let mut limit_handles = Vec::with_capacity(num_package);
        for package in 0..num_package {
            limit_handles.push(
                platform.push_control("POWER_PACKAGE_LIMIT", Domain::Package, package)?);
        }
        let runtime_handle = platform.push_signal(SIGNAL_EPOCH_RUNTIME, Domain::Board, 0)?;
        let count_handle = platform.push_signal(SIGNAL_EPOCH_COUNT, Domain::Board, 0)?;

        // Until a cap arrives, balance against the limit already in the
        // hardware.
        let mut balancer = PowerBalancer::new(CONTROL_LATENCY);
        let mut node_limit = 0.0;
        for package in 0..num_package {
            node_limit += platform.read_signal("POWER_PACKAGE_LIMIT", Domain::Package, package)?;
        }
        balancer.set_power_cap(node_limit);

        Ok(LeafRole {
            balancer,
            num_package,
            limit_handles,
            runtime_handle,
            count_handle,
            step_count: 0.0,
            is_step_complete: true,
            step_enter: Instant::now(),
            last_cap: f64::NAN,
            last_adjusted_limit: f64::NAN,
            last_epoch_count: 0.0,
            reported_slack: 0.0,
            last_runtime: f64::NAN,
        })
    }

    fn adjust(&mut self, platform: &mut PlatformIo, policy: &[f64]) -> Result<()> {
        let cap = policy[POLICY_POWER_CAP];
        if cap > 0.0 && cap != self.last_cap {
            self.balancer.set_power_cap(cap);
            self.last_cap = cap;
        }
        let step_count = policy[POLICY_STEP_COUNT];
        if !step_count.is_nan() && step_count > self.step_count {
            self.step_count = step_count;
            self.step_enter = Instant::now();
            self.reported_slack = 0.0;
            match step_of(step_count) {
                // Adopting the cap above is the whole of this step.
                STEP_SEND_DOWN_LIMIT => self.is_step_complete = true,
                STEP_MEASURE_RUNTIME => self.is_step_complete = false,
                STEP_REDUCE_LIMIT => {
                    let target = policy[POLICY_MAX_EPOCH_RUNTIME];
                    if target > 0.0 {
                        self.balancer.set_target_runtime(target);
                        self.is_step_complete = false;
                    }
                    else {
                        // Nothing to chase; the step is vacuously done.
                        self.is_step_complete = true;
                    }
                }
                _ => unreachable!(),
            }
        }
        let limit = self.balancer.power_limit();
        for handle in &self.limit_handles {
            platform.adjust(*handle, limit / self.num_package as f64)?;
        }
        if limit != self.last_adjusted_limit {
            self.balancer.power_limit_adjusted(limit);
            self.last_adjusted_limit = limit;
        }
        Ok(())
    }

    fn sample(&mut self, platform: &mut PlatformIo, sample: &mut [f64]) -> Result<()> {
        let epoch_count = platform.sample(self.count_handle)?;
        if epoch_count > self.last_epoch_count {
            self.last_epoch_count = epoch_count;
            let runtime = platform.sample(self.runtime_handle)?;
            if !runtime.is_nan() && runtime > 0.0 {
                self.last_runtime = runtime;
                match step_of(self.step_count) {
                    STEP_MEASURE_RUNTIME => {
                        if !self.is_step_complete && self.balancer.is_runtime_stable(runtime) {
                            self.balancer.calculate_runtime_sample();
                            self.is_step_complete = true;
                        }
                    }
                    STEP_REDUCE_LIMIT => {
                        if !self.is_step_complete && self.balancer.is_target_met(runtime) {
                            self.reported_slack = self.balancer.power_slack();
                            self.is_step_complete = true;
                        }
                    }
                    _ => {}
                }
            }
        }

        let is_stalled = !self.is_step_complete && self.step_enter.elapsed() >= STALL_TIMEOUT;
        sample[SAMPLE_STEP_COUNT] = if self.is_step_complete {
            self.step_count
        }
        else {
            self.step_count - 1.0
        };
        sample[SAMPLE_MAX_EPOCH_RUNTIME] = if is_stalled {
            f64::NAN
        }
        else {
            let runtime = self.balancer.runtime_sample();
            if runtime.is_nan() { 0.0 } else { runtime }
        };
        sample[SAMPLE_SUM_POWER_SLACK] = self.reported_slack;
        Ok(())
    }
}

struct RootRole {
    num_node: f64,
    /// The budget last received from the resource manager.
    manager_cap: f64,
    /// The working cap: the budget plus redistributed slack.
    cap: f64,
    step_count: f64,
    children_done: bool,
    max_runtime: f64,
    sum_slack: f64,
    target: f64,
}

impl RootRole {
    fn new(fan_in: &[usize]) -> RootRole {
        RootRole {
            num_node: fan_in.iter().product::<usize>() as f64,
            manager_cap: f64::NAN,
            cap: f64::NAN,
            step_count: 0.0,
            children_done: false,
            max_runtime: 0.0,
            sum_slack: 0.0,
            target: 0.0,
        }
    }

    fn ascend(&mut self, sample_in: &[Vec<f64>], sample_out: &mut [f64]) {
        aggregate_sample(&SAMPLE_AGGREGATION, sample_in, sample_out);
        if sample_out[SAMPLE_STEP_COUNT] == self.step_count {
            self.children_done = true;
            self.max_runtime = sample_out[SAMPLE_MAX_EPOCH_RUNTIME];
            self.sum_slack = sample_out[SAMPLE_SUM_POWER_SLACK];
        }
    }

    fn descend(&mut self, policy_in: &[f64], policy_out: &mut [Vec<f64>]) {
        let manager_cap = policy_in[POLICY_POWER_CAP];
        if manager_cap > 0.0 && manager_cap != self.manager_cap {
            // A new budget restarts the cycle at the next adopt step.
            self.manager_cap = manager_cap;
            self.cap = manager_cap;
            let mut skip = (NUM_STEP - (self.step_count as u64) % NUM_STEP) % NUM_STEP;
            if skip == 0 {
                skip = NUM_STEP;
            }
            self.step_count += skip as f64;
            self.children_done = false;
            self.target = 0.0;
        }
        else if self.children_done {
            self.step_count += 1.0;
            self.children_done = false;
            match step_of(self.step_count) {
                STEP_MEASURE_RUNTIME => {}
                STEP_REDUCE_LIMIT => self.target = self.max_runtime,
                STEP_SEND_DOWN_LIMIT => {
                    if !self.cap.is_nan() && self.sum_slack > 0.0 {
                        self.cap += self.sum_slack / self.num_node;
                    }
                }
                _ => unreachable!(),
            }
        }
        let wire_cap = if self.cap.is_nan() { 0.0 } else { self.cap };
        let policy = [wire_cap, self.step_count, self.target, 0.0];
        for child in policy_out.iter_mut() {
            child.copy_from_slice(&policy);
        }
    }
}

enum Role {
    Unbound,
    Leaf(LeafRole),
    Tree,
    Root(RootRole),
    /// A one-level tree's root is also a leaf: root logic on the walks,
    /// leaf logic against the platform.
    RootLeaf(RootRole, LeafRole),
}

/// The power-balancing agent; its role depends on the tree level it is
/// bound to at `init`.
pub struct PowerBalancerAgent {
    role: Role,
    clock: TickClock,
}

impl PowerBalancerAgent {
    /// The registry entry for this agent.
    pub fn spec() -> AgentSpec {
        AgentSpec::new(
            vec!["POWER_CAP", "STEP_COUNT", "MAX_EPOCH_RUNTIME", "POWER_SLACK"],
            vec!["STEP_COUNT", "MAX_EPOCH_RUNTIME", "SUM_POWER_SLACK"],
            SAMPLE_AGGREGATION.to_vec(),
            1,
            || Box::new(PowerBalancerAgent::new()))
    }

    /// A fresh, unbound instance.
    pub fn new() -> PowerBalancerAgent {
        PowerBalancerAgent {
            role: Role::Unbound,
            clock: TickClock::new(TICK_PERIOD),
        }
    }
}

impl Default for PowerBalancerAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent for PowerBalancerAgent {
    fn init(&mut self,
            level: usize,
            fan_in: &[usize],
            is_tree_root: bool,
            platform: &mut PlatformIo) -> Result<()> {
        self.role = match (level, is_tree_root) {
            (0, false) => Role::Leaf(LeafRole::new(platform)?),
            (0, true) => Role::RootLeaf(RootRole::new(fan_in), LeafRole::new(platform)?),
            (_, true) => Role::Root(RootRole::new(fan_in)),
            (_, false) => Role::Tree,
        };
        Ok(())
    }

    fn descend(&mut self, policy_in: &[f64], policy_out: &mut [Vec<f64>]) -> Result<bool> {
        match &mut self.role {
            Role::Root(root) | Role::RootLeaf(root, _) => root.descend(policy_in, policy_out),
            _ => broadcast(policy_in, policy_out),
        }
        Ok(true)
    }

    fn ascend(&mut self, sample_in: &[Vec<f64>], sample_out: &mut [f64]) -> Result<bool> {
        match &mut self.role {
            Role::Root(root) | Role::RootLeaf(root, _) => root.ascend(sample_in, sample_out),
            _ => aggregate_sample(&SAMPLE_AGGREGATION, sample_in, sample_out),
        }
        Ok(true)
    }

    fn adjust_platform(&mut self, platform: &mut PlatformIo, policy: &[f64]) -> Result<()> {
        match &mut self.role {
            Role::Leaf(leaf) | Role::RootLeaf(_, leaf) => leaf.adjust(platform, policy),
            _ => Err(Error::Logic("adjust_platform() called above the leaf level".into())),
        }
    }

    fn sample_platform(&mut self, platform: &mut PlatformIo, sample: &mut [f64]) -> Result<()> {
        match &mut self.role {
            Role::Leaf(leaf) | Role::RootLeaf(_, leaf) => leaf.sample(platform, sample),
            _ => Err(Error::Logic("sample_platform() called above the leaf level".into())),
        }
    }

    fn wait(&mut self) {
        self.clock.wait();
    }

    fn report_header(&self) -> Vec<(String, String)> {
        match &self.role {
            Role::Root(root) | Role::RootLeaf(root, _) => vec![
                ("Power budget (watts)".into(), format_float(root.cap)),
                ("Balancing steps".into(), format!("{}", root.step_count as u64)),
            ],
            _ => Vec::new(),
        }
    }

    fn report_node(&self) -> Vec<(String, String)> {
        match &self.role {
            Role::Leaf(leaf) | Role::RootLeaf(_, leaf) => vec![
                ("power cap (watts)".into(), format_float(leaf.balancer.power_cap())),
                ("power limit (watts)".into(), format_float(leaf.balancer.power_limit())),
                ("epoch runtime (sec)".into(), format_float(leaf.balancer.runtime_sample())),
            ],
            _ => Vec::new(),
        }
    }

    fn trace_columns(&self) -> Vec<String> {
        match self.role {
            Role::Leaf(_) | Role::RootLeaf(..) => vec![
                "POLICY_POWER_CAP".into(),
                "POWER_LIMIT".into(),
                "EPOCH_RUNTIME".into(),
                "POWER_SLACK".into(),
            ],
            _ => Vec::new(),
        }
    }

    fn trace_values(&mut self, _platform: &mut PlatformIo) -> Result<Vec<f64>> {
        match &self.role {
            Role::Leaf(leaf) | Role::RootLeaf(_, leaf) => Ok(vec![
                leaf.balancer.power_cap(),
                leaf.balancer.power_limit(),
                leaf.last_runtime,
                leaf.balancer.power_cap() - leaf.balancer.power_limit(),
            ]),
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{MemoryMsr, PlatformTopo, SharedMsrIo};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn leaf_setup() -> (Rc<RefCell<MemoryMsr>>, PlatformIo, PowerBalancerAgent) {
        let device = Rc::new(RefCell::new(MemoryMsr::new()));
        // Hardware limit preset to 100 W per package (800 counts of 1/8 W).
        device.borrow_mut().poke(0, 0x610, 800);
        device.borrow_mut().poke(1, 0x610, 800);
        let mut pio = PlatformIo::new(PlatformTopo::new(2, 2, 2),
                                      Rc::clone(&device) as SharedMsrIo);
        let mut agent = PowerBalancerAgent::new();
        agent.init(0, &[4], false, &mut pio).unwrap();
        (device, pio, agent)
    }

    #[test]
    fn leaf_starts_from_the_hardware_limit() {
        let (device, mut pio, mut agent) = leaf_setup();
        // No cap yet: the wire policy carries zeros.
        agent.adjust_platform(&mut pio, &[0.0, 0.0, 0.0, 0.0]).unwrap();
        pio.write_batch().unwrap();
        assert_eq!(device.borrow().peek(0, 0x610) & 0x7FFF, 800);
        assert_eq!(device.borrow().peek(1, 0x610) & 0x7FFF, 800);
    }

    #[test]
    fn leaf_adopts_a_new_cap_and_reports_the_step() {
        let (device, mut pio, mut agent) = leaf_setup();
        agent.adjust_platform(&mut pio, &[160.0, 3.0, 0.0, 0.0]).unwrap();
        pio.write_batch().unwrap();
        // 160 W across two packages: 80 W each, 640 counts.
        assert_eq!(device.borrow().peek(0, 0x610) & 0x7FFF, 640);

        pio.read_batch().unwrap();
        let mut sample = vec![0.0; 3];
        agent.sample_platform(&mut pio, &mut sample).unwrap();
        assert_eq!(sample[SAMPLE_STEP_COUNT], 3.0);
        assert_eq!(sample[SAMPLE_SUM_POWER_SLACK], 0.0);
    }

    #[test]
    fn leaf_reports_previous_step_until_measurement_settles() {
        let (_device, mut pio, mut agent) = leaf_setup();
        agent.adjust_platform(&mut pio, &[160.0, 4.0, 0.0, 0.0]).unwrap();
        pio.read_batch().unwrap();
        let mut sample = vec![0.0; 3];
        agent.sample_platform(&mut pio, &mut sample).unwrap();
        // Measure step entered but no stable runtime yet.
        assert_eq!(sample[SAMPLE_STEP_COUNT], 3.0);
    }

    #[test]
    fn root_cycle_measures_targets_and_redistributes() {
        let mut root = RootRole::new(&[2, 2]);
        assert_eq!(root.num_node, 4.0);
        let mut out_policy = vec![vec![0.0; 4]; 2];

        // A manager budget restarts the cycle at the adopt step.
        root.descend(&[160.0, f64::NAN, f64::NAN, f64::NAN], &mut out_policy);
        assert_eq!(out_policy[0], vec![160.0, 3.0, 0.0, 0.0]);

        // Children adopt; the next descend opens the measure step.
        let mut agg = vec![0.0; 3];
        root.ascend(&[vec![3.0, 0.0, 0.0], vec![3.0, 0.0, 0.0]], &mut agg);
        root.descend(&[160.0, f64::NAN, f64::NAN, f64::NAN], &mut out_policy);
        assert_eq!(out_policy[0][POLICY_STEP_COUNT], 4.0);

        // Runtimes arrive; the slowest becomes the reduce target.
        root.ascend(&[vec![4.0, 1.00, 0.0], vec![4.0, 1.05, 0.0]], &mut agg);
        root.descend(&[160.0, f64::NAN, f64::NAN, f64::NAN], &mut out_policy);
        assert_eq!(out_policy[0][POLICY_STEP_COUNT], 5.0);
        assert_eq!(out_policy[0][POLICY_MAX_EPOCH_RUNTIME], 1.05);

        // Slack returns; the cap grows by the per-node share.
        root.ascend(&[vec![5.0, 1.05, 8.0], vec![5.0, 1.05, 4.0]], &mut agg);
        root.descend(&[160.0, f64::NAN, f64::NAN, f64::NAN], &mut out_policy);
        assert_eq!(out_policy[0][POLICY_STEP_COUNT], 6.0);
        assert_eq!(out_policy[0][POLICY_POWER_CAP], 163.0);

        // The manager's unchanged budget does not revert the
        // redistribution; a changed budget does.
        root.descend(&[160.0, f64::NAN, f64::NAN, f64::NAN], &mut out_policy);
        assert_eq!(out_policy[0][POLICY_POWER_CAP], 163.0);
        root.descend(&[200.0, f64::NAN, f64::NAN, f64::NAN], &mut out_policy);
        assert_eq!(out_policy[0][POLICY_POWER_CAP], 200.0);
        assert_eq!(out_policy[0][POLICY_STEP_COUNT], 9.0);
    }

    #[test]
    fn root_waits_for_stragglers() {
        let mut root = RootRole::new(&[2]);
        let mut out_policy = vec![vec![0.0; 4]; 2];
        root.descend(&[100.0, f64::NAN, f64::NAN, f64::NAN], &mut out_policy);
        let mut agg = vec![0.0; 3];
        // One child is a step behind: no advance.
        root.ascend(&[vec![3.0, 0.0, 0.0], vec![2.0, 0.0, 0.0]], &mut agg);
        root.descend(&[100.0, f64::NAN, f64::NAN, f64::NAN], &mut out_policy);
        assert_eq!(out_policy[0][POLICY_STEP_COUNT], 3.0);
    }
}
