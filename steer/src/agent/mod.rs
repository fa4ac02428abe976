//! The pluggable per-level decision function.
//!
//! One agent instance runs at every tree level a node controls (plus one
//! at the leaf). Going down, `descend` rewrites the parent's policy per
//! child and `adjust_platform` translates the final policy into platform
//! controls at the leaf. Going up, `sample_platform` reads the leaf's
//! telemetry and `ascend` folds children's samples into one.
//!
//! Agents are resolved by name through an [`AgentRegistry`] passed into
//! controller construction; there is no process-wide plugin table.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::platform::PlatformIo;
use crate::region::REGION_ID_UNMARKED;

pub mod monitor;
pub mod power_balancer;
pub mod power_balancer_agent;

pub use monitor::MonitorAgent;
pub use power_balancer::PowerBalancer;
pub use power_balancer_agent::PowerBalancerAgent;

/// How one sample channel folds across children.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregation {
    /// Arithmetic sum.
    Sum,
    /// Arithmetic mean.
    Mean,
    /// Minimum.
    Min,
    /// Maximum.
    Max,
    /// 1.0 when any input is nonzero.
    LogicalOr,
    /// Sample standard deviation.
    StdDev,
    /// The first child's value.
    SelectFirst,
    /// The common value; NaN when children disagree.
    ExpectSame,
    /// A region id all children share, else the unmarked region.
    RegionHash,
    /// A region hint all children share, else unknown.
    RegionHint,
}

/// Folds `values` with the given function; an empty input is NaN.
pub fn aggregate(agg: Aggregation, values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    match agg {
        Aggregation::Sum => values.iter().sum(),
        Aggregation::Mean => values.iter().sum::<f64>() / values.len() as f64,
        Aggregation::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Aggregation::LogicalOr => {
            if values.iter().any(|v| *v != 0.0) { 1.0 } else { 0.0 }
        }
        Aggregation::StdDev => {
            if values.len() < 2 {
                return 0.0;
            }
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                / (values.len() - 1) as f64;
            var.sqrt()
        }
        Aggregation::SelectFirst => values[0],
        Aggregation::ExpectSame => {
            if values.iter().all(|v| v.to_bits() == values[0].to_bits()) {
                values[0]
            }
            else {
                f64::NAN
            }
        }
        Aggregation::RegionHash => {
            if values.iter().all(|v| v.to_bits() == values[0].to_bits()) {
                values[0]
            }
            else {
                f64::from_bits(REGION_ID_UNMARKED)
            }
        }
        Aggregation::RegionHint => {
            if values.iter().all(|v| v.to_bits() == values[0].to_bits()) {
                values[0]
            }
            else {
                0.0
            }
        }
    }
}

/// Copies the incoming policy to every child unchanged.
pub fn broadcast(policy_in: &[f64], policy_out: &mut [Vec<f64>]) {
    for child in policy_out.iter_mut() {
        child.copy_from_slice(policy_in);
    }
}

/// Folds children's samples element-wise with per-channel functions.
pub fn aggregate_sample(aggs: &[Aggregation],
                        sample_in: &[Vec<f64>],
                        sample_out: &mut [f64]) {
    let mut column = Vec::with_capacity(sample_in.len());
    for (channel, agg) in aggs.iter().enumerate() {
        column.clear();
        column.extend(sample_in.iter().map(|child| child[channel]));
        sample_out[channel] = aggregate(*agg, &column);
    }
}

/// The per-level decision function evaluated each controller tick.
pub trait Agent {
    /// Binds the agent to its tree level. `fan_in[l]` is the fan-out of
    /// level `l`; `is_tree_root` marks the topmost agent on the node that
    /// roots the whole tree. The leaf agent (level 0) pushes its platform
    /// handles here.
    fn init(&mut self,
            level: usize,
            fan_in: &[usize],
            is_tree_root: bool,
            platform: &mut PlatformIo) -> Result<()>;

    /// Rewrites the incoming policy into one policy per child. Returns
    /// whether the result should be sent.
    fn descend(&mut self, policy_in: &[f64], policy_out: &mut [Vec<f64>]) -> Result<bool>;

    /// Folds children's samples into this node's upward sample. Returns
    /// whether the result should be sent.
    fn ascend(&mut self, sample_in: &[Vec<f64>], sample_out: &mut [f64]) -> Result<bool>;

    /// Leaf only: stages platform controls for the final policy.
    fn adjust_platform(&mut self, platform: &mut PlatformIo, policy: &[f64]) -> Result<()>;

    /// Leaf only: reads platform signals into the upward sample.
    fn sample_platform(&mut self, platform: &mut PlatformIo, sample: &mut [f64]) -> Result<()>;

    /// Blocks until the next control tick boundary.
    fn wait(&mut self);

    /// Key/value pairs for the report header (root agent).
    fn report_header(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Key/value pairs for this node's report block.
    fn report_node(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Extra per-region report fields keyed by region id.
    fn report_region(&self) -> HashMap<u64, Vec<(String, String)>> {
        HashMap::new()
    }

    /// Names of the agent's extra trace columns.
    fn trace_columns(&self) -> Vec<String> {
        Vec::new()
    }

    /// Values for the agent's extra trace columns, one per tick.
    fn trace_values(&mut self, _platform: &mut PlatformIo) -> Result<Vec<f64>> {
        Ok(Vec::new())
    }
}

/// Everything the controller needs to know about an agent kind without
/// instantiating it.
pub struct AgentSpec {
    /// Downward policy channel names, in order.
    pub policy_names: Vec<&'static str>,
    /// Upward sample channel names, in order.
    pub sample_names: Vec<&'static str>,
    /// Per-channel fold used by the default ascend.
    pub sample_aggregation: Vec<Aggregation>,
    /// Policy channels beyond this count may be NaN (optional).
    pub num_required_policy: usize,
    factory: Box<dyn Fn() -> Box<dyn Agent> + Send + Sync>,
}

impl AgentSpec {
    /// Builds a spec from channel declarations and a constructor.
    pub fn new(policy_names: Vec<&'static str>,
               sample_names: Vec<&'static str>,
               sample_aggregation: Vec<Aggregation>,
               num_required_policy: usize,
               factory: impl Fn() -> Box<dyn Agent> + Send + Sync + 'static) -> AgentSpec {
        assert_eq!(sample_names.len(), sample_aggregation.len());
        AgentSpec {
            policy_names,
            sample_names,
            sample_aggregation,
            num_required_policy,
            factory: Box::new(factory),
        }
    }

    /// Instantiates one agent of this kind.
    pub fn make(&self) -> Box<dyn Agent> {
        (self.factory)()
    }
}

/// An explicit name-to-agent table, passed by reference into controller
/// construction.
#[derive(Default)]
pub struct AgentRegistry {
    specs: HashMap<String, AgentSpec>,
}

impl AgentRegistry {
    /// An empty registry.
    pub fn new() -> AgentRegistry {
        AgentRegistry::default()
    }

    /// The registry with the built-in agents installed.
    pub fn with_defaults() -> AgentRegistry {
        let mut registry = AgentRegistry::new();
        registry.register("monitor", MonitorAgent::spec());
        registry.register("power_balancer", PowerBalancerAgent::spec());
        registry
    }

    /// Installs (or replaces) an agent kind under `name`.
    pub fn register(&mut self, name: &str, spec: AgentSpec) {
        self.specs.insert(name.to_owned(), spec);
    }

    /// Looks up a kind by name.
    pub fn spec(&self, name: &str) -> Result<&AgentSpec> {
        self.specs.get(name).ok_or_else(|| {
            Error::InvalidArgument(format!("agent {:?} is not registered", name))
        })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.specs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Sleeps out the remainder of a fixed control period.
pub struct TickClock {
    period: Duration,
    next: Instant,
}

impl TickClock {
    /// A clock ticking every `period`.
    pub fn new(period: Duration) -> TickClock {
        TickClock { period, next: Instant::now() + period }
    }

    /// Blocks until the next tick boundary. A caller that overran one or
    /// more boundaries resynchronizes without sleeping.
    pub fn wait(&mut self) {
        let now = Instant::now();
        if now < self.next {
            std::thread::sleep(self.next - now);
            self.next += self.period;
        }
        else {
            self.next = now + self.period;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_or_folds_any_nonzero() {
        assert_eq!(aggregate(Aggregation::LogicalOr, &[1.0, 0.0, 1.0]), 1.0);
        assert_eq!(aggregate(Aggregation::LogicalOr, &[0.0, 0.0, 0.0]), 0.0);
        assert!(aggregate(Aggregation::LogicalOr, &[]).is_nan());
    }

    #[test]
    fn numeric_folds() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(aggregate(Aggregation::Sum, &values), 10.0);
        assert_eq!(aggregate(Aggregation::Mean, &values), 2.5);
        assert_eq!(aggregate(Aggregation::Min, &values), 1.0);
        assert_eq!(aggregate(Aggregation::Max, &values), 4.0);
        assert_eq!(aggregate(Aggregation::SelectFirst, &values), 1.0);
        let stddev = aggregate(Aggregation::StdDev, &values);
        assert!((stddev - 1.2909944487).abs() < 1e-9);
    }

    #[test]
    fn expect_same_detects_disagreement() {
        assert_eq!(aggregate(Aggregation::ExpectSame, &[7.0, 7.0]), 7.0);
        assert!(aggregate(Aggregation::ExpectSame, &[7.0, 8.0]).is_nan());
    }

    #[test]
    fn region_folds_degrade_gracefully() {
        let id = f64::from_bits(0x1234);
        assert_eq!(aggregate(Aggregation::RegionHash, &[id, id]).to_bits(), 0x1234);
        let mixed = aggregate(Aggregation::RegionHash, &[id, f64::from_bits(0x9999)]);
        assert_eq!(mixed.to_bits(), REGION_ID_UNMARKED);
        assert_eq!(aggregate(Aggregation::RegionHint, &[3.0, 5.0]), 0.0);
    }

    #[test]
    fn broadcast_copies_to_each_child() {
        let policy = [160.0, f64::NAN];
        let mut out = vec![vec![0.0; 2]; 3];
        broadcast(&policy, &mut out);
        for child in &out {
            assert_eq!(child[0], 160.0);
            assert!(child[1].is_nan());
        }
    }

    #[test]
    fn aggregate_sample_folds_per_channel() {
        let aggs = [Aggregation::Max, Aggregation::Sum];
        let children = vec![vec![1.0, 10.0], vec![3.0, 20.0], vec![2.0, 30.0]];
        let mut out = vec![0.0; 2];
        aggregate_sample(&aggs, &children, &mut out);
        assert_eq!(out, vec![3.0, 60.0]);
    }

    #[test]
    fn registry_resolves_defaults() {
        let registry = AgentRegistry::with_defaults();
        assert!(registry.spec("monitor").is_ok());
        assert!(registry.spec("power_balancer").is_ok());
        assert!(registry.spec("nonesuch").is_err());
        assert_eq!(registry.names(), vec!["monitor", "power_balancer"]);
        let spec = registry.spec("power_balancer").unwrap();
        assert_eq!(spec.policy_names.len(), 4);
        assert_eq!(spec.sample_names.len(), spec.sample_aggregation.len());
    }

    #[test]
    fn tick_clock_paces_the_loop() {
        let mut clock = TickClock::new(Duration::from_millis(5));
        let begin = Instant::now();
        clock.wait();
        clock.wait();
        assert!(begin.elapsed() >= Duration::from_millis(9));
    }
}
