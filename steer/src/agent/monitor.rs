//! The default agent: observe, aggregate, control nothing.

use std::time::Duration;

use crate::agent::{aggregate_sample, broadcast, Agent, AgentSpec, Aggregation, TickClock};
use crate::error::{Error, Result};
use crate::helper::format_float;
use crate::platform::{Domain, PlatformIo};

const SAMPLE_POWER: usize = 0;
const SAMPLE_ENERGY: usize = 1;
const SAMPLE_FREQUENCY: usize = 2;

const TICK_PERIOD: Duration = Duration::from_millis(5);

/// Samples node power, energy, and frequency; makes no control decisions.
pub struct MonitorAgent {
    clock: TickClock,
    handles: Option<[usize; 3]>,
    last_sample: [f64; 3],
}

impl MonitorAgent {
    /// The registry entry for this agent.
    pub fn spec() -> AgentSpec {
        AgentSpec::new(
            Vec::new(),
            vec!["POWER_PACKAGE", "ENERGY_PACKAGE", "FREQUENCY"],
            vec![Aggregation::Sum, Aggregation::Sum, Aggregation::Mean],
            0,
            || Box::new(MonitorAgent::new()))
    }

    /// A fresh instance; handles are pushed in `init`.
    pub fn new() -> MonitorAgent {
        MonitorAgent {
            clock: TickClock::new(TICK_PERIOD),
            handles: None,
            last_sample: [f64::NAN; 3],
        }
    }
}

impl Default for MonitorAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl Agent for MonitorAgent {
    fn init(&mut self,
            level: usize,
            _fan_in: &[usize],
            _is_tree_root: bool,
            platform: &mut PlatformIo) -> Result<()> {
        if level == 0 {
            self.handles = Some([
                platform.push_signal("POWER_PACKAGE", Domain::Board, 0)?,
                platform.push_signal("ENERGY_PACKAGE", Domain::Board, 0)?,
                platform.push_signal("FREQUENCY", Domain::Board, 0)?,
            ]);
        }
        Ok(())
    }

    fn descend(&mut self, policy_in: &[f64], policy_out: &mut [Vec<f64>]) -> Result<bool> {
        broadcast(policy_in, policy_out);
        Ok(true)
    }

    fn ascend(&mut self, sample_in: &[Vec<f64>], sample_out: &mut [f64]) -> Result<bool> {
        aggregate_sample(&[Aggregation::Sum, Aggregation::Sum, Aggregation::Mean],
                         sample_in, sample_out);
        Ok(true)
    }

    fn adjust_platform(&mut self, _platform: &mut PlatformIo, _policy: &[f64]) -> Result<()> {
        Ok(())
    }

    fn sample_platform(&mut self, platform: &mut PlatformIo, sample: &mut [f64]) -> Result<()> {
        let handles = self.handles.ok_or_else(|| {
            Error::Logic("sample_platform() called before init()".into())
        })?;
        for (slot, handle) in handles.iter().enumerate() {
            self.last_sample[slot] = platform.sample(*handle)?;
        }
        sample.copy_from_slice(&self.last_sample);
        Ok(())
    }

    fn wait(&mut self) {
        self.clock.wait();
    }

    fn report_node(&self) -> Vec<(String, String)> {
        vec![
            ("power (watts)".into(), format_float(self.last_sample[SAMPLE_POWER])),
            ("energy (joules)".into(), format_float(self.last_sample[SAMPLE_ENERGY])),
            ("frequency (Hz)".into(), format_float(self.last_sample[SAMPLE_FREQUENCY])),
        ]
    }

    fn trace_columns(&self) -> Vec<String> {
        Vec::new()
    }
}
