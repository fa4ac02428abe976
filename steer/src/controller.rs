//! The per-tick scheduler.
//!
//! Each tick walks the tree down (policy in, platform controls out), lets
//! the application I/O drain, walks the tree up (platform telemetry in,
//! samples out), and sleeps to the next tick boundary. Queued signals are
//! checked between phases so a fatal signal unwinds from a safe point.
//! When the application requests shutdown the controller produces the
//! report and flushes the trace.

use std::collections::HashMap;

use steer_communication::TreeComm;
use steer_logging::{ControllerEvent, Logger};

use crate::agent::{Agent, AgentRegistry};
use crate::endpoint::{ManagerIo, ManagerIoSampler};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::platform::msr::field_to_signal;
use crate::platform::{Domain, PlatformIo};
use crate::profile::ApplicationInlet;
use crate::region::REGION_ID_INVALID;
use crate::reporter::{AppTotals, RegionReport, Reporter};
use crate::signal_handler;
use crate::tracer::Tracer;

#[derive(Default)]
struct RegionFrequency {
    freq_ticks: HashMap<u64, (f64, u64)>,
    max_freq: f64,
}

impl RegionFrequency {
    fn record(&mut self, region_id: u64, freq: f64) {
        if region_id == REGION_ID_INVALID || freq.is_nan() {
            return;
        }
        let slot = self.freq_ticks.entry(region_id).or_insert((0.0, 0));
        slot.0 += freq;
        slot.1 += 1;
        self.max_freq = self.max_freq.max(freq);
    }

    fn percent(&self, region_id: u64) -> f64 {
        let Some((sum, ticks)) = self.freq_ticks.get(&region_id) else {
            return f64::NAN;
        };
        if *ticks == 0 || self.max_freq == 0.0 {
            return f64::NAN;
        }
        (sum / *ticks as f64) / self.max_freq * 100.0
    }
}

/// One node's control loop.
pub struct Controller {
    comm: TreeComm,
    platform_io: PlatformIo,
    application_io: Box<dyn ApplicationInlet>,
    reporter: Reporter,
    tracer: Tracer,
    manager_sampler: Option<ManagerIoSampler>,
    manager_io: Option<ManagerIo>,
    agents: Vec<Box<dyn Agent>>,
    agent_name: String,
    num_level_ctl: usize,
    is_root: bool,
    policy_seen: bool,
    in_policy: Vec<f64>,
    out_policy: Vec<Vec<Vec<f64>>>,
    in_sample: Vec<Vec<Vec<f64>>>,
    out_sample: Vec<f64>,
    time_handle: usize,
    energy_handle: usize,
    power_handle: usize,
    freq_handle: usize,
    energy_tracker: usize,
    start_energy: f64,
    region_freq: RegionFrequency,
    tick_count: u64,
    logger: Option<Logger<ControllerEvent>>,
}

impl Controller {
    /// Assembles a controller from its parts. The agent named by the
    /// environment is instantiated once per controlled level and every
    /// platform handle is pushed here, before the first batch.
    pub fn new(env: &Environment,
               registry: &AgentRegistry,
               comm: TreeComm,
               mut platform_io: PlatformIo,
               application_io: Box<dyn ApplicationInlet>) -> Result<Controller> {
        let spec = registry.spec(&env.agent)?;
        let num_send_down = spec.policy_names.len();
        let num_send_up = spec.sample_names.len();

        let num_level_ctl = comm.num_level_controlled();
        let root_level = comm.root_level();
        let is_root = num_level_ctl == root_level;

        let mut fan_in = Vec::with_capacity(root_level);
        for level in 0..root_level {
            fan_in.push(comm.level_size(level)?);
        }

        let mut out_policy = Vec::with_capacity(num_level_ctl);
        let mut in_sample = Vec::with_capacity(num_level_ctl);
        for level in 0..num_level_ctl {
            let num_children = fan_in[level];
            out_policy.push(vec![vec![0.0; num_send_down]; num_children]);
            in_sample.push(vec![vec![0.0; num_send_up]; num_children]);
        }

        let num_agent = num_level_ctl.max(1);
        let mut agents = Vec::with_capacity(num_agent);
        for level in 0..num_agent {
            let is_tree_root = is_root && num_level_ctl > 0 && level == num_level_ctl - 1;
            let mut agent = spec.make();
            agent.init(level, &fan_in, is_tree_root, &mut platform_io)?;
            agents.push(agent);
        }

        let manager_sampler = match (&env.policy, num_send_down) {
            (Some(path), arity) if is_root && arity > 0 => {
                Some(ManagerIoSampler::new(path, &spec.policy_names,
                                           spec.num_required_policy)?)
            }
            _ => None,
        };
        let manager_io = if is_root && env.policy.is_some() && num_send_up > 0 {
            let key = env.shm_key("endpoint-sample", None);
            Some(ManagerIo::new(&key, &spec.sample_names)?)
        }
        else {
            None
        };

        let time_handle = platform_io.push_signal("TIME", Domain::Board, 0)?;
        let energy_handle = platform_io.push_signal("ENERGY_PACKAGE", Domain::Board, 0)?;
        let power_handle = platform_io.push_signal("POWER_PACKAGE", Domain::Board, 0)?;
        let freq_handle = platform_io.push_signal("FREQUENCY", Domain::Board, 0)?;
        let energy_tracker = platform_io.push_region_signal_total(energy_handle)?;

        Ok(Controller {
            comm,
            platform_io,
            application_io,
            reporter: Reporter::new(env.report.as_deref()),
            tracer: Tracer::new(env.trace.as_deref())?,
            manager_sampler,
            manager_io,
            agents,
            agent_name: env.agent.clone(),
            num_level_ctl,
            is_root,
            policy_seen: false,
            in_policy: vec![f64::NAN; num_send_down],
            out_policy,
            in_sample,
            out_sample: vec![f64::NAN; num_send_up],
            time_handle,
            energy_handle,
            power_handle,
            freq_handle,
            energy_tracker,
            start_energy: f64::NAN,
            region_freq: RegionFrequency::default(),
            tick_count: 0,
            logger: None,
        })
    }

    /// Routes loop events into `logger`.
    pub fn set_logger(&mut self, logger: Logger<ControllerEvent>) {
        self.logger = Some(logger);
    }

    /// Ticks completed so far.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Runs the loop until the application shuts down, then generates the
    /// report and flushes the trace. On a fatal error the partial report
    /// is still written and every owned shared-memory key is unlinked.
    pub fn run(&mut self) -> Result<()> {
        let result = self.run_inner();
        if result.is_err() {
            let _ = self.generate();
            self.application_io.abort();
        }
        let _ = signal_handler::revert();
        result
    }

    fn run_inner(&mut self) -> Result<()> {
        signal_handler::init()?;
        self.application_io.connect()?;
        self.setup_trace()?;
        while !self.application_io.do_shutdown() {
            self.step()?;
        }
        if let Some(logger) = &self.logger {
            logger.log(ControllerEvent::Shutdown);
        }
        self.generate()
    }

    /// One tick, in the fixed order: walk down, check signals, drain the
    /// application, walk up, check signals, wait.
    pub fn step(&mut self) -> Result<()> {
        self.walk_down()?;
        signal_handler::check()?;
        self.update_application()?;
        self.walk_up()?;
        signal_handler::check()?;
        self.agents[0].wait();
        self.tick_count += 1;
        if let Some(logger) = &self.logger {
            logger.log(ControllerEvent::Tick { count: self.tick_count });
        }
        Ok(())
    }

    fn walk_down(&mut self) -> Result<()> {
        if self.is_root {
            if let Some(sampler) = &mut self.manager_sampler {
                // A malformed policy fails this walk only; the previous
                // policy stays in force.
                match sampler.read_batch() {
                    Ok(_) => self.in_policy.copy_from_slice(sampler.sample()),
                    Err(Error::FileParse(_)) | Err(Error::InvalidArgument(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        else if self.comm.receive_down(self.num_level_ctl, &mut self.in_policy)? {
            self.policy_seen = true;
        }
        // Until a first policy arrives there is nothing to relay; sending
        // the unset vector would only park the children's windows.
        if self.is_root || self.policy_seen {
            for level in (0..self.num_level_ctl).rev() {
                let do_send = self.agents[level].descend(&self.in_policy,
                                                         &mut self.out_policy[level])?;
                if do_send {
                    self.comm.send_down(level, &self.out_policy[level])?;
                }
                self.comm.receive_down(level, &mut self.in_policy)?;
            }
        }
        self.agents[0].adjust_platform(&mut self.platform_io, &self.in_policy)?;
        self.platform_io.write_batch()
    }

    fn update_application(&mut self) -> Result<()> {
        self.application_io.update()?;
        for event in self.application_io.region_entry_exit().to_vec() {
            if event.is_entry {
                self.platform_io.region_enter(event.region_id);
            }
            else {
                self.platform_io.region_exit(event.region_id);
            }
        }
        self.platform_io.update_profile(self.application_io.last_epoch_runtime(),
                                        self.application_io.epoch_count(),
                                        self.application_io.current_region());
        self.application_io.clear_region_entry_exit();
        Ok(())
    }

    fn walk_up(&mut self) -> Result<()> {
        self.platform_io.read_batch()?;
        if self.start_energy.is_nan() {
            self.start_energy = self.platform_io.sample(self.energy_handle)?;
        }
        self.update_trace()?;
        let mut out_sample = std::mem::take(&mut self.out_sample);
        self.agents[0].sample_platform(&mut self.platform_io, &mut out_sample)?;
        let mut reached_top = true;
        for level in 0..self.num_level_ctl {
            self.comm.send_up(level, &out_sample)?;
            if !self.comm.receive_up(level, &mut self.in_sample[level])? {
                // A child is not ready; the aggregate cannot climb any
                // further this tick.
                reached_top = false;
                break;
            }
            self.agents[level].ascend(&self.in_sample[level], &mut out_sample)?;
        }
        if reached_top {
            if !self.is_root {
                self.comm.send_up(self.num_level_ctl, &out_sample)?;
            }
            else if let Some(manager_io) = &mut self.manager_io {
                manager_io.adjust_all(&out_sample)?;
                manager_io.write_batch()?;
            }
        }
        self.out_sample = out_sample;
        Ok(())
    }

    fn setup_trace(&mut self) -> Result<()> {
        let agent_columns = self.agents[0].trace_columns();
        self.tracer.columns(&agent_columns)
    }

    fn update_trace(&mut self) -> Result<()> {
        let region_id = self.application_io.current_region();
        let freq = self.platform_io.sample(self.freq_handle)?;
        self.region_freq.record(region_id, freq);

        let mut row = vec![
            self.platform_io.sample(self.time_handle)?,
            field_to_signal(region_id),
            self.platform_io.sample(self.energy_handle)?,
            self.platform_io.sample(self.power_handle)?,
            freq,
        ];
        row.extend(self.agents[0].trace_values(&mut self.platform_io)?);
        self.tracer.update(&row)
    }

    /// Produces the report and flushes the trace.
    pub fn generate(&mut self) -> Result<()> {
        let names = self.application_io.region_name_set();
        let mut regions = Vec::with_capacity(names.len());
        for (region_id, name) in &names {
            regions.push(RegionReport {
                name: name.clone(),
                region_id: *region_id,
                runtime: self.application_io.total_region_runtime(*region_id),
                energy: self.platform_io.sample_region_total(self.energy_tracker, *region_id)?,
                frequency_pct: self.region_freq.percent(*region_id),
                mpi_runtime: self.application_io.total_region_mpi_runtime(*region_id),
                count: self.application_io.total_count(*region_id),
            });
        }
        let end_energy = self
            .platform_io
            .sample(self.energy_handle)
            .unwrap_or(f64::NAN);
        let totals = AppTotals {
            runtime: self.application_io.total_app_runtime(),
            energy: end_energy - self.start_energy,
            mpi_runtime: regions.iter().map(|r| r.mpi_runtime).sum(),
            epoch_runtime: self.application_io.total_epoch_runtime(),
            network_bytes: self.comm.overhead_send(),
        };
        let header = self.agents.last().map(|a| a.report_header()).unwrap_or_default();
        let node: Vec<(String, String)> = self
            .agents
            .iter()
            .flat_map(|agent| agent.report_node())
            .collect();
        self.reporter.generate(&self.application_io.profile_name(),
                               &self.agent_name,
                               &header,
                               &node,
                               &regions,
                               totals)?;
        self.tracer.flush()
    }
}
