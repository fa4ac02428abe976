//! The power-balancing state machine for one node.
//!
//! The node holds a power cap (its share of the job-wide average) and a
//! power limit at or below the cap. During the measure phase the balancer
//! collects epoch runtimes until they are stable; during the shrink phase
//! it walks the limit down by a trial delta until the node is as slow as
//! the slowest node in the job, then reports the saved power (the slack)
//! for redistribution.

use std::time::Instant;

use crate::helper::CircularBuffer;

/// Default trial step when lowering the limit, in watts.
const DEFAULT_TRIAL_DELTA: f64 = 8.0;
/// Smallest the trial step may shrink to, in watts.
const MIN_TRIAL_DELTA: f64 = 0.25;
/// Default epoch samples required before a runtime is trusted.
const DEFAULT_NUM_SAMPLE: usize = 9;
/// Default seconds a limit must hold before its runtimes are trusted.
const DEFAULT_MIN_DURATION: f64 = 0.25;
/// Ceiling on the coefficient of variation of a stable runtime history.
const RUNTIME_FRACTION: f64 = 0.1;

/// Cap, limit, and runtime-history state for one node.
pub struct PowerBalancer {
    ctl_latency: f64,
    min_num_sample: usize,
    min_duration: f64,
    runtime_fraction: f64,
    power_cap: f64,
    power_limit: f64,
    limit_change_time: Instant,
    target_runtime: f64,
    trial_delta: f64,
    runtime_sample: f64,
    prev_runtime_sample: f64,
    is_target_met: bool,
    runtime_buffer: CircularBuffer<f64>,
}

impl PowerBalancer {
    /// A balancer with the default tuning; `ctl_latency` is the seconds
    /// the platform needs to realize a new limit.
    pub fn new(ctl_latency: f64) -> PowerBalancer {
        PowerBalancer::with_params(ctl_latency, DEFAULT_TRIAL_DELTA,
                                   DEFAULT_NUM_SAMPLE, DEFAULT_MIN_DURATION)
    }

    /// A balancer with explicit tuning, for tests and experiments.
    pub fn with_params(ctl_latency: f64,
                       trial_delta: f64,
                       min_num_sample: usize,
                       min_duration: f64) -> PowerBalancer {
        PowerBalancer {
            ctl_latency,
            min_num_sample: min_num_sample.max(1),
            min_duration,
            runtime_fraction: RUNTIME_FRACTION,
            power_cap: f64::NAN,
            power_limit: f64::NAN,
            limit_change_time: Instant::now(),
            target_runtime: f64::NAN,
            trial_delta,
            runtime_sample: f64::NAN,
            prev_runtime_sample: f64::NAN,
            is_target_met: false,
            runtime_buffer: CircularBuffer::new(min_num_sample.max(1)),
        }
    }

    /// Installs a new cap, resetting the limit to it and discarding all
    /// measurement state.
    pub fn set_power_cap(&mut self, cap: f64) {
        self.power_cap = cap;
        self.power_limit = cap;
        self.target_runtime = f64::NAN;
        self.runtime_sample = f64::NAN;
        self.prev_runtime_sample = f64::NAN;
        self.is_target_met = false;
        self.runtime_buffer.clear();
        self.limit_change_time = Instant::now();
    }

    /// The cap this node must not exceed on average.
    pub fn power_cap(&self) -> f64 {
        self.power_cap
    }

    /// The limit currently prescribed for this node.
    pub fn power_limit(&self) -> f64 {
        self.power_limit
    }

    /// Notes that the governor wrote `limit` to the platform; runtimes
    /// measured before this instant no longer describe the present limit.
    pub fn power_limit_adjusted(&mut self, _limit: f64) {
        self.limit_change_time = Instant::now();
        self.runtime_buffer.clear();
    }

    /// Feeds one epoch runtime and reports whether the history is stable
    /// enough for `runtime_sample` to be trusted.
    pub fn is_runtime_stable(&mut self, measured_runtime: f64) -> bool {
        if !measured_runtime.is_nan() {
            self.runtime_buffer.insert(measured_runtime);
        }
        if self.runtime_buffer.len() < self.min_num_sample {
            return false;
        }
        if !self.is_limit_settled() {
            return false;
        }
        let cv = self.runtime_buffer.coefficient_of_variation();
        !cv.is_nan() && cv < self.runtime_fraction
    }

    /// The expected epoch runtime under the current limit; NaN until
    /// `calculate_runtime_sample` ran on a stable history.
    pub fn runtime_sample(&self) -> f64 {
        self.runtime_sample
    }

    /// Snapshots the stable history into `runtime_sample` (its median).
    pub fn calculate_runtime_sample(&mut self) {
        self.runtime_sample = self.runtime_buffer.median();
    }

    /// Installs the job-wide slowest runtime as this node's target.
    pub fn set_target_runtime(&mut self, largest_runtime: f64) {
        self.target_runtime = largest_runtime;
        self.is_target_met = false;
    }

    /// Feeds one epoch runtime during the shrink phase.
    ///
    /// When the history stabilizes, either the node has slowed to the
    /// target (true: freeze the limit and report slack) or the limit drops
    /// another trial delta. A shrink that produced no runtime increase
    /// halves the delta first.
    pub fn is_target_met(&mut self, measured_runtime: f64) -> bool {
        if self.target_runtime.is_nan() || self.is_target_met {
            return self.is_target_met;
        }
        if self.is_runtime_stable(measured_runtime) {
            self.calculate_runtime_sample();
            if self.runtime_sample >= self.target_runtime {
                self.is_target_met = true;
            }
            else {
                if !self.prev_runtime_sample.is_nan()
                    && self.runtime_sample <= self.prev_runtime_sample {
                    self.trial_delta = (self.trial_delta / 2.0).max(MIN_TRIAL_DELTA);
                }
                self.prev_runtime_sample = self.runtime_sample;
                self.power_limit = (self.power_limit - self.trial_delta).max(0.0);
                self.runtime_sample = f64::NAN;
                self.runtime_buffer.clear();
                self.limit_change_time = Instant::now();
            }
        }
        self.is_target_met
    }

    /// The watts saved under the cap. A zero-slack query halves the trial
    /// delta: the balancer was already at target without lowering.
    pub fn power_slack(&mut self) -> f64 {
        let slack = self.power_cap - self.power_limit;
        if slack == 0.0 {
            self.trial_delta = (self.trial_delta / 2.0).max(MIN_TRIAL_DELTA);
        }
        slack
    }

    fn is_limit_settled(&self) -> bool {
        let hold = self.min_duration.max(self.ctl_latency);
        self.limit_change_time.elapsed().as_secs_f64() >= hold
    }
}
