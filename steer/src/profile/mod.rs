//! Application I/O: region markers, progress, and runtime accounting.
//!
//! The controller rendezvouses with the profiled application over shared
//! memory, drains its region entry/exit events once per tick, and keeps
//! per-region totals for the report. The [`ApplicationInlet`] trait is the
//! seam the controller consumes; [`ApplicationIo`] is the shared-memory
//! implementation.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use steer_logging::{Logger, ProfileEvent};

use crate::env::Environment;
use crate::error::Result;
use crate::region::{is_epoch, is_mpi, REGION_ID_INVALID, REGION_ID_MPI};

pub mod control_message;
pub mod table;
pub mod sampler;

pub use control_message::{status, ControlMessage, MAX_NUM_CPU};
pub use sampler::{ProfileSampler, TABLE_SIZE};
pub use table::{ProfileMessage, ProfileTable, ProfileTableReader};

/// One region boundary observed by the controller.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EntryExit {
    /// Region id, flags included.
    pub region_id: u64,
    /// Application-clock timestamp.
    pub timestamp: f64,
    /// True at entry, false at exit.
    pub is_entry: bool,
}

/// What the controller needs from the application side.
pub trait ApplicationInlet {
    /// Performs the startup rendezvous.
    fn connect(&mut self) -> Result<()>;
    /// Drains events accumulated since the previous tick.
    fn update(&mut self) -> Result<()>;
    /// Whether the application has requested shutdown.
    fn do_shutdown(&self) -> bool;
    /// Region names learned from the application, keyed by id.
    fn region_name_set(&self) -> BTreeMap<u64, String>;
    /// Mean runtime per rank accumulated in a region.
    fn total_region_runtime(&self, region_id: u64) -> f64;
    /// Mean MPI time per rank accumulated in a region.
    fn total_region_mpi_runtime(&self, region_id: u64) -> f64;
    /// Completed entry/exit cycles of a region.
    fn total_count(&self, region_id: u64) -> u64;
    /// Wall time since `connect` returned (frozen at shutdown).
    fn total_app_runtime(&self) -> f64;
    /// Application time since the first epoch entry.
    fn total_epoch_runtime(&self) -> f64;
    /// Duration of the most recently completed epoch; NaN before the
    /// second epoch entry.
    fn last_epoch_runtime(&self) -> f64;
    /// Number of epoch entries observed.
    fn epoch_count(&self) -> u64;
    /// The region most recently entered, or the invalid region.
    fn current_region(&self) -> u64;
    /// The boundaries observed since the last clear, in time order.
    fn region_entry_exit(&self) -> &[EntryExit];
    /// Forgets the boundary list once the tracer has consumed it.
    fn clear_region_entry_exit(&mut self);
    /// The report path requested by the application, if any.
    fn report_name(&self) -> String;
    /// The application's profile name.
    fn profile_name(&self) -> String;
    /// Releases every shared resource ahead of drop (fatal-exit path).
    fn abort(&mut self);
}

#[derive(Default)]
struct RegionStats {
    runtime_sum: f64,
    mpi_runtime_sum: f64,
    count: u64,
    first_entry: Option<f64>,
}

/// Shared-memory application I/O with per-region accounting.
pub struct ApplicationIo {
    sampler: ProfileSampler,
    rank_per_node: usize,
    messages: Vec<ProfileMessage>,
    entry_stack: HashMap<(i32, u64), Vec<f64>>,
    stats: HashMap<u64, RegionStats>,
    entry_exit: Vec<EntryExit>,
    current_region: u64,
    epoch_first: Option<f64>,
    epoch_last_entry: HashMap<i32, f64>,
    epoch_runtime: HashMap<i32, f64>,
    epoch_count: u64,
    latest_timestamp: f64,
    connect_time: Option<Instant>,
    shutdown_runtime: Option<f64>,
    logger: Option<Logger<ProfileEvent>>,
}

impl ApplicationIo {
    /// Creates the protocol regions; the application attaches by key.
    pub fn new(env: &Environment, num_cpu: usize) -> Result<ApplicationIo> {
        Ok(ApplicationIo {
            sampler: ProfileSampler::new(env, num_cpu)?,
            rank_per_node: 0,
            messages: Vec::new(),
            entry_stack: HashMap::new(),
            stats: HashMap::new(),
            entry_exit: Vec::new(),
            current_region: REGION_ID_INVALID,
            epoch_first: None,
            epoch_last_entry: HashMap::new(),
            epoch_runtime: HashMap::new(),
            epoch_count: 0,
            latest_timestamp: 0.0,
            connect_time: None,
            shutdown_runtime: None,
            logger: None,
        })
    }

    /// Routes accounting anomalies into `logger`.
    pub fn set_logger(&mut self, logger: Logger<ProfileEvent>) {
        self.logger = Some(logger);
    }

    fn apply(&mut self, message: ProfileMessage) {
        self.latest_timestamp = self.latest_timestamp.max(message.timestamp);
        if is_epoch(message.region_id) {
            if message.progress == 0.0 {
                self.epoch_count += 1;
                self.epoch_first.get_or_insert(message.timestamp);
                if let Some(last) = self.epoch_last_entry.insert(message.rank, message.timestamp) {
                    self.epoch_runtime.insert(message.rank, message.timestamp - last);
                }
            }
            return;
        }
        if message.progress == 0.0 {
            self.entry_stack
                .entry((message.rank, message.region_id))
                .or_default()
                .push(message.timestamp);
            self.entry_exit.push(EntryExit {
                region_id: message.region_id,
                timestamp: message.timestamp,
                is_entry: true,
            });
            self.current_region = message.region_id;
            self.stats
                .entry(message.region_id)
                .or_default()
                .first_entry
                .get_or_insert(message.timestamp);
        }
        else if message.progress == 1.0 {
            // Exits pair with entries LIFO per rank; an orphan is dropped.
            let Some(entry_time) = self
                .entry_stack
                .get_mut(&(message.rank, message.region_id))
                .and_then(Vec::pop)
            else {
                if let Some(logger) = &self.logger {
                    logger.log(ProfileEvent::UnmatchedExit {
                        region_id: message.region_id,
                        rank: message.rank,
                    });
                }
                return;
            };
            let elapsed = (message.timestamp - entry_time).max(0.0);
            let stats = self.stats.entry(message.region_id).or_default();
            stats.runtime_sum += elapsed;
            stats.count += 1;
            if is_mpi(message.region_id) {
                stats.mpi_runtime_sum += elapsed;
            }
            self.entry_exit.push(EntryExit {
                region_id: message.region_id,
                timestamp: message.timestamp,
                is_entry: false,
            });
            if self.current_region == message.region_id {
                self.current_region = REGION_ID_INVALID;
            }
        }
    }

    fn per_rank(&self, total: f64) -> f64 {
        if self.rank_per_node == 0 {
            0.0
        }
        else {
            total / self.rank_per_node as f64
        }
    }
}

impl ApplicationInlet for ApplicationIo {
    fn connect(&mut self) -> Result<()> {
        self.rank_per_node = self.sampler.initialize()?;
        self.connect_time = Some(Instant::now());
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        self.messages.clear();
        self.sampler.sample(&mut self.messages)?;
        if let Some(logger) = &self.logger {
            logger.log(ProfileEvent::Drained { count: self.messages.len() });
        }
        let messages = std::mem::take(&mut self.messages);
        for message in &messages {
            self.apply(*message);
        }
        self.messages = messages;
        if self.do_shutdown() && self.shutdown_runtime.is_none() {
            self.shutdown_runtime = self
                .connect_time
                .map(|begin| begin.elapsed().as_secs_f64());
        }
        Ok(())
    }

    fn do_shutdown(&self) -> bool {
        self.sampler.do_shutdown()
    }

    fn region_name_set(&self) -> BTreeMap<u64, String> {
        self.sampler.region_names().clone()
    }

    fn total_region_runtime(&self, region_id: u64) -> f64 {
        self.per_rank(self.stats.get(&region_id).map_or(0.0, |s| s.runtime_sum))
    }

    fn total_region_mpi_runtime(&self, region_id: u64) -> f64 {
        let direct = self.stats.get(&region_id).map_or(0.0, |s| s.mpi_runtime_sum);
        if direct > 0.0 {
            return self.per_rank(direct);
        }
        // Time in the MPI-flagged twin of this region.
        let flagged = region_id | REGION_ID_MPI;
        self.per_rank(self.stats.get(&flagged).map_or(0.0, |s| s.mpi_runtime_sum))
    }

    fn total_count(&self, region_id: u64) -> u64 {
        self.stats.get(&region_id).map_or(0, |s| s.count) / self.rank_per_node.max(1) as u64
    }

    fn total_app_runtime(&self) -> f64 {
        match (self.shutdown_runtime, self.connect_time) {
            (Some(frozen), _) => frozen,
            (None, Some(begin)) => begin.elapsed().as_secs_f64(),
            (None, None) => 0.0,
        }
    }

    fn total_epoch_runtime(&self) -> f64 {
        match self.epoch_first {
            Some(first) => self.latest_timestamp - first,
            None => 0.0,
        }
    }

    fn last_epoch_runtime(&self) -> f64 {
        if self.epoch_runtime.is_empty() {
            return f64::NAN;
        }
        self.epoch_runtime.values().sum::<f64>() / self.epoch_runtime.len() as f64
    }

    fn epoch_count(&self) -> u64 {
        self.epoch_count / self.rank_per_node.max(1) as u64
    }

    fn current_region(&self) -> u64 {
        self.current_region
    }

    fn region_entry_exit(&self) -> &[EntryExit] {
        &self.entry_exit
    }

    fn clear_region_entry_exit(&mut self) {
        self.entry_exit.clear();
    }

    fn report_name(&self) -> String {
        self.sampler.report_name().to_owned()
    }

    fn profile_name(&self) -> String {
        self.sampler.profile_name().to_owned()
    }

    fn abort(&mut self) {
        self.sampler.unlink();
    }
}
