//! Platform telemetry and control.
//!
//! Everything the runtime knows about the hardware flows through
//! [`PlatformIo`]: callers push named signals and controls against a
//! domain, then exchange values in batches once per controller tick.
//! Signals produce `f64` samples; NaN is the only representation of
//! "value unavailable". Controls accept `f64` settings.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Result;

pub mod msrio;
pub mod msr;
pub mod derived;
mod pio;

pub use msrio::{DevMsr, MemoryMsr, MsrIo, SharedMsrIo};
pub use pio::{PlatformIo, SIGNAL_EPOCH_COUNT, SIGNAL_EPOCH_RUNTIME, SIGNAL_REGION_ID};

/// The granularity a signal or control is requested at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Domain {
    /// The whole compute node.
    Board,
    /// One processor package.
    Package,
    /// One physical core.
    Core,
    /// One logical CPU.
    Cpu,
}

/// Counts of each domain on the node.
#[derive(Clone, Copy, Debug)]
pub struct PlatformTopo {
    num_package: usize,
    num_core: usize,
    num_cpu: usize,
}

impl PlatformTopo {
    /// Describes a node with the given domain counts.
    ///
    /// Cores must divide evenly into packages and CPUs into cores.
    pub fn new(num_package: usize, num_core: usize, num_cpu: usize) -> PlatformTopo {
        assert!(num_package > 0 && num_core % num_package == 0 && num_cpu % num_core == 0);
        PlatformTopo { num_package, num_core, num_cpu }
    }

    /// Detects the local node, falling back to a single package.
    pub fn detect() -> PlatformTopo {
        let num_cpu = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        PlatformTopo { num_package: 1, num_core: num_cpu, num_cpu }
    }

    /// Number of instances of a domain.
    pub fn num_domain(&self, domain: Domain) -> usize {
        match domain {
            Domain::Board => 1,
            Domain::Package => self.num_package,
            Domain::Core => self.num_core,
            Domain::Cpu => self.num_cpu,
        }
    }

    /// The CPU indices belonging to one instance of a domain.
    pub fn domain_cpus(&self, domain: Domain, domain_idx: usize) -> Vec<usize> {
        let per = self.num_cpu / self.num_domain(domain);
        (domain_idx * per..(domain_idx + 1) * per).collect()
    }

    /// The package indices belonging to one instance of a coarser domain.
    pub fn domain_packages(&self, domain: Domain, domain_idx: usize) -> Vec<usize> {
        match domain {
            Domain::Board => (0..self.num_package).collect(),
            Domain::Package => vec![domain_idx],
            // A package signal cannot be requested at finer grain.
            _ => Vec::new(),
        }
    }
}

/// A source of `f64` samples.
pub trait Signal {
    /// Declares that the signal will be serviced by batch reads.
    fn setup_batch(&mut self) -> Result<()>;
    /// The value as of the most recent batch read.
    fn sample(&mut self) -> Result<f64>;
    /// A one-shot value bypassing the batch, for setup and teardown.
    fn read(&mut self) -> Result<f64>;
}

/// A shared handle to a signal in a composition graph.
pub type SharedSignal = Rc<RefCell<dyn Signal>>;

/// A sink for `f64` settings.
pub trait Control {
    /// Writes a setting to the hardware.
    fn write(&mut self, setting: f64) -> Result<()>;
}
