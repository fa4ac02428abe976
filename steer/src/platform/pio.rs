//! The batched signal/control surface over the platform.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::platform::derived::{
    CombinedSignal, DerivativeSignal, DivisionSignal, ScalabilitySignal, TimeSignal,
};
use crate::platform::msr::{field_to_signal, MsrFieldControl, MsrFieldSignal, MsrFunction,
                           RawMsrSignal};
use crate::platform::msrio::{MsrBatch, SharedBatch, SharedMsrIo};
use crate::platform::{Control, Domain, PlatformTopo, Signal, SharedSignal};

const MSR_MPERF: u64 = 0xE7;
const MSR_APERF: u64 = 0xE8;
const MSR_PERF_STATUS: u64 = 0x198;
const MSR_PERF_CTL: u64 = 0x199;
const MSR_PKG_POWER_LIMIT: u64 = 0x610;
const MSR_PKG_ENERGY_STATUS: u64 = 0x611;

/// Joules per energy-status count.
const ENERGY_UNIT: f64 = 1.0 / 65536.0;
/// Hertz per frequency-ratio count.
const FREQ_UNIT: f64 = 1.0e8;
/// Watts per power-limit count.
const POWER_UNIT: f64 = 0.125;

const POWER_WINDOW: usize = 8;
const POWER_SLEEP: f64 = 0.001;

/// Names of signals whose values are fed from the application profile
/// rather than the hardware.
pub const SIGNAL_EPOCH_RUNTIME: &str = "EPOCH_RUNTIME";
/// See [`SIGNAL_EPOCH_RUNTIME`].
pub const SIGNAL_EPOCH_COUNT: &str = "EPOCH_COUNT";
/// See [`SIGNAL_EPOCH_RUNTIME`].
pub const SIGNAL_REGION_ID: &str = "REGION_ID#";

#[derive(Default)]
struct ProfileValues {
    epoch_runtime: f64,
    epoch_count: f64,
    region_id: u64,
}

#[derive(Clone, Copy)]
enum ProfileField {
    EpochRuntime,
    EpochCount,
    RegionId,
}

/// A signal whose value the controller injects each tick from the
/// application profile stream.
struct ProfileSignal {
    values: Rc<RefCell<ProfileValues>>,
    field: ProfileField,
}

impl Signal for ProfileSignal {
    fn setup_batch(&mut self) -> Result<()> {
        Ok(())
    }

    fn sample(&mut self) -> Result<f64> {
        let values = self.values.borrow();
        Ok(match self.field {
            ProfileField::EpochRuntime => values.epoch_runtime,
            ProfileField::EpochCount => values.epoch_count,
            ProfileField::RegionId => field_to_signal(values.region_id),
        })
    }

    fn read(&mut self) -> Result<f64> {
        self.sample()
    }
}

struct ActiveSignal {
    signal: SharedSignal,
}

struct ActiveControl {
    control: Box<dyn Control>,
    staged: Option<f64>,
    name: String,
}

struct RegionTracker {
    signal_handle: usize,
    entry: HashMap<u64, f64>,
    total: HashMap<u64, f64>,
}

/// Batched telemetry and control for one node.
///
/// Push phase first: register every signal and control of interest. After
/// the first `read_batch` no further signals may be pushed, and after the
/// first `adjust` no further controls. Each tick then performs one
/// `read_batch`, any number of `sample` calls, `adjust` staging, and one
/// `write_batch`.
pub struct PlatformIo {
    topo: PlatformTopo,
    batch: SharedBatch,
    time: SharedSignal,
    signals: Vec<ActiveSignal>,
    signal_index: HashMap<(String, Domain, usize), usize>,
    controls: Vec<ActiveControl>,
    control_index: HashMap<(String, Domain, usize), usize>,
    trackers: Vec<RegionTracker>,
    profile: Rc<RefCell<ProfileValues>>,
    is_read_active: bool,
    is_adjust_active: bool,
}

impl PlatformIo {
    /// Creates the surface over `device` for the given topology.
    pub fn new(topo: PlatformTopo, device: SharedMsrIo) -> PlatformIo {
        PlatformIo {
            topo,
            batch: MsrBatch::new(device),
            time: TimeSignal::new(),
            signals: Vec::new(),
            signal_index: HashMap::new(),
            controls: Vec::new(),
            control_index: HashMap::new(),
            trackers: Vec::new(),
            profile: Rc::new(RefCell::new(ProfileValues::default())),
            is_read_active: false,
            is_adjust_active: false,
        }
    }

    /// The node topology this surface was built over.
    pub fn topo(&self) -> &PlatformTopo {
        &self.topo
    }

    /// Every signal name `push_signal` accepts.
    pub fn signal_names(&self) -> Vec<&'static str> {
        vec!["TIME",
             "FREQUENCY", "PERF_STATUS:FREQ",
             "ENERGY_PACKAGE", "PKG_ENERGY_STATUS:ENERGY",
             "POWER_PACKAGE",
             "POWER_PACKAGE_LIMIT",
             "CYCLES_THREAD", "CYCLES_REFERENCE",
             "SCALABILITY_RATIO", "SCALABILITY_TIME",
             SIGNAL_EPOCH_RUNTIME, SIGNAL_EPOCH_COUNT, SIGNAL_REGION_ID]
    }

    /// Every control name `push_control` accepts.
    pub fn control_names(&self) -> Vec<&'static str> {
        vec!["POWER_PACKAGE_LIMIT", "PKG_POWER_LIMIT:PL1_POWER",
             "FREQUENCY", "PERF_CTL:FREQ"]
    }

    /// Registers a signal, returning its handle. Repeated pushes of the
    /// same request return the same handle.
    pub fn push_signal(&mut self, name: &str, domain: Domain, domain_idx: usize) -> Result<usize> {
        if self.is_read_active {
            return Err(Error::Runtime(
                format!("cannot push signal {} after read_batch()", name)));
        }
        self.check_domain(name, domain, domain_idx)?;
        let key = (name.to_owned(), domain, domain_idx);
        if let Some(handle) = self.signal_index.get(&key) {
            return Ok(*handle);
        }
        let signal = self.instantiate_signal(name, domain, domain_idx)?;
        signal.borrow_mut().setup_batch()?;
        let handle = self.signals.len();
        self.signals.push(ActiveSignal { signal });
        self.signal_index.insert(key, handle);
        Ok(handle)
    }

    /// Registers a control, returning its handle.
    pub fn push_control(&mut self, name: &str, domain: Domain, domain_idx: usize) -> Result<usize> {
        if self.is_adjust_active {
            return Err(Error::Runtime(
                format!("cannot push control {} after adjust()", name)));
        }
        self.check_domain(name, domain, domain_idx)?;
        let key = (name.to_owned(), domain, domain_idx);
        if let Some(handle) = self.control_index.get(&key) {
            return Ok(*handle);
        }
        let control = self.instantiate_control(name, domain, domain_idx)?;
        let handle = self.controls.len();
        self.controls.push(ActiveControl { control, staged: None, name: name.to_owned() });
        self.control_index.insert(key, handle);
        Ok(handle)
    }

    /// Issues one hardware batch transaction; afterwards every pushed
    /// signal has a fresh sample.
    pub fn read_batch(&mut self) -> Result<()> {
        self.batch.borrow_mut().read_batch()?;
        self.is_read_active = true;
        Ok(())
    }

    /// The value of a pushed signal as of the most recent `read_batch`.
    pub fn sample(&mut self, handle: usize) -> Result<f64> {
        if !self.is_read_active {
            return Err(Error::Runtime("sample() called before read_batch()".into()));
        }
        let active = self.signals.get(handle).ok_or_else(|| {
            Error::InvalidArgument(format!("signal handle {} out of range", handle))
        })?;
        active.signal.borrow_mut().sample()
    }

    /// Stages a setting for a pushed control; nothing reaches hardware
    /// until `write_batch`.
    pub fn adjust(&mut self, handle: usize, setting: f64) -> Result<()> {
        let active = self.controls.get_mut(handle).ok_or_else(|| {
            Error::InvalidArgument(format!("control handle {} out of range", handle))
        })?;
        active.staged = Some(setting);
        self.is_adjust_active = true;
        Ok(())
    }

    /// Commits every staged setting in one hardware transaction.
    ///
    /// Every pushed control must have been adjusted at least once since
    /// creation; staged settings persist across batches.
    pub fn write_batch(&mut self) -> Result<()> {
        if let Some(missing) = self.controls.iter().find(|ctl| ctl.staged.is_none()) {
            return Err(Error::Runtime(
                format!("control {} was never adjusted before write_batch()", missing.name)));
        }
        for active in &mut self.controls {
            let setting = active.staged.expect("staged checked above");
            active.control.write(setting)?;
        }
        Ok(())
    }

    /// One-shot read bypassing the batch, for setup and teardown.
    pub fn read_signal(&mut self, name: &str, domain: Domain, domain_idx: usize) -> Result<f64> {
        self.check_domain(name, domain, domain_idx)?;
        let signal = self.instantiate_signal(name, domain, domain_idx)?;
        let value = signal.borrow_mut().read();
        value
    }

    /// One-shot write bypassing the batch.
    pub fn write_control(&mut self,
                         name: &str,
                         domain: Domain,
                         domain_idx: usize,
                         setting: f64) -> Result<()> {
        self.check_domain(name, domain, domain_idx)?;
        let mut control = self.instantiate_control(name, domain, domain_idx)?;
        control.write(setting)
    }

    /// Binds a pushed signal to per-region accounting: the change in the
    /// signal between region entry and exit is attributed to the region.
    pub fn push_region_signal_total(&mut self, signal_handle: usize) -> Result<usize> {
        if signal_handle >= self.signals.len() {
            return Err(Error::InvalidArgument(
                format!("signal handle {} out of range", signal_handle)));
        }
        let handle = self.trackers.len();
        self.trackers.push(RegionTracker {
            signal_handle,
            entry: HashMap::new(),
            total: HashMap::new(),
        });
        Ok(handle)
    }

    /// Latches every bound counter at entry into `region_id`.
    pub fn region_enter(&mut self, region_id: u64) {
        for tracker_idx in 0..self.trackers.len() {
            let signal_handle = self.trackers[tracker_idx].signal_handle;
            if let Ok(value) = self.sample(signal_handle) {
                if !value.is_nan() {
                    self.trackers[tracker_idx].entry.insert(region_id, value);
                }
            }
        }
    }

    /// Accumulates every bound counter's delta at exit from `region_id`.
    pub fn region_exit(&mut self, region_id: u64) {
        for tracker_idx in 0..self.trackers.len() {
            let signal_handle = self.trackers[tracker_idx].signal_handle;
            let Some(entry) = self.trackers[tracker_idx].entry.remove(&region_id) else {
                continue;
            };
            if let Ok(value) = self.sample(signal_handle) {
                if !value.is_nan() {
                    *self.trackers[tracker_idx].total.entry(region_id).or_insert(0.0) +=
                        value - entry;
                }
            }
        }
    }

    /// The total accumulated for a region by a bound counter.
    pub fn sample_region_total(&self, total_handle: usize, region_id: u64) -> Result<f64> {
        let tracker = self.trackers.get(total_handle).ok_or_else(|| {
            Error::InvalidArgument(format!("region total handle {} out of range", total_handle))
        })?;
        Ok(tracker.total.get(&region_id).copied().unwrap_or(0.0))
    }

    /// Injects this tick's application profile values, the backing store
    /// of the `EPOCH_*` and `REGION_ID#` signals.
    pub fn update_profile(&mut self, epoch_runtime: f64, epoch_count: u64, region_id: u64) {
        let mut values = self.profile.borrow_mut();
        values.epoch_runtime = epoch_runtime;
        values.epoch_count = epoch_count as f64;
        values.region_id = region_id;
    }

    fn check_domain(&self, name: &str, domain: Domain, domain_idx: usize) -> Result<()> {
        if domain_idx >= self.topo.num_domain(domain) {
            return Err(Error::InvalidArgument(
                format!("domain index {} out of range for {}", domain_idx, name)));
        }
        Ok(())
    }

    fn cpu_field(&self, cpu: usize, offset: u64,
                 begin: u32, end: u32,
                 function: MsrFunction, scalar: f64) -> Result<SharedSignal> {
        let raw = RawMsrSignal::new(Rc::clone(&self.batch), cpu, offset);
        MsrFieldSignal::new(raw, begin, end, function, scalar)
    }

    fn per_cpu(&self, name: &str, domain: Domain, domain_idx: usize,
               combine: fn(&[f64]) -> f64,
               make: &dyn Fn(&PlatformIo, usize) -> Result<SharedSignal>) -> Result<SharedSignal> {
        if domain == Domain::Cpu {
            return make(self, domain_idx);
        }
        let children = self
            .topo
            .domain_cpus(domain, domain_idx)
            .into_iter()
            .map(|cpu| make(self, cpu))
            .collect::<Result<Vec<_>>>()?;
        if children.is_empty() {
            return Err(Error::InvalidArgument(
                format!("no cpus in requested domain for {}", name)));
        }
        Ok(CombinedSignal::new(children, combine))
    }

    fn per_package(&self, name: &str, domain: Domain, domain_idx: usize,
                   combine: fn(&[f64]) -> f64,
                   make: &dyn Fn(&PlatformIo, usize) -> Result<SharedSignal>)
                   -> Result<SharedSignal> {
        let packages = self.topo.domain_packages(domain, domain_idx);
        if packages.is_empty() {
            return Err(Error::InvalidArgument(
                format!("{} cannot be requested finer than package", name)));
        }
        if packages.len() == 1 {
            return make(self, packages[0]);
        }
        let children = packages
            .into_iter()
            .map(|package| make(self, package))
            .collect::<Result<Vec<_>>>()?;
        Ok(CombinedSignal::new(children, combine))
    }

    fn package_energy(&self, package: usize) -> Result<SharedSignal> {
        let cpu = self.topo.domain_cpus(Domain::Package, package)[0];
        self.cpu_field(cpu, MSR_PKG_ENERGY_STATUS, 0, 31, MsrFunction::Overflow, ENERGY_UNIT)
    }

    fn cpu_scalability_ratio(&self, cpu: usize) -> Result<SharedSignal> {
        let aperf = self.cpu_field(cpu, MSR_APERF, 0, 47, MsrFunction::Overflow, 1.0)?;
        let mperf = self.cpu_field(cpu, MSR_MPERF, 0, 47, MsrFunction::Overflow, 1.0)?;
        let d_aperf = DerivativeSignal::new(Rc::clone(&self.time), aperf,
                                            POWER_WINDOW, POWER_SLEEP);
        let d_mperf = DerivativeSignal::new(Rc::clone(&self.time), mperf,
                                            POWER_WINDOW, POWER_SLEEP);
        Ok(DivisionSignal::new(d_aperf, d_mperf))
    }

    fn profile_signal(&self, field: ProfileField) -> SharedSignal {
        Rc::new(RefCell::new(ProfileSignal { values: Rc::clone(&self.profile), field }))
    }

    fn instantiate_signal(&self, name: &str, domain: Domain, domain_idx: usize)
                          -> Result<SharedSignal> {
        match name {
            "TIME" => {
                if domain != Domain::Board {
                    return Err(Error::InvalidArgument("TIME is a board signal".into()));
                }
                Ok(Rc::clone(&self.time))
            }
            "FREQUENCY" | "PERF_STATUS:FREQ" => {
                self.per_cpu(name, domain, domain_idx, CombinedSignal::mean, &|pio, cpu| {
                    pio.cpu_field(cpu, MSR_PERF_STATUS, 8, 15, MsrFunction::Scale, FREQ_UNIT)
                })
            }
            "ENERGY_PACKAGE" | "PKG_ENERGY_STATUS:ENERGY" => {
                self.per_package(name, domain, domain_idx, CombinedSignal::sum,
                                 &PlatformIo::package_energy)
            }
            "POWER_PACKAGE" => {
                self.per_package(name, domain, domain_idx, CombinedSignal::sum, &|pio, package| {
                    let energy = pio.package_energy(package)?;
                    Ok(DerivativeSignal::new(Rc::clone(&pio.time), energy,
                                             POWER_WINDOW, POWER_SLEEP))
                })
            }
            "POWER_PACKAGE_LIMIT" => {
                self.per_package(name, domain, domain_idx, CombinedSignal::mean, &|pio, package| {
                    let cpu = pio.topo.domain_cpus(Domain::Package, package)[0];
                    pio.cpu_field(cpu, MSR_PKG_POWER_LIMIT, 0, 14, MsrFunction::Scale, POWER_UNIT)
                })
            }
            "CYCLES_THREAD" => {
                self.per_cpu(name, domain, domain_idx, CombinedSignal::sum, &|pio, cpu| {
                    pio.cpu_field(cpu, MSR_APERF, 0, 47, MsrFunction::Overflow, 1.0)
                })
            }
            "CYCLES_REFERENCE" => {
                self.per_cpu(name, domain, domain_idx, CombinedSignal::sum, &|pio, cpu| {
                    pio.cpu_field(cpu, MSR_MPERF, 0, 47, MsrFunction::Overflow, 1.0)
                })
            }
            "SCALABILITY_RATIO" => {
                self.per_cpu(name, domain, domain_idx, CombinedSignal::mean,
                             &PlatformIo::cpu_scalability_ratio)
            }
            "SCALABILITY_TIME" => {
                self.per_cpu(name, domain, domain_idx, CombinedSignal::sum, &|pio, cpu| {
                    let ratio = pio.cpu_scalability_ratio(cpu)?;
                    Ok(ScalabilitySignal::new(ratio, Rc::clone(&pio.time)))
                })
            }
            SIGNAL_EPOCH_RUNTIME => Ok(self.profile_signal(ProfileField::EpochRuntime)),
            SIGNAL_EPOCH_COUNT => Ok(self.profile_signal(ProfileField::EpochCount)),
            SIGNAL_REGION_ID => Ok(self.profile_signal(ProfileField::RegionId)),
            _ => Err(Error::InvalidArgument(format!("signal name {:?} not found", name))),
        }
    }

    fn instantiate_control(&self, name: &str, domain: Domain, domain_idx: usize)
                           -> Result<Box<dyn Control>> {
        match name {
            "POWER_PACKAGE_LIMIT" | "PKG_POWER_LIMIT:PL1_POWER" => {
                let packages = self.topo.domain_packages(domain, domain_idx);
                if packages.is_empty() {
                    return Err(Error::InvalidArgument(
                        format!("{} cannot be requested finer than package", name)));
                }
                let children = packages
                    .into_iter()
                    .map(|package| {
                        let cpu = self.topo.domain_cpus(Domain::Package, package)[0];
                        MsrFieldControl::new(Rc::clone(&self.batch), cpu,
                                             MSR_PKG_POWER_LIMIT, 0, 14, POWER_UNIT)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Box::new(FanOutControl { children }))
            }
            "FREQUENCY" | "PERF_CTL:FREQ" => {
                let children = self
                    .topo
                    .domain_cpus(domain, domain_idx)
                    .into_iter()
                    .map(|cpu| {
                        MsrFieldControl::new(Rc::clone(&self.batch), cpu,
                                             MSR_PERF_CTL, 8, 15, FREQ_UNIT)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Box::new(FanOutControl { children }))
            }
            _ => Err(Error::InvalidArgument(format!("control name {:?} not found", name))),
        }
    }
}

/// Writes one setting to every member of a domain.
struct FanOutControl {
    children: Vec<Box<dyn Control>>,
}

impl Control for FanOutControl {
    fn write(&mut self, setting: f64) -> Result<()> {
        for child in &mut self.children {
            child.write(setting)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::msrio::MemoryMsr;
    use crate::platform::msr::signal_to_field;

    fn setup(topo: PlatformTopo) -> (Rc<RefCell<MemoryMsr>>, PlatformIo) {
        let device = Rc::new(RefCell::new(MemoryMsr::new()));
        let pio = PlatformIo::new(topo, Rc::clone(&device) as SharedMsrIo);
        (device, pio)
    }

    #[test]
    fn push_sample_roundtrip() {
        let (device, mut pio) = setup(PlatformTopo::new(1, 1, 1));
        let handle = pio.push_signal("PERF_STATUS:FREQ", Domain::Cpu, 0).unwrap();
        device.borrow_mut().poke(0, 0x198, 0xB00);
        pio.read_batch().unwrap();
        assert_eq!(pio.sample(handle).unwrap(), 1.1e9);
    }

    #[test]
    fn sample_before_read_batch_fails() {
        let (_device, mut pio) = setup(PlatformTopo::new(1, 1, 1));
        let handle = pio.push_signal("TIME", Domain::Board, 0).unwrap();
        assert!(matches!(pio.sample(handle), Err(Error::Runtime(_))));
    }

    #[test]
    fn push_after_read_batch_fails() {
        let (_device, mut pio) = setup(PlatformTopo::new(1, 1, 1));
        pio.push_signal("TIME", Domain::Board, 0).unwrap();
        pio.read_batch().unwrap();
        assert!(matches!(pio.push_signal("FREQUENCY", Domain::Cpu, 0),
                         Err(Error::Runtime(_))));
    }

    #[test]
    fn push_unknown_or_bad_domain_fails() {
        let (_device, mut pio) = setup(PlatformTopo::new(1, 1, 1));
        assert!(matches!(pio.push_signal("NO_SUCH_SIGNAL", Domain::Board, 0),
                         Err(Error::InvalidArgument(_))));
        assert!(matches!(pio.push_signal("FREQUENCY", Domain::Cpu, 5),
                         Err(Error::InvalidArgument(_))));
        assert!(matches!(pio.push_signal("ENERGY_PACKAGE", Domain::Cpu, 0),
                         Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn duplicate_push_shares_handle() {
        let (_device, mut pio) = setup(PlatformTopo::new(1, 2, 2));
        let a = pio.push_signal("FREQUENCY", Domain::Cpu, 0).unwrap();
        let b = pio.push_signal("FREQUENCY", Domain::Cpu, 0).unwrap();
        let c = pio.push_signal("FREQUENCY", Domain::Cpu, 1).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn write_batch_requires_every_control_adjusted() {
        let (device, mut pio) = setup(PlatformTopo::new(2, 2, 2));
        let power = pio.push_control("POWER_PACKAGE_LIMIT", Domain::Package, 0).unwrap();
        let freq = pio.push_control("FREQUENCY", Domain::Cpu, 1).unwrap();

        pio.adjust(power, 160.0).unwrap();
        assert!(matches!(pio.write_batch(), Err(Error::Runtime(_))));

        pio.adjust(freq, 2.2e9).unwrap();
        pio.write_batch().unwrap();
        assert_eq!(device.borrow().peek(0, 0x610) & 0x7FFF, 1280);
        assert_eq!((device.borrow().peek(1, 0x199) >> 8) & 0xFF, 22);

        // Settings are sticky; a second batch commits the same values.
        pio.write_batch().unwrap();
    }

    #[test]
    fn push_control_after_adjust_fails() {
        let (_device, mut pio) = setup(PlatformTopo::new(1, 1, 1));
        let handle = pio.push_control("FREQUENCY", Domain::Cpu, 0).unwrap();
        pio.adjust(handle, 1.0e9).unwrap();
        assert!(matches!(pio.push_control("POWER_PACKAGE_LIMIT", Domain::Package, 0),
                         Err(Error::Runtime(_))));
    }

    #[test]
    fn read_signal_matches_batch_sample() {
        let (device, mut pio) = setup(PlatformTopo::new(1, 1, 1));
        let handle = pio.push_signal("FREQUENCY", Domain::Cpu, 0).unwrap();
        device.borrow_mut().poke(0, 0x198, 0x1500);
        let one_shot = pio.read_signal("FREQUENCY", Domain::Cpu, 0).unwrap();
        pio.read_batch().unwrap();
        assert_eq!(one_shot, pio.sample(handle).unwrap());
    }

    #[test]
    fn write_control_reads_back_through_paired_signal() {
        let (_device, mut pio) = setup(PlatformTopo::new(1, 1, 1));
        pio.write_control("POWER_PACKAGE_LIMIT", Domain::Package, 0, 160.0).unwrap();
        let read_back = pio.read_signal("POWER_PACKAGE_LIMIT", Domain::Package, 0).unwrap();
        assert_eq!(read_back, 160.0);

        // A setting off the encoding grid comes back quantized.
        pio.write_control("POWER_PACKAGE_LIMIT", Domain::Package, 0, 160.0625).unwrap();
        let read_back = pio.read_signal("POWER_PACKAGE_LIMIT", Domain::Package, 0).unwrap();
        assert!((read_back - 160.0625).abs() <= POWER_UNIT);
    }

    #[test]
    fn region_total_attributes_energy_delta() {
        let (device, mut pio) = setup(PlatformTopo::new(1, 1, 1));
        let energy = pio.push_signal("ENERGY_PACKAGE", Domain::Board, 0).unwrap();
        let total = pio.push_region_signal_total(energy).unwrap();
        let region = crate::region::region_id("foo");

        device.borrow_mut().poke(0, 0x611, (100.0 / ENERGY_UNIT) as u64);
        pio.read_batch().unwrap();
        pio.region_enter(region);

        device.borrow_mut().poke(0, 0x611, (142.0 / ENERGY_UNIT) as u64);
        pio.read_batch().unwrap();
        pio.region_exit(region);

        assert_eq!(pio.sample_region_total(total, region).unwrap(), 42.0);
        // A region never entered reports zero.
        assert_eq!(pio.sample_region_total(total, 0xDEAD).unwrap(), 0.0);
    }

    #[test]
    fn unmatched_region_exit_accumulates_nothing() {
        let (device, mut pio) = setup(PlatformTopo::new(1, 1, 1));
        let energy = pio.push_signal("ENERGY_PACKAGE", Domain::Board, 0).unwrap();
        let total = pio.push_region_signal_total(energy).unwrap();
        device.borrow_mut().poke(0, 0x611, 1000);
        pio.read_batch().unwrap();
        pio.region_exit(0xBEEF);
        assert_eq!(pio.sample_region_total(total, 0xBEEF).unwrap(), 0.0);
    }

    #[test]
    fn profile_signals_reflect_injection() {
        let (_device, mut pio) = setup(PlatformTopo::new(1, 1, 1));
        let runtime = pio.push_signal(SIGNAL_EPOCH_RUNTIME, Domain::Board, 0).unwrap();
        let count = pio.push_signal(SIGNAL_EPOCH_COUNT, Domain::Board, 0).unwrap();
        let region = pio.push_signal(SIGNAL_REGION_ID, Domain::Board, 0).unwrap();
        pio.read_batch().unwrap();

        pio.update_profile(1.25, 3, 0xABCD);
        assert_eq!(pio.sample(runtime).unwrap(), 1.25);
        assert_eq!(pio.sample(count).unwrap(), 3.0);
        assert_eq!(signal_to_field(pio.sample(region).unwrap()), 0xABCD);
    }
}
