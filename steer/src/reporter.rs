//! The end-of-run report.
//!
//! Plain text: a version banner, the profile and agent names, the root
//! agent's header pairs, then one block per host listing each region's
//! accounting and an `Application Totals` block with the memory high-water
//! mark and the controller's network bandwidth.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::helper::format_float;
use crate::region::region_hash;

/// One region's row in the report.
#[derive(Clone, Debug)]
pub struct RegionReport {
    /// Region name learned from the application.
    pub name: String,
    /// Region id, flags included.
    pub region_id: u64,
    /// Mean runtime per rank, seconds.
    pub runtime: f64,
    /// Energy attributed to the region, joules.
    pub energy: f64,
    /// Mean frequency while inside the region, as a percent of the
    /// highest frequency observed over the run.
    pub frequency_pct: f64,
    /// Mean MPI time per rank, seconds.
    pub mpi_runtime: f64,
    /// Completed entry/exit cycles.
    pub count: u64,
}

/// Whole-application accounting for the totals block.
#[derive(Clone, Copy, Debug, Default)]
pub struct AppTotals {
    /// Wall time between rendezvous and shutdown, seconds.
    pub runtime: f64,
    /// Total package energy over the run, joules.
    pub energy: f64,
    /// Total MPI time per rank, seconds.
    pub mpi_runtime: f64,
    /// Application time since the first epoch entry, seconds.
    pub epoch_runtime: f64,
    /// Bytes the tree communicator deposited into remote windows.
    pub network_bytes: usize,
}

/// Writes one node's report.
pub struct Reporter {
    path: Option<std::path::PathBuf>,
}

impl Reporter {
    /// A reporter writing to `path`, or a disabled one for `None`.
    pub fn new(path: Option<&Path>) -> Reporter {
        Reporter { path: path.map(Path::to_path_buf) }
    }

    /// Produces the report file.
    pub fn generate(&self,
                    profile_name: &str,
                    agent_name: &str,
                    agent_header: &[(String, String)],
                    agent_node: &[(String, String)],
                    regions: &[RegionReport],
                    totals: AppTotals) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = File::create(path)
            .map_err(|err| Error::io(path.display().to_string(), err))?;
        let mut out = BufWriter::new(file);
        let io_err = |err| Error::io(path.display().to_string(), err);

        writeln!(out, "##### geopm {} #####", env!("CARGO_PKG_VERSION")).map_err(io_err)?;
        writeln!(out, "Profile: {}", profile_name).map_err(io_err)?;
        writeln!(out, "Agent: {}", agent_name).map_err(io_err)?;
        for (key, value) in agent_header {
            writeln!(out, "{}: {}", key, value).map_err(io_err)?;
        }
        writeln!(out).map_err(io_err)?;

        writeln!(out, "Host: {}", hostname()).map_err(io_err)?;
        for (key, value) in agent_node {
            writeln!(out, "    {}: {}", key, value).map_err(io_err)?;
        }
        for region in regions {
            writeln!(out, "Region {} (0x{:016x}):",
                     region.name, region_hash(region.region_id)).map_err(io_err)?;
            writeln!(out, "    runtime (sec): {}", format_float(region.runtime))
                .map_err(io_err)?;
            writeln!(out, "    energy (joules): {}", format_float(region.energy))
                .map_err(io_err)?;
            writeln!(out, "    frequency (%): {}", format_float(region.frequency_pct))
                .map_err(io_err)?;
            writeln!(out, "    mpi-runtime (sec): {}", format_float(region.mpi_runtime))
                .map_err(io_err)?;
            writeln!(out, "    count: {}", region.count).map_err(io_err)?;
        }

        writeln!(out, "Application Totals:").map_err(io_err)?;
        writeln!(out, "    runtime (sec): {}", format_float(totals.runtime)).map_err(io_err)?;
        writeln!(out, "    energy (joules): {}", format_float(totals.energy)).map_err(io_err)?;
        writeln!(out, "    mpi-runtime (sec): {}", format_float(totals.mpi_runtime))
            .map_err(io_err)?;
        writeln!(out, "    epoch-runtime (sec): {}", format_float(totals.epoch_runtime))
            .map_err(io_err)?;
        writeln!(out, "    geopmctl memory HWM: {} kB", memory_hwm_kib()).map_err(io_err)?;
        let bandwidth = if totals.runtime > 0.0 {
            totals.network_bytes as f64 / totals.runtime
        }
        else {
            0.0
        };
        writeln!(out, "    geopmctl network BW (B/sec): {}", format_float(bandwidth))
            .map_err(io_err)?;
        out.flush().map_err(io_err)
    }
}

fn hostname() -> String {
    let mut buffer = [0u8; 256];
    let code = unsafe {
        libc::gethostname(buffer.as_mut_ptr().cast(), buffer.len() - 1)
    };
    if code != 0 {
        return "unknown".to_owned();
    }
    let end = buffer.iter().position(|b| *b == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..end]).into_owned()
}

/// VmHWM from /proc/self/status, in kibibytes; zero when unavailable.
fn memory_hwm_kib() -> u64 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return 0;
    };
    status
        .lines()
        .find(|line| line.starts_with("VmHWM:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|field| field.parse().ok())
        .unwrap_or(0)
}
