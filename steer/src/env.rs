//! Process environment configuration.
//!
//! All recognized variables are read once, at controller start, into an
//! [`Environment`] that is passed by reference from then on. Variable names
//! are case-sensitive and process-wide.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// How the controller is attached to the job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PmpiCtl {
    /// No controller is launched by the profiling shim.
    #[default]
    None,
    /// One extra rank per node runs the controller.
    Process,
    /// The controller runs on a thread inside rank zero of each node.
    Pthread,
}

/// The recognized process environment, loaded once.
#[derive(Clone, Debug)]
pub struct Environment {
    /// `GEOPM_REPORT`: report output path, empty disables the report.
    pub report: Option<PathBuf>,
    /// `GEOPM_TRACE`: trace output path, empty disables the trace.
    pub trace: Option<PathBuf>,
    /// `GEOPM_AGENT`: agent name resolved through the registry.
    pub agent: String,
    /// `GEOPM_POLICY`: policy source, shmem key or JSON file path.
    pub policy: Option<String>,
    /// `GEOPM_SHMKEY`: prefix for every shared-memory key.
    pub shmkey: String,
    /// `GEOPM_PLUGIN_PATH`: directories searched for agent plugins.
    pub plugin_path: Option<PathBuf>,
    /// `GEOPM_PMPI_CTL`: controller attachment mode.
    pub pmpi_ctl: PmpiCtl,
    /// `GEOPM_REGION_BARRIER`: barrier at region boundaries.
    pub do_region_barrier: bool,
    /// `GEOPM_DEBUG_ATTACH`: pid to spin for a debugger attach.
    pub debug_attach: Option<i32>,
    /// `GEOPM_PROFILE_TIMEOUT`: seconds to wait on the application
    /// rendezvous before declaring it stalled.
    pub profile_timeout: Duration,
    /// `GEOPM_ERROR_AFFINITY_IGNORE`: tolerate bad CPU affinity.
    pub do_ignore_affinity: bool,
    /// `IMBALANCER_CONFIG`: per-host slowdown table consumed by the
    /// synthetic benchmark side.
    pub imbalancer_config: Option<PathBuf>,
}

const DEFAULT_AGENT: &str = "monitor";
const DEFAULT_PROFILE_TIMEOUT: u64 = 30;

impl Environment {
    /// Reads every recognized variable from the process environment.
    pub fn load() -> Result<Environment> {
        let pmpi_ctl = match env::var("GEOPM_PMPI_CTL").ok().as_deref() {
            None | Some("none") => PmpiCtl::None,
            Some("process") => PmpiCtl::Process,
            Some("pthread") => PmpiCtl::Pthread,
            Some(other) => {
                return Err(Error::InvalidArgument(
                    format!("GEOPM_PMPI_CTL must be none, process or pthread, got {:?}", other)));
            }
        };
        let profile_timeout = match env::var("GEOPM_PROFILE_TIMEOUT").ok() {
            Some(text) => text.parse::<u64>().map_err(|_| {
                Error::InvalidArgument(format!("GEOPM_PROFILE_TIMEOUT is not a number: {:?}", text))
            })?,
            None => DEFAULT_PROFILE_TIMEOUT,
        };
        let debug_attach = match env::var("GEOPM_DEBUG_ATTACH").ok() {
            Some(text) => Some(text.parse::<i32>().map_err(|_| {
                Error::InvalidArgument(format!("GEOPM_DEBUG_ATTACH is not a pid: {:?}", text))
            })?),
            None => None,
        };
        Ok(Environment {
            report: nonempty(env::var("GEOPM_REPORT").ok()).map(PathBuf::from),
            trace: nonempty(env::var("GEOPM_TRACE").ok()).map(PathBuf::from),
            agent: nonempty(env::var("GEOPM_AGENT").ok())
                .unwrap_or_else(|| DEFAULT_AGENT.to_owned()),
            policy: nonempty(env::var("GEOPM_POLICY").ok()),
            shmkey: nonempty(env::var("GEOPM_SHMKEY").ok())
                .unwrap_or_else(Environment::default_shmkey),
            plugin_path: nonempty(env::var("GEOPM_PLUGIN_PATH").ok()).map(PathBuf::from),
            pmpi_ctl,
            do_region_barrier: env::var_os("GEOPM_REGION_BARRIER").is_some(),
            debug_attach,
            profile_timeout: Duration::from_secs(profile_timeout),
            do_ignore_affinity: env::var_os("GEOPM_ERROR_AFFINITY_IGNORE").is_some(),
            imbalancer_config: nonempty(env::var("IMBALANCER_CONFIG").ok()).map(PathBuf::from),
        })
    }

    /// The default shared-memory key prefix, unique per user.
    pub fn default_shmkey() -> String {
        format!("/geopm-shm-{}", unsafe { libc::getuid() })
    }

    /// A fully-formed shared-memory key: `/<prefix>-<purpose>[-<suffix>]`.
    pub fn shm_key(&self, purpose: &str, suffix: Option<&str>) -> String {
        match suffix {
            Some(suffix) => format!("{}-{}-{}", self.shmkey, purpose, suffix),
            None => format!("{}-{}", self.shmkey, purpose),
        }
    }
}

impl Default for Environment {
    fn default() -> Environment {
        Environment {
            report: None,
            trace: None,
            agent: DEFAULT_AGENT.to_owned(),
            policy: None,
            shmkey: Environment::default_shmkey(),
            plugin_path: None,
            pmpi_ctl: PmpiCtl::None,
            do_region_barrier: false,
            debug_attach: None,
            profile_timeout: Duration::from_secs(DEFAULT_PROFILE_TIMEOUT),
            do_ignore_affinity: false,
            imbalancer_config: None,
        }
    }
}

fn nonempty(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.is_empty())
}
