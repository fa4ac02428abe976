//! Spawns one controller per node over an in-process tree.
//!
//! The harness stands in for a launcher: it wires the tree fabric for a
//! node count, spawns one thread per node, and runs a [`Controller`] on
//! each. Per-node pieces that cannot cross threads (the platform surface,
//! the application inlet) are produced by a setup closure invoked on the
//! node's own thread.
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use std::sync::Arc;
//!
//! use steer::agent::AgentRegistry;
//! use steer::execute::{execute, Configuration};
//! use steer::platform::{DevMsr, PlatformIo, PlatformTopo, SharedMsrIo};
//! use steer::profile::ApplicationIo;
//!
//! let config = Configuration::from_args(std::env::args()).unwrap();
//! let registry = Arc::new(AgentRegistry::with_defaults());
//! let guards = execute(config, registry, |_rank, env| {
//!     let device: SharedMsrIo = Rc::new(RefCell::new(DevMsr::new()));
//!     let platform = PlatformIo::new(PlatformTopo::detect(), device);
//!     let num_cpu = platform.topo().num_domain(steer::platform::Domain::Cpu);
//!     let inlet = Box::new(ApplicationIo::new(env, num_cpu)?);
//!     Ok((platform, inlet))
//! }).unwrap();
//! for result in guards.join() {
//!     result.unwrap().unwrap();
//! }
//! ```

use std::sync::Arc;
use std::thread;

use steer_communication::TreeComm;

use crate::agent::AgentRegistry;
use crate::controller::Controller;
use crate::env::{Environment, PmpiCtl};
use crate::error::{Error, Result};
use crate::platform::PlatformIo;
use crate::profile::ApplicationInlet;

/// How many nodes to run and under which environment.
#[derive(Clone, Debug)]
pub struct Configuration {
    /// Number of controller nodes (threads) to spawn.
    pub num_node: usize,
    /// The process environment shared by every node.
    pub env: Environment,
}

impl Configuration {
    /// One node under the loaded process environment.
    pub fn single() -> Result<Configuration> {
        Ok(Configuration { num_node: 1, env: Environment::load()? })
    }

    /// Parses command-line arguments; recognizes `-n`/`--nodes`.
    #[cfg(feature = "getopts")]
    pub fn from_args<I: Iterator<Item = String>>(args: I) -> Result<Configuration> {
        let mut opts = getopts::Options::new();
        opts.optopt("n", "nodes", "number of controller nodes", "NUM");
        let matches = opts
            .parse(args.skip(1))
            .map_err(|err| Error::InvalidArgument(err.to_string()))?;
        let num_node = match matches.opt_str("n") {
            Some(text) => text.parse::<usize>().map_err(|_| {
                Error::InvalidArgument(format!("node count is not a number: {:?}", text))
            })?,
            None => 1,
        };
        if num_node == 0 {
            return Err(Error::InvalidArgument("node count must be positive".into()));
        }
        Ok(Configuration { num_node, env: Environment::load()? })
    }
}

/// Join handles for the spawned controller threads.
pub struct WorkerGuards<T> {
    guards: Vec<thread::JoinHandle<T>>,
}

impl<T> WorkerGuards<T> {
    /// Waits for every node and returns the results in rank order.
    pub fn join(self) -> Vec<std::thread::Result<T>> {
        self.guards.into_iter().map(thread::JoinHandle::join).collect()
    }
}

/// Wires the tree, spawns the nodes, and runs one controller on each.
///
/// `node_setup` runs on each node's thread and produces the node's
/// platform surface and application inlet; the node's rank and (possibly
/// rank-adjusted) environment are passed in. Only rank zero writes the
/// report; trace paths are suffixed with the rank.
pub fn execute<F>(config: Configuration,
                  registry: Arc<AgentRegistry>,
                  node_setup: F) -> Result<WorkerGuards<Result<()>>>
where
    F: Fn(usize, &Environment) -> Result<(PlatformIo, Box<dyn ApplicationInlet>)>
        + Send + Sync + 'static,
{
    if config.env.pmpi_ctl == PmpiCtl::Process {
        return Err(Error::NotImplemented(
            "the process controller variant requires an MPI launcher".into()));
    }
    let spec = registry.spec(&config.env.agent)?;
    let builders = TreeComm::new_vector(config.num_node,
                                        spec.policy_names.len(),
                                        spec.sample_names.len());
    let setup = Arc::new(node_setup);

    let mut guards = Vec::with_capacity(config.num_node);
    for (rank, builder) in builders.into_iter().enumerate() {
        let mut env = config.env.clone();
        if rank != 0 {
            env.report = None;
        }
        if let Some(trace) = env.trace.take() {
            let mut path = trace.into_os_string();
            path.push(format!("-{}", rank));
            env.trace = Some(path.into());
        }
        let registry = Arc::clone(&registry);
        let setup = Arc::clone(&setup);
        let guard = thread::Builder::new()
            .name(format!("steer-node-{}", rank))
            .spawn(move || -> Result<()> {
                let comm = builder.build();
                let (platform_io, application_io) = setup(rank, &env)?;
                let mut controller =
                    Controller::new(&env, &registry, comm, platform_io, application_io)?;
                controller.run()
            })
            .map_err(|err| Error::Runtime(format!("failed to spawn node {}: {}", rank, err)))?;
        guards.push(guard);
    }
    Ok(WorkerGuards { guards })
}
