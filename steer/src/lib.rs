//! A hierarchical power-steering runtime for HPC jobs.
//!
//! One controller runs per compute node while a profiled application
//! executes. Each tick it distributes policy down a k-ary tree of nodes,
//! writes platform controls (package power caps, frequency limits),
//! drains the application's region markers from shared memory, reads
//! platform telemetry in one batch, and aggregates samples back up the
//! tree. The reference agent balances a job-wide average power cap so
//! that every node finishes its epochs at the same time.
//!
//! The layers, bottom up:
//!
//! - [`platform`]: batched signals and controls over MSRs and derived
//!   quantities.
//! - [`profile`]: shared-memory rendezvous with the application's
//!   region entry/exit stream.
//! - `steer_communication`: the tree of one-sided sample/policy windows.
//! - [`agent`]: the pluggable per-level decision function.
//! - [`controller`]: the fixed-order tick joining all of the above.
//! - [`endpoint`]: policy ingestion and sample emission at the tree
//!   root.
//!
//! Most programs enter through [`execute::execute`], which wires an
//! in-process tree and runs one controller per node:
//!
//! ```
//! use std::sync::Arc;
//! use steer::agent::AgentRegistry;
//!
//! let registry = Arc::new(AgentRegistry::with_defaults());
//! assert!(registry.spec("power_balancer").is_ok());
//! ```

pub mod agent;
pub mod controller;
pub mod endpoint;
pub mod env;
pub mod error;
pub mod execute;
pub mod helper;
pub mod platform;
pub mod profile;
pub mod region;
pub mod reporter;
pub mod signal_handler;
pub mod tracer;

pub use agent::{Agent, AgentRegistry};
pub use controller::Controller;
pub use env::Environment;
pub use error::{error_message, exit_code, Error, Result};
pub use platform::PlatformIo;
pub use profile::{ApplicationInlet, ApplicationIo};
