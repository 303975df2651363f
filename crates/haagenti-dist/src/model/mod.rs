//! Computation models
//!
//! A computation model answers topology queries and runs collectives for
//! one backend family. [`ModelFactory`] is the registry-facing half: it
//! detects an already-active runtime, creates a fresh one, or spawns workers.

mod native;
mod pod;
mod serial;

pub use native::{NativeFactory, NativeModel};
pub use pod::{PodFactory, PodModel};
pub use serial::{SerialFactory, SerialModel};

use crate::config::LaunchConfig;
use crate::device::Device;
use crate::launcher::WorkerResult;
use crate::topology::Topology;
use crate::value::{Buffer, ReduceOp, Value};
use crate::{DistError, Result};
use std::fmt::Debug;

/// Worker entry handed to [`ModelFactory::spawn`]: local rank and the
/// worker's freshly created model
pub type WorkerEntry<'a> = dyn Fn(usize, Box<dyn ComputationModel>) -> WorkerResult + Sync + 'a;

/// Active computation model of one worker
pub trait ComputationModel: Debug {
    /// Model name, e.g. `"serial"`
    fn name(&self) -> &'static str;

    /// Backend tag, `None` for the serial model
    fn backend(&self) -> Option<&str>;

    /// Device this worker computes on
    fn device(&self) -> Device;

    /// Placement of this worker
    fn topology(&self) -> &Topology;

    /// Reduce `value` across every worker
    fn all_reduce(&mut self, value: Value, op: ReduceOp) -> Result<Value>;

    /// Concatenate `value` from every worker along the leading dimension, in rank order
    fn all_gather(&mut self, value: Value) -> Result<Buffer>;

    /// Release the model's runtime resources
    fn finalize(&mut self) -> Result<()>;

    fn get_world_size(&self) -> usize {
        self.topology().world_size()
    }

    fn get_rank(&self) -> usize {
        self.topology().rank()
    }

    fn get_local_rank(&self) -> usize {
        self.topology().local_rank()
    }

    fn get_ntasks_per_node(&self) -> usize {
        self.topology().ntasks_per_node()
    }

    fn get_num_nodes(&self) -> usize {
        self.topology().num_nodes()
    }

    fn get_node_rank(&self) -> usize {
        self.topology().node_rank()
    }
}

/// Constructor side of a computation model
pub trait ModelFactory: Debug + Send + Sync {
    /// Name of the models this factory builds
    fn name(&self) -> &'static str;

    /// Backend tags this factory accepts
    fn available_backends(&self) -> &'static [&'static str];

    /// Adopt a runtime that is already active on this worker.
    ///
    /// Returns `Ok(None)` when there is nothing to adopt, and an error when a
    /// runtime is active but cannot be described.
    fn create_from_context(
        &self,
        local_rank_hint: Option<usize>,
    ) -> Result<Option<Box<dyn ComputationModel>>>;

    /// Start a new runtime for `backend`
    fn create(&self, backend: &str, config: &LaunchConfig) -> Result<Box<dyn ComputationModel>>;

    /// Run `entry` on `num_procs_per_node` local workers, each with its own model
    fn spawn(
        &self,
        backend: &str,
        num_procs_per_node: usize,
        config: &LaunchConfig,
        entry: &WorkerEntry<'_>,
    ) -> Result<()> {
        let _ = (num_procs_per_node, config, entry);
        Err(DistError::InvalidConfig(format!(
            "{} model cannot spawn workers for backend '{}'",
            self.name(),
            backend
        )))
    }

    /// Whether this factory accepts `backend`
    fn supports(&self, backend: &str) -> bool {
        self.available_backends().contains(&backend)
    }
}
