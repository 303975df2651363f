//! Backend-agnostic distributed computation
//!
//! This crate gives training and inference code one API over three ways of
//! running:
//! - Serial: a single process, every collective is the identity
//! - Native collective groups (`nccl`, `gloo`) joined over a TCP rendezvous
//! - Accelerator pods (`xla-tpu`): one logical worker per core, linked in a ring
//!
//! The free functions below act on the calling thread's default [`Context`].
//! Until [`initialize`] is called, the first query detects a process group or
//! pod core that was set up elsewhere and adopts it.
//!
//! ```no_run
//! use haagenti_dist::LaunchConfig;
//!
//! fn training(local_rank: usize, lr: f64) -> haagenti_dist::Result<()> {
//!     let rank = haagenti_dist::get_rank()?;
//!     let total = haagenti_dist::all_reduce(1.0, "SUM")?;
//!     println!("worker {local_rank} (rank {rank}) lr={lr} sees {total:?} workers");
//!     Ok(())
//! }
//!
//! haagenti_dist::spawn("gloo", training, 0.01, 4, &LaunchConfig::default())?;
//! # Ok::<(), haagenti_dist::DistError>(())
//! ```

mod config;
mod context;
mod device;
mod error;
pub mod group;
mod launcher;
mod model;
pub mod pod;
mod registry;
mod topology;
pub mod transport;
mod value;

pub use config::{
    LaunchConfig, DEFAULT_MASTER_ADDR, DEFAULT_MASTER_PORT, DEFAULT_TIMEOUT, LOCAL_RANK_ENV,
    MASTER_ADDR_ENV, MASTER_PORT_ENV, RANK_ENV, WORLD_SIZE_ENV,
};
pub use context::{with_default_context, ConfigSnapshot, Context};
pub use device::{visible_accelerators, Device, VISIBLE_DEVICES_ENV};
pub use error::{BoxError, DistError, Result};
pub use launcher::WorkerResult;
pub use model::{
    ComputationModel, ModelFactory, NativeFactory, NativeModel, PodFactory, PodModel,
    SerialFactory, SerialModel, WorkerEntry,
};
pub use registry::Registry;
pub use topology::{Ring, Topology};
pub use value::{Buffer, ReduceOp, Value};

/// Backend of the active model, `None` when serial
pub fn backend() -> Result<Option<String>> {
    with_default_context(|ctx| ctx.backend())
}

/// Device of the active model
pub fn device() -> Result<Device> {
    with_default_context(|ctx| ctx.device())
}

/// Backends accepted by [`initialize`] and [`spawn`]
pub fn available_backends() -> Vec<&'static str> {
    with_default_context(|ctx| ctx.available_backends())
}

/// Name of the active model
pub fn model_name() -> Result<&'static str> {
    with_default_context(|ctx| ctx.model_name())
}

pub fn get_world_size() -> Result<usize> {
    with_default_context(|ctx| ctx.get_world_size())
}

pub fn get_rank() -> Result<usize> {
    with_default_context(|ctx| ctx.get_rank())
}

pub fn get_local_rank() -> Result<usize> {
    with_default_context(|ctx| ctx.get_local_rank())
}

pub fn get_ntasks_per_node() -> Result<usize> {
    with_default_context(|ctx| ctx.get_ntasks_per_node())
}

pub fn get_num_nodes() -> Result<usize> {
    with_default_context(|ctx| ctx.get_num_nodes())
}

pub fn get_node_rank() -> Result<usize> {
    with_default_context(|ctx| ctx.get_node_rank())
}

/// Host name of this machine
pub fn hostname() -> String {
    context::hostname()
}

/// Run `f(local_rank, args)` on `num_procs_per_node` workers; see [`Context::spawn`]
pub fn spawn<F, A, E>(
    backend: &str,
    f: F,
    args: A,
    num_procs_per_node: usize,
    config: &LaunchConfig,
) -> Result<()>
where
    F: Fn(usize, A) -> std::result::Result<(), E> + Sync,
    A: Clone + Sync,
    E: Into<BoxError>,
{
    // Workers install their own default contexts, so the caller's stays free.
    let registry = with_default_context(|ctx| ctx.registry().clone());
    Context::new(registry).spawn(backend, f, args, num_procs_per_node, config)
}

/// Start `backend` and make it the active model
pub fn initialize(backend: &str, config: &LaunchConfig) -> Result<()> {
    with_default_context(|ctx| ctx.initialize(backend, config))
}

/// Tear down the active model and revert to serial
pub fn finalize() -> Result<()> {
    with_default_context(|ctx| ctx.finalize())
}

/// Log the current configuration at info level
pub fn show_config() -> Result<ConfigSnapshot> {
    with_default_context(|ctx| ctx.show_config())
}

/// Local rank to use when adopting a group that cannot report it
pub fn set_local_rank(index: usize) {
    with_default_context(|ctx| ctx.set_local_rank(index))
}

/// Reduce `value` across all workers
pub fn all_reduce(value: impl Into<Value>, op: &str) -> Result<Value> {
    with_default_context(|ctx| ctx.all_reduce(value, op))
}

/// Gather `value` from all workers, concatenated in rank order
pub fn all_gather(value: impl Into<Value>) -> Result<Buffer> {
    with_default_context(|ctx| ctx.all_gather(value))
}

/// Re-run runtime detection
pub fn sync() -> Result<()> {
    with_default_context(|ctx| ctx.sync())
}

/// Whether the pod model is part of the default registry
pub fn has_pod_support() -> bool {
    cfg!(feature = "pod")
}

/// Names of the models in the default registry
pub fn registered_computation_models() -> Vec<&'static str> {
    with_default_context(|ctx| ctx.registered_computation_models())
}
