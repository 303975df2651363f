//! Native collective model backed by the default process group

use super::{ComputationModel, ModelFactory, WorkerEntry};
use crate::config::{env_parse, LaunchConfig, LOCAL_RANK_ENV};
use crate::device::{visible_accelerators, Device};
use crate::group::{self, SUPPORTED_BACKENDS};
use crate::launcher;
use crate::topology::Topology;
use crate::transport::Rendezvous;
use crate::value::{Buffer, ReduceOp, Value};
use crate::{DistError, Result};
use tracing::{debug, warn};

/// Model over the worker's default process group
#[derive(Debug)]
pub struct NativeModel {
    backend: String,
    topology: Topology,
}

impl NativeModel {
    pub const NAME: &'static str = "native-dist";

    /// Join a new process group for `backend`.
    ///
    /// Fails with `AlreadyInitialized` if this worker already has a group.
    pub fn create(backend: &str, config: &LaunchConfig) -> Result<Self> {
        config.validate()?;
        let (rank, world_size, local_rank) = config.resolve_ranks()?;
        let (master_addr, master_port) = config.resolve_endpoint()?;

        let rendezvous = Rendezvous {
            master_addr,
            master_port,
            rank,
            world_size,
            timeout: config.timeout,
        };
        debug!(backend, rank, world_size, address = %rendezvous.address(), "Creating native model");
        group::init_process_group(backend, &rendezvous)?;

        Self::from_group(local_rank).map_err(|e| {
            if let Err(cleanup) = group::destroy_process_group() {
                warn!(error = %cleanup, "Failed to tear down process group");
            }
            e
        })
    }

    /// Describe the active default group, if any
    pub fn from_context(local_rank_hint: Option<usize>) -> Result<Option<Self>> {
        if !group::is_initialized() {
            return Ok(None);
        }
        let local_rank = match local_rank_hint {
            Some(lr) => lr,
            None => env_parse(LOCAL_RANK_ENV)?.ok_or_else(|| {
                DistError::ContextDetection(format!(
                    "process group is active but the local rank is unknown; \
                     call set_local_rank or export {}",
                    LOCAL_RANK_ENV
                ))
            })?,
        };
        Self::from_group(local_rank).map(Some)
    }

    /// Build the topology of the active group; a collective, every rank must call it
    fn from_group(local_rank: usize) -> Result<Self> {
        let backend = group::backend()?;
        let rank = group::rank()?;
        let world_size = group::world_size()?;

        let mut ntasks = [(local_rank + 1) as f64];
        group::with_group(|g| g.transport().all_reduce(&mut ntasks, ReduceOp::Max))?;
        let ntasks_per_node = ntasks[0] as usize;

        let topology = Topology::from_ranks(world_size, rank, local_rank, ntasks_per_node)?;
        Ok(Self { backend, topology })
    }
}

impl ComputationModel for NativeModel {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn backend(&self) -> Option<&str> {
        Some(&self.backend)
    }

    fn device(&self) -> Device {
        if self.backend == "nccl" && visible_accelerators() > 0 {
            Device::Cuda(self.topology.local_rank())
        } else {
            Device::Cpu
        }
    }

    fn topology(&self) -> &Topology {
        &self.topology
    }

    fn all_reduce(&mut self, value: Value, op: ReduceOp) -> Result<Value> {
        value.reduce_with(|data| group::with_group(|g| g.transport().all_reduce(data, op)))
    }

    fn all_gather(&mut self, value: Value) -> Result<Buffer> {
        let local = value.into_buffer();
        let gathered = group::with_group(|g| g.transport().all_gather(&local))?;
        Buffer::concat(&gathered)
    }

    fn finalize(&mut self) -> Result<()> {
        group::destroy_process_group()?;
        Ok(())
    }
}

/// Factory of [`NativeModel`]
#[derive(Debug, Default)]
pub struct NativeFactory;

impl ModelFactory for NativeFactory {
    fn name(&self) -> &'static str {
        NativeModel::NAME
    }

    fn available_backends(&self) -> &'static [&'static str] {
        SUPPORTED_BACKENDS
    }

    fn create_from_context(
        &self,
        local_rank_hint: Option<usize>,
    ) -> Result<Option<Box<dyn ComputationModel>>> {
        Ok(NativeModel::from_context(local_rank_hint)?
            .map(|m| Box::new(m) as Box<dyn ComputationModel>))
    }

    fn create(&self, backend: &str, config: &LaunchConfig) -> Result<Box<dyn ComputationModel>> {
        Ok(Box::new(NativeModel::create(backend, config)?))
    }

    fn spawn(
        &self,
        backend: &str,
        num_procs_per_node: usize,
        config: &LaunchConfig,
        entry: &WorkerEntry<'_>,
    ) -> Result<()> {
        config.validate()?;
        launcher::run(num_procs_per_node, |local_rank| {
            let worker_config = config.for_worker(local_rank, num_procs_per_node);
            let model = NativeModel::create(backend, &worker_config)?;
            entry(local_rank, Box::new(model))
        })
    }
}
