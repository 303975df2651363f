//! Distributed context
//!
//! [`Context`] holds the active computation model of one worker together
//! with a staleness flag. While the model is serial and the flag is set,
//! every query first re-runs detection so that a process group created
//! outside [`Context::initialize`] is picked up on first use.
//!
//! A `Context` is single-threaded. Each thread has its own default context,
//! reachable through [`with_default_context`] and the crate's free functions.

use crate::config::LaunchConfig;
use crate::device::Device;
use crate::error::BoxError;
use crate::launcher::WorkerResult;
use crate::model::{ComputationModel, SerialModel};
use crate::registry::Registry;
use crate::value::{Buffer, ReduceOp, Value};
use crate::{DistError, Result};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use tracing::{debug, info, warn};

/// Snapshot of every topology query, as logged by [`Context::show_config`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub model: String,
    pub backend: Option<String>,
    pub device: String,
    pub hostname: String,
    pub world_size: usize,
    pub rank: usize,
    pub local_rank: usize,
    pub ntasks_per_node: usize,
    pub num_nodes: usize,
    pub node_rank: usize,
}

/// Active computation model plus lazy detection state
#[derive(Debug)]
pub struct Context {
    registry: Registry,
    model: Box<dyn ComputationModel>,
    needs_sync: bool,
    local_rank_hint: Option<usize>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Registry::default())
    }
}

impl Context {
    /// Serial context that will detect an active runtime on first use
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            model: Box::new(SerialModel::new()),
            needs_sync: true,
            local_rank_hint: None,
        }
    }

    /// Context around an already created model; no detection will run
    pub fn with_model(registry: Registry, model: Box<dyn ComputationModel>) -> Self {
        Self {
            registry,
            model,
            needs_sync: false,
            local_rank_hint: None,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Whether the next query may re-run detection
    pub fn needs_sync(&self) -> bool {
        self.needs_sync
    }

    fn ensure_synced(&mut self) -> Result<()> {
        if self.needs_sync && self.model.name() == SerialModel::NAME {
            self.sync()?;
        }
        Ok(())
    }

    /// Detect an active runtime and adopt it, else fall back to serial.
    ///
    /// The active model is kept only when detection describes exactly the
    /// same placement, so a pod core it owns stays owned.
    pub fn sync(&mut self) -> Result<()> {
        let detected = self.registry.resolve(self.local_rank_hint)?;
        if detected.name() == self.model.name()
            && detected.backend() == self.model.backend()
            && detected.topology() == self.model.topology()
        {
            return Ok(());
        }
        debug!(
            from = self.model.name(),
            to = detected.name(),
            "Switching computation model"
        );
        self.model = detected;
        Ok(())
    }

    /// Start `backend` with `config` and make it the active model.
    ///
    /// A previously active model is finalized first. Stays serial when no
    /// distributed model is registered.
    pub fn initialize(&mut self, backend: &str, config: &LaunchConfig) -> Result<()> {
        if !self.registry.has_distributed_models() {
            debug!(backend, "No distributed runtime available, staying serial");
            return Ok(());
        }
        self.registry.assert_backend(backend)?;
        let factory = self.registry.factory_for(backend).cloned().ok_or_else(|| {
            DistError::UnknownBackend {
                backend: backend.to_string(),
                available: self.registry.available_backends(),
            }
        })?;

        if self.model.name() != SerialModel::NAME {
            debug!(model = self.model.name(), backend, "Finalizing previous model");
            self.finalize()?;
        }
        self.model = factory.create(backend, config)?;
        self.needs_sync = false;
        info!(
            model = self.model.name(),
            backend,
            rank = self.model.get_rank(),
            world_size = self.model.get_world_size(),
            "Distributed context initialized"
        );
        Ok(())
    }

    /// Tear down the active model and revert to serial.
    ///
    /// The context is serial afterwards even if teardown failed.
    pub fn finalize(&mut self) -> Result<()> {
        let outcome = self.model.finalize();
        if self.model.name() != SerialModel::NAME {
            info!(model = self.model.name(), "Distributed context finalized");
        }
        self.model = Box::new(SerialModel::new());
        self.needs_sync = true;
        outcome
    }

    /// Run `f(local_rank, args)` on `num_procs_per_node` workers of `backend`.
    ///
    /// Every worker starts with an initialized default context and finalizes
    /// it on exit, also when `f` fails or panics. Blocks until all workers
    /// are done and reports the first failure.
    pub fn spawn<F, A, E>(
        &self,
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
        self.registry.assert_backend(backend)?;
        let factory = self.registry.factory_for(backend).ok_or_else(|| {
            DistError::UnknownBackend {
                backend: backend.to_string(),
                available: self.registry.available_backends(),
            }
        })?;

        info!(
            backend,
            num_procs_per_node,
            num_nodes = config.num_nodes,
            node_rank = config.node_rank,
            "Spawning workers"
        );

        let registry = &self.registry;
        let entry = |local_rank: usize, model: Box<dyn ComputationModel>| -> WorkerResult {
            let worker = Context::with_model(registry.clone(), model);
            with_default_context(|ctx| *ctx = worker);
            let _finalize = FinalizeOnExit;
            f(local_rank, args.clone()).map_err(Into::into)
        };
        factory.spawn(backend, num_procs_per_node, config, &entry)
    }

    /// Local rank to use when adopting a group that cannot report it
    pub fn set_local_rank(&mut self, index: usize) {
        self.local_rank_hint = Some(index);
    }

    pub fn backend(&mut self) -> Result<Option<String>> {
        self.ensure_synced()?;
        Ok(self.model.backend().map(str::to_string))
    }

    pub fn device(&mut self) -> Result<Device> {
        self.ensure_synced()?;
        Ok(self.model.device())
    }

    pub fn model_name(&mut self) -> Result<&'static str> {
        self.ensure_synced()?;
        Ok(self.model.name())
    }

    pub fn get_world_size(&mut self) -> Result<usize> {
        self.ensure_synced()?;
        Ok(self.model.get_world_size())
    }

    pub fn get_rank(&mut self) -> Result<usize> {
        self.ensure_synced()?;
        Ok(self.model.get_rank())
    }

    pub fn get_local_rank(&mut self) -> Result<usize> {
        self.ensure_synced()?;
        Ok(self.model.get_local_rank())
    }

    pub fn get_ntasks_per_node(&mut self) -> Result<usize> {
        self.ensure_synced()?;
        Ok(self.model.get_ntasks_per_node())
    }

    pub fn get_num_nodes(&mut self) -> Result<usize> {
        self.ensure_synced()?;
        Ok(self.model.get_num_nodes())
    }

    pub fn get_node_rank(&mut self) -> Result<usize> {
        self.ensure_synced()?;
        Ok(self.model.get_node_rank())
    }

    /// Backends accepted by [`initialize`](Self::initialize) and [`spawn`](Self::spawn)
    pub fn available_backends(&self) -> Vec<&'static str> {
        self.registry.available_backends()
    }

    pub fn registered_computation_models(&self) -> Vec<&'static str> {
        self.registry.model_names()
    }

    /// Reduce `value` across all workers; `op` is one of SUM, PRODUCT, MIN, MAX, AND, OR
    pub fn all_reduce(&mut self, value: impl Into<Value>, op: &str) -> Result<Value> {
        let op: ReduceOp = op.parse()?;
        self.ensure_synced()?;
        self.model.all_reduce(value.into(), op)
    }

    /// Gather `value` from all workers, concatenated in rank order
    pub fn all_gather(&mut self, value: impl Into<Value>) -> Result<Buffer> {
        self.ensure_synced()?;
        self.model.all_gather(value.into())
    }

    /// Log every query at info level and return them
    pub fn show_config(&mut self) -> Result<ConfigSnapshot> {
        self.ensure_synced()?;
        let snapshot = ConfigSnapshot {
            model: self.model.name().to_string(),
            backend: self.model.backend().map(str::to_string),
            device: self.model.device().to_string(),
            hostname: hostname(),
            world_size: self.model.get_world_size(),
            rank: self.model.get_rank(),
            local_rank: self.model.get_local_rank(),
            ntasks_per_node: self.model.get_ntasks_per_node(),
            num_nodes: self.model.get_num_nodes(),
            node_rank: self.model.get_node_rank(),
        };

        info!("distributed configuration: {}", snapshot.model);
        info!("backend: {:?}", snapshot.backend);
        info!("device: {}", snapshot.device);
        info!("hostname: {}", snapshot.hostname);
        info!("world size: {}", snapshot.world_size);
        info!("rank: {}", snapshot.rank);
        info!("local rank: {}", snapshot.local_rank);
        info!("num tasks per node: {}", snapshot.ntasks_per_node);
        info!("num nodes: {}", snapshot.num_nodes);
        info!("node rank: {}", snapshot.node_rank);
        Ok(snapshot)
    }
}

/// Host name of this machine
pub fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

thread_local! {
    static DEFAULT_CONTEXT: RefCell<Context> = RefCell::new(Context::default());
}

/// Run `f` with this thread's default context.
///
/// # Panics
///
/// Panics if called from inside another `with_default_context` closure.
pub fn with_default_context<T>(f: impl FnOnce(&mut Context) -> T) -> T {
    DEFAULT_CONTEXT.with(|ctx| f(&mut ctx.borrow_mut()))
}

/// Finalizes the thread's default context when a spawned worker exits
struct FinalizeOnExit;

impl Drop for FinalizeOnExit {
    fn drop(&mut self) {
        let outcome = DEFAULT_CONTEXT.try_with(|ctx| match ctx.try_borrow_mut() {
            Ok(mut ctx) => ctx.finalize(),
            Err(_) => Err(DistError::Comm("default context is busy".into())),
        });
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Worker finalize failed"),
            Err(_) => warn!("Worker context already destroyed"),
        }
    }
}
