//! Accelerator pod model

use super::{ComputationModel, ModelFactory, WorkerEntry};
use crate::config::LaunchConfig;
use crate::device::Device;
use crate::pod;
use crate::topology::Topology;
use crate::transport::Transport;
use crate::value::{Buffer, ReduceOp, Value};
use crate::{DistError, Result};
use tracing::debug;

/// Backends implemented by the pod runtime
pub const POD_BACKENDS: &[&str] = &["xla-tpu"];

/// Model over the pod core bound to this worker.
///
/// Pods are single-node: every core is a local rank of node 0.
#[derive(Debug)]
pub struct PodModel {
    topology: Topology,
    /// Opened its own single-core pod, so releases it on finalize
    owns_core: bool,
}

impl PodModel {
    pub const NAME: &'static str = "xla-dist";

    /// Describe the core bound to this thread
    pub fn attach() -> Result<Self> {
        let ordinal = pod::ordinal()?;
        let world_size = pod::world_size()?;
        let topology = Topology::new(world_size, ordinal, ordinal, world_size, 1, 0)?;
        Ok(Self {
            topology,
            owns_core: false,
        })
    }

    /// Attach to the current core, opening a single-core pod if none is bound
    pub fn create(backend: &str, config: &LaunchConfig) -> Result<Self> {
        if !POD_BACKENDS.contains(&backend) {
            return Err(DistError::UnknownBackend {
                backend: backend.to_string(),
                available: POD_BACKENDS.to_vec(),
            });
        }
        check_single_node(config)?;

        if pod::is_active() {
            return Self::attach();
        }
        pod::open_single_core()?;
        debug!(backend, "Pod model owns a single-core pod");
        let mut model = Self::attach()?;
        model.owns_core = true;
        Ok(model)
    }
}

fn check_single_node(config: &LaunchConfig) -> Result<()> {
    if config.num_nodes != 1 || config.node_rank != 0 {
        return Err(DistError::InvalidConfig(format!(
            "pod backends run on a single node, got num_nodes={} node_rank={}",
            config.num_nodes, config.node_rank
        )));
    }
    Ok(())
}

impl ComputationModel for PodModel {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn backend(&self) -> Option<&str> {
        Some(POD_BACKENDS[0])
    }

    fn device(&self) -> Device {
        Device::Pod(self.topology.local_rank())
    }

    fn topology(&self) -> &Topology {
        &self.topology
    }

    fn all_reduce(&mut self, value: Value, op: ReduceOp) -> Result<Value> {
        value.reduce_with(|data| pod::with_core(|core| core.all_reduce(data, op)))
    }

    fn all_gather(&mut self, value: Value) -> Result<Buffer> {
        let local = value.into_buffer();
        let gathered = pod::with_core(|core| core.all_gather(&local))?;
        Buffer::concat(&gathered)
    }

    fn finalize(&mut self) -> Result<()> {
        if self.owns_core {
            pod::release();
            self.owns_core = false;
        }
        Ok(())
    }
}

/// Factory of [`PodModel`]
#[derive(Debug, Default)]
pub struct PodFactory;

impl ModelFactory for PodFactory {
    fn name(&self) -> &'static str {
        PodModel::NAME
    }

    fn available_backends(&self) -> &'static [&'static str] {
        POD_BACKENDS
    }

    fn create_from_context(
        &self,
        _local_rank_hint: Option<usize>,
    ) -> Result<Option<Box<dyn ComputationModel>>> {
        if !pod::is_active() {
            return Ok(None);
        }
        Ok(Some(Box::new(PodModel::attach()?)))
    }

    fn create(&self, backend: &str, config: &LaunchConfig) -> Result<Box<dyn ComputationModel>> {
        Ok(Box::new(PodModel::create(backend, config)?))
    }

    fn spawn(
        &self,
        backend: &str,
        num_procs_per_node: usize,
        config: &LaunchConfig,
        entry: &WorkerEntry<'_>,
    ) -> Result<()> {
        if !self.supports(backend) {
            return Err(DistError::UnknownBackend {
                backend: backend.to_string(),
                available: POD_BACKENDS.to_vec(),
            });
        }
        check_single_node(config)?;
        pod::launch(num_procs_per_node, |ordinal| {
            entry(ordinal, Box::new(PodModel::attach()?))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_owns_single_core() {
        let mut model = PodModel::create("xla-tpu", &LaunchConfig::default()).unwrap();
        assert_eq!(model.name(), "xla-dist");
        assert_eq!(model.backend(), Some("xla-tpu"));
        assert_eq!(model.device(), Device::Pod(0));
        assert_eq!(model.device().to_string(), "xla:0");
        assert_eq!(model.get_world_size(), 1);

        let v = model.all_reduce(Value::Scalar(2.0), ReduceOp::Sum).unwrap();
        assert_eq!(v, Value::Scalar(2.0));

        assert!(pod::is_active());
        model.finalize().unwrap();
        assert!(!pod::is_active());
    }

    #[test]
    fn test_rejects_multi_node() {
        let config = LaunchConfig::default().with_num_nodes(2);
        let err = PodModel::create("xla-tpu", &config).unwrap_err();
        assert!(matches!(err, DistError::InvalidConfig(_)));

        let err = PodFactory
            .spawn("xla-tpu", 2, &config, &|_, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, DistError::InvalidConfig(_)));
    }

    #[test]
    fn test_spawned_topology() {
        PodFactory
            .spawn("xla-tpu", 4, &LaunchConfig::default(), &|i, model| {
                assert_eq!(model.get_rank(), i);
                assert_eq!(model.get_local_rank(), i);
                assert_eq!(model.get_world_size(), 4);
                assert_eq!(model.get_ntasks_per_node(), 4);
                assert_eq!(model.get_num_nodes(), 1);
                assert_eq!(model.device(), Device::Pod(i));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_create_from_context_without_core() {
        assert!(PodFactory.create_from_context(None).unwrap().is_none());
    }
}
