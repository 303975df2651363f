//! Serial model: one process, no communication

use super::{ComputationModel, ModelFactory};
use crate::config::LaunchConfig;
use crate::device::Device;
use crate::topology::Topology;
use crate::value::{Buffer, ReduceOp, Value};
use crate::{DistError, Result};

/// Single-process model
#[derive(Debug, Clone, Default)]
pub struct SerialModel {
    topology: Topology,
}

impl SerialModel {
    pub const NAME: &'static str = "serial";

    pub fn new() -> Self {
        Self::default()
    }
}

impl ComputationModel for SerialModel {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn backend(&self) -> Option<&str> {
        None
    }

    fn device(&self) -> Device {
        Device::Cpu
    }

    fn topology(&self) -> &Topology {
        &self.topology
    }

    fn all_reduce(&mut self, value: Value, _op: ReduceOp) -> Result<Value> {
        Ok(value)
    }

    fn all_gather(&mut self, value: Value) -> Result<Buffer> {
        Buffer::concat(&[value.into_buffer()])
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Factory of the serial model; it never owns a backend
#[derive(Debug, Default)]
pub struct SerialFactory;

impl ModelFactory for SerialFactory {
    fn name(&self) -> &'static str {
        SerialModel::NAME
    }

    fn available_backends(&self) -> &'static [&'static str] {
        &[]
    }

    fn create_from_context(
        &self,
        _local_rank_hint: Option<usize>,
    ) -> Result<Option<Box<dyn ComputationModel>>> {
        Ok(Some(Box::new(SerialModel::new())))
    }

    fn create(&self, backend: &str, _config: &LaunchConfig) -> Result<Box<dyn ComputationModel>> {
        Err(DistError::UnknownBackend {
            backend: backend.to_string(),
            available: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_queries() {
        let model = SerialModel::new();
        assert_eq!(model.name(), "serial");
        assert_eq!(model.backend(), None);
        assert_eq!(model.device(), Device::Cpu);
        assert_eq!(model.get_world_size(), 1);
        assert_eq!(model.get_rank(), 0);
        assert_eq!(model.get_local_rank(), 0);
        assert_eq!(model.get_ntasks_per_node(), 1);
        assert_eq!(model.get_num_nodes(), 1);
        assert_eq!(model.get_node_rank(), 0);
    }

    #[test]
    fn test_serial_collectives() {
        let mut model = SerialModel::new();
        let v = model.all_reduce(Value::Scalar(7.5), ReduceOp::Min).unwrap();
        assert_eq!(v, Value::Scalar(7.5));

        let b = Buffer::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
        let gathered = model.all_gather(Value::Buffer(b.clone())).unwrap();
        assert_eq!(gathered, b);

        let gathered = model.all_gather(Value::Scalar(3.0)).unwrap();
        assert_eq!(gathered.shape(), &[1]);
        assert_eq!(gathered.data(), &[3.0]);
    }

    #[test]
    fn test_serial_factory() {
        let factory = SerialFactory;
        assert!(factory.available_backends().is_empty());
        assert!(!factory.supports("gloo"));
        assert!(factory.create("gloo", &LaunchConfig::default()).is_err());
        let model = factory.create_from_context(None).unwrap().unwrap();
        assert_eq!(model.name(), "serial");
        assert!(factory
            .spawn("gloo", 2, &LaunchConfig::default(), &|_, _| Ok(()))
            .is_err());
    }
}
