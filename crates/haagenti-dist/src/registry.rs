//! Registry of computation model factories

use crate::model::{ComputationModel, ModelFactory, SerialFactory, SerialModel};
use crate::{DistError, Result};
use std::sync::Arc;
use tracing::debug;

/// Ordered list of model factories.
///
/// The serial factory comes first; detection and backend lookup walk the
/// list in registration order.
#[derive(Debug, Clone)]
pub struct Registry {
    factories: Vec<Arc<dyn ModelFactory>>,
}

impl Registry {
    /// Registry with only the serial model
    pub fn serial_only() -> Self {
        Self {
            factories: vec![Arc::new(SerialFactory)],
        }
    }

    /// Append a factory
    pub fn register(&mut self, factory: Arc<dyn ModelFactory>) {
        debug!(model = factory.name(), "Registered computation model");
        self.factories.push(factory);
    }

    /// Builder form of [`register`](Self::register)
    pub fn with_factory(mut self, factory: Arc<dyn ModelFactory>) -> Self {
        self.register(factory);
        self
    }

    /// Registered factories, in order
    pub fn factories(&self) -> &[Arc<dyn ModelFactory>] {
        &self.factories
    }

    /// Names of the registered models, in order
    pub fn model_names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.name()).collect()
    }

    /// Union of every factory's backends, first occurrence wins
    pub fn available_backends(&self) -> Vec<&'static str> {
        let mut backends: Vec<&'static str> = Vec::new();
        for backend in self.factories.iter().flat_map(|f| f.available_backends()) {
            if !backends.contains(backend) {
                backends.push(*backend);
            }
        }
        backends
    }

    /// Whether any non-serial model is registered
    pub fn has_distributed_models(&self) -> bool {
        self.factories.iter().any(|f| f.name() != SerialModel::NAME)
    }

    /// Fail with the list of valid backends if `backend` is unknown
    pub fn assert_backend(&self, backend: &str) -> Result<()> {
        if self.factory_for(backend).is_some() {
            Ok(())
        } else {
            Err(DistError::UnknownBackend {
                backend: backend.to_string(),
                available: self.available_backends(),
            })
        }
    }

    /// First factory accepting `backend`
    pub fn factory_for(&self, backend: &str) -> Option<&Arc<dyn ModelFactory>> {
        self.factories.iter().find(|f| f.supports(backend))
    }

    /// Adopt the first active runtime found, falling back to the serial model
    pub fn resolve(&self, local_rank_hint: Option<usize>) -> Result<Box<dyn ComputationModel>> {
        for factory in &self.factories {
            if factory.name() == SerialModel::NAME {
                continue;
            }
            if let Some(model) = factory.create_from_context(local_rank_hint)? {
                debug!(model = model.name(), "Adopted active computation model");
                return Ok(model);
            }
        }
        Ok(Box::new(SerialModel::new()))
    }
}

impl Default for Registry {
    /// Serial plus every model enabled at build time
    fn default() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::serial_only();
        #[cfg(feature = "native")]
        registry.register(Arc::new(crate::model::NativeFactory));
        #[cfg(feature = "pod")]
        registry.register(Arc::new(crate::model::PodFactory));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaunchConfig;
    use crate::model::{NativeFactory, PodFactory};

    fn full() -> Registry {
        Registry::serial_only()
            .with_factory(Arc::new(NativeFactory))
            .with_factory(Arc::new(PodFactory))
    }

    #[test]
    fn test_available_backends_order() {
        assert_eq!(full().available_backends(), vec!["nccl", "gloo", "xla-tpu"]);
        assert!(Registry::serial_only().available_backends().is_empty());
        assert_eq!(full().model_names(), vec!["serial", "native-dist", "xla-dist"]);
    }

    #[test]
    fn test_duplicate_backends_listed_once() {
        let registry = full().with_factory(Arc::new(NativeFactory));
        assert_eq!(registry.available_backends(), vec!["nccl", "gloo", "xla-tpu"]);
    }

    #[test]
    fn test_assert_backend() {
        let registry = full();
        assert!(registry.assert_backend("gloo").is_ok());
        match registry.assert_backend("mpi").unwrap_err() {
            DistError::UnknownBackend { backend, available } => {
                assert_eq!(backend, "mpi");
                assert_eq!(available, vec!["nccl", "gloo", "xla-tpu"]);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(registry.factory_for("xla-tpu").unwrap().name(), "xla-dist");
    }

    #[test]
    fn test_resolve_without_runtime_is_serial() {
        let model = full().resolve(None).unwrap();
        assert_eq!(model.name(), "serial");
        assert!(full().has_distributed_models());
        assert!(!Registry::serial_only().has_distributed_models());
    }

    #[test]
    fn test_resolve_adopts_pod_core() {
        let registry = full();
        let mut owned = registry
            .factory_for("xla-tpu")
            .unwrap()
            .create("xla-tpu", &LaunchConfig::default())
            .unwrap();

        let adopted = registry.resolve(None).unwrap();
        assert_eq!(adopted.name(), "xla-dist");
        owned.finalize().unwrap();
    }
}
