//! Default process group of the calling worker
//!
//! Each worker thread owns at most one group, the way a process owns one
//! default group in collective runtimes. Models created on that thread share it.

use crate::transport::{LocalTransport, Rendezvous, StarTransport, Transport};
use crate::{DistError, Result};
use std::cell::RefCell;
use tracing::{debug, info};

/// Backends implemented by the native group
pub const SUPPORTED_BACKENDS: &[&str] = &["nccl", "gloo"];

/// Initialized process group
#[derive(Debug)]
pub struct ProcessGroup {
    backend: String,
    rank: usize,
    world_size: usize,
    transport: Box<dyn Transport>,
}

impl ProcessGroup {
    /// Backend tag
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Global rank
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// World size
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Underlying transport
    pub fn transport(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }
}

thread_local! {
    static DEFAULT_GROUP: RefCell<Option<ProcessGroup>> = const { RefCell::new(None) };
}

/// Whether this worker has a default group
pub fn is_initialized() -> bool {
    DEFAULT_GROUP.with(|g| g.borrow().is_some())
}

/// Join the default group; blocks until every rank has joined
pub fn init_process_group(backend: &str, rendezvous: &Rendezvous) -> Result<()> {
    if !SUPPORTED_BACKENDS.contains(&backend) {
        return Err(DistError::UnknownBackend {
            backend: backend.to_string(),
            available: SUPPORTED_BACKENDS.to_vec(),
        });
    }
    if is_initialized() {
        return Err(DistError::AlreadyInitialized("default process group".into()));
    }

    let transport: Box<dyn Transport> = if rendezvous.world_size == 1 {
        Box::new(LocalTransport)
    } else {
        Box::new(StarTransport::connect(rendezvous)?)
    };

    info!(
        backend,
        rank = rendezvous.rank,
        world_size = rendezvous.world_size,
        "Process group initialized"
    );

    let group = ProcessGroup {
        backend: backend.to_string(),
        rank: rendezvous.rank,
        world_size: rendezvous.world_size,
        transport,
    };
    DEFAULT_GROUP.with(|g| *g.borrow_mut() = Some(group));
    Ok(())
}

/// Leave the default group. Returns whether a group was active.
pub fn destroy_process_group() -> Result<bool> {
    let group = DEFAULT_GROUP.with(|g| g.borrow_mut().take());
    match group {
        Some(mut group) => {
            group.transport.shutdown()?;
            debug!(rank = group.rank, "Process group destroyed");
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Run `f` against the default group
pub fn with_group<T>(f: impl FnOnce(&mut ProcessGroup) -> Result<T>) -> Result<T> {
    DEFAULT_GROUP.with(|g| match g.borrow_mut().as_mut() {
        Some(group) => f(group),
        None => Err(DistError::NotInitialized("default process group".into())),
    })
}

/// Backend of the default group
pub fn backend() -> Result<String> {
    with_group(|g| Ok(g.backend().to_string()))
}

/// Rank within the default group
pub fn rank() -> Result<usize> {
    with_group(|g| Ok(g.rank()))
}

/// Size of the default group
pub fn world_size() -> Result<usize> {
    with_group(|g| Ok(g.world_size()))
}
