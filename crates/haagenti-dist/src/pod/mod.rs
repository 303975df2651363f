//! In-process accelerator pod runtime
//!
//! A pod is a ring of cores, one per worker thread, linked by channels.
//! The core bound to the calling thread is the thread's "current" core.

mod ring;

use crate::launcher::{self, WorkerResult};
use crate::value::Buffer;
use crate::{DistError, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::cell::RefCell;
use std::sync::Mutex;
use tracing::{debug, info};

/// One core of a pod ring
#[derive(Debug)]
pub struct PodCore {
    ordinal: usize,
    world_size: usize,
    /// Receive from `ordinal - 1`
    left: Receiver<Buffer>,
    /// Send to `ordinal + 1`
    right: Sender<Buffer>,
}

impl PodCore {
    fn new(ordinal: usize, world_size: usize, left: Receiver<Buffer>, right: Sender<Buffer>) -> Self {
        Self {
            ordinal,
            world_size,
            left,
            right,
        }
    }

    /// Ordinal within the pod
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Number of cores in the pod
    pub fn world_size(&self) -> usize {
        self.world_size
    }
}

thread_local! {
    static CURRENT_CORE: RefCell<Option<PodCore>> = const { RefCell::new(None) };
}

/// Whether a core is bound to this thread
pub fn is_active() -> bool {
    CURRENT_CORE.with(|c| c.borrow().is_some())
}

/// Ordinal of the current core
pub fn ordinal() -> Result<usize> {
    with_core(|core| Ok(core.ordinal()))
}

/// Size of the current pod
pub fn world_size() -> Result<usize> {
    with_core(|core| Ok(core.world_size()))
}

/// Run `f` against the current core
pub fn with_core<T>(f: impl FnOnce(&mut PodCore) -> Result<T>) -> Result<T> {
    CURRENT_CORE.with(|c| match c.borrow_mut().as_mut() {
        Some(core) => f(core),
        None => Err(DistError::NotInitialized("pod core".into())),
    })
}

fn install(core: PodCore) -> Result<()> {
    CURRENT_CORE.with(|c| {
        let mut slot = c.borrow_mut();
        if slot.is_some() {
            return Err(DistError::AlreadyInitialized("pod core".into()));
        }
        *slot = Some(core);
        Ok(())
    })
}

/// Unbind the current core. Returns whether one was bound.
pub fn release() -> bool {
    let released = CURRENT_CORE.with(|c| c.borrow_mut().take());
    if let Some(core) = &released {
        debug!(ordinal = core.ordinal, "Pod core released");
    }
    released.is_some()
}

/// Bind a one-core pod to this thread
pub fn open_single_core() -> Result<()> {
    let (tx, rx) = unbounded();
    install(PodCore::new(0, 1, rx, tx))?;
    debug!("Single-core pod opened");
    Ok(())
}

/// Run `worker(ordinal)` on every core of a new `num_cores` pod.
///
/// Each worker thread has its core bound for the duration of the call.
pub fn launch<F>(num_cores: usize, worker: F) -> Result<()>
where
    F: Fn(usize) -> WorkerResult + Sync,
{
    if num_cores == 0 {
        return Err(DistError::InvalidConfig("pod needs at least one core".into()));
    }

    let (txs, mut rxs): (Vec<Sender<Buffer>>, Vec<Receiver<Buffer>>) =
        (0..num_cores).map(|_| unbounded()).unzip();
    // core i reads the channel core i - 1 writes to
    rxs.rotate_right(1);

    // Each core holds the only handles to its channel ends, so a core that
    // exits early disconnects its neighbors instead of stalling them.
    let slots: Vec<Mutex<Option<PodCore>>> = txs
        .into_iter()
        .zip(rxs)
        .enumerate()
        .map(|(ordinal, (right, left))| {
            Mutex::new(Some(PodCore::new(ordinal, num_cores, left, right)))
        })
        .collect();

    info!(num_cores, "Launching pod");
    launcher::run(num_cores, |ordinal| {
        let core = slots[ordinal]
            .lock()
            .map_err(|_| DistError::Comm(format!("core {} slot poisoned", ordinal)))?
            .take()
            .ok_or_else(|| DistError::AlreadyInitialized(format!("pod core {}", ordinal)))?;
        install(core)?;
        let outcome = worker(ordinal);
        release();
        outcome
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use crate::value::ReduceOp;

    #[test]
    fn test_single_core() {
        assert!(!is_active());
        open_single_core().unwrap();
        assert!(is_active());
        assert_eq!(ordinal().unwrap(), 0);
        assert_eq!(world_size().unwrap(), 1);
        assert!(matches!(
            open_single_core(),
            Err(DistError::AlreadyInitialized(_))
        ));

        let mut data = vec![2.0, 3.0];
        with_core(|core| core.all_reduce(&mut data, ReduceOp::Product)).unwrap();
        assert_eq!(data, vec![2.0, 3.0]);

        assert!(release());
        assert!(!release());
        assert!(matches!(ordinal(), Err(DistError::NotInitialized(_))));
    }

    #[test]
    fn test_launch_binds_cores() {
        launch(3, |i| {
            assert_eq!(ordinal()?, i);
            assert_eq!(world_size()?, 3);
            Ok(())
        })
        .unwrap();
        assert!(!is_active());
    }

    #[test]
    fn test_launch_zero_cores() {
        assert!(launch(0, |_| Ok(())).is_err());
    }
}
