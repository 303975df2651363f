//! Worker launcher
//!
//! Runs one worker per local rank on scoped threads and joins them all.

use crate::error::BoxError;
use crate::{DistError, Result};
use crossbeam::channel::{self, Receiver};
use std::any::Any;
use std::thread;
use tracing::{debug, warn};

/// Outcome of one worker
pub type WorkerResult = std::result::Result<(), BoxError>;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Block until the launcher releases the worker; fails if the launch was abandoned
fn wait_for_start(start: &Receiver<()>) -> Result<()> {
    start
        .recv()
        .map_err(|_| DistError::Comm("worker launch aborted".into()))
}

/// Run `worker(local_rank)` for every local rank in `0..num_workers`.
///
/// No worker starts before all threads are spawned, so a failed spawn never
/// leaves earlier workers waiting in a rendezvous. Waits for every worker,
/// then reports the failure of the lowest local rank, if any.
pub fn run<F>(num_workers: usize, worker: F) -> Result<()>
where
    F: Fn(usize) -> WorkerResult + Sync,
{
    if num_workers == 0 {
        return Err(DistError::InvalidConfig(
            "number of workers must be >= 1".into(),
        ));
    }

    debug!(num_workers, "Launching workers");
    let worker = &worker;

    let outcomes: Vec<Result<()>> = thread::scope(|scope| {
        let (go, start) = channel::unbounded::<()>();
        let mut handles = Vec::with_capacity(num_workers);
        for local_rank in 0..num_workers {
            let start = start.clone();
            let handle = thread::Builder::new()
                .name(format!("haagenti-worker-{}", local_rank))
                .spawn_scoped(scope, move || {
                    wait_for_start(&start)?;
                    worker(local_rank)
                })?;
            handles.push((local_rank, handle));
        }
        for _ in 0..num_workers {
            go.send(())
                .map_err(|_| DistError::Comm("workers exited before start".into()))?;
        }

        Ok::<_, DistError>(
            handles
                .into_iter()
                .map(|(local_rank, handle)| match handle.join() {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        warn!(local_rank, error = %e, "Worker failed");
                        Err(DistError::WorkerFailed {
                            local_rank,
                            reason: e.to_string(),
                        })
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        warn!(local_rank, %message, "Worker panicked");
                        Err(DistError::WorkerPanicked {
                            local_rank,
                            message,
                        })
                    }
                })
                .collect(),
        )
    })?;

    outcomes.into_iter().collect::<Result<Vec<()>>>()?;
    debug!(num_workers, "All workers finished");
    Ok(())
}
