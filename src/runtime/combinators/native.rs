//! Adapters for computations that already run elsewhere.
//!
//! Neither adapter spawns a thread. A tokio task is watched by a small
//! watcher task on the caller's runtime. An OS thread is polled once per
//! Update drain, since a std `JoinHandle` cannot notify on completion.

use std::thread::JoinHandle;

use tracing::trace;

use crate::runtime::errors::{TaskError, TaskResult};
use crate::runtime::scheduler::{Phase, PhaseScheduler};
use crate::runtime::task::TaskCell;

/// Adapt a tokio task.
///
/// An aborted task cancels the cell; a panicking one fails it with
/// [`TaskError::Panicked`].
pub fn from_tokio<T: Send + 'static>(
    runtime: &tokio::runtime::Handle,
    join: tokio::task::JoinHandle<T>,
) -> TaskCell<T> {
    let cell = TaskCell::new();
    cell.mark_running();
    let settle = cell.clone();
    runtime.spawn(async move {
        let settled = match join.await {
            Ok(value) => settle.complete(value),
            Err(error) if error.is_cancelled() => {
                settle.cancel();
                Ok(())
            }
            Err(error) if error.is_panic() => settle.fail_with(TaskError::from_panic(error.into_panic())),
            Err(error) => settle.fail(error),
        };
        if let Err(error) = settled {
            trace!("tokio result for {} not delivered: {}", settle.id(), error);
        }
    });
    cell
}

/// Adapt an OS thread. The thread is checked once per Update drain and
/// joined once it has finished.
///
/// [`JoinHandle`] offers no completion callback, so the only way to notice
/// the thread ending without blocking the host is to poll
/// [`JoinHandle::is_finished`]. The cell therefore settles in the first
/// Update drain after the thread returns, not at the moment it returns.
pub fn from_thread<T: Send + 'static>(
    scheduler: &PhaseScheduler,
    handle: JoinHandle<T>,
) -> TaskCell<T> {
    let mut handle = Some(handle);
    let cell = scheduler.poll_every(Phase::Update, move || -> Option<TaskResult<T>> {
        if !handle.as_ref()?.is_finished() {
            return None;
        }
        let finished = handle.take()?;
        Some(finished.join().map_err(TaskError::from_panic))
    });
    cell.mark_running();
    cell
}
