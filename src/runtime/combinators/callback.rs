//! Callback and progress adapters
//!
//! Turns a "call me back when done" API into a task cell. The API receives
//! a [`Completer`] and settles the cell through it; an optional
//! [`Progress`] routes intermediate reports to an observer without touching
//! the cell's terminal state.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::anyhow;
use tracing::debug;

use crate::runtime::errors::{TaskError, TaskResult};
use crate::runtime::task::TaskCell;

/// One-shot settle handle given to a callback-based API.
///
/// Dropping a completer without settling fails the cell.
pub struct Completer<T: Send + 'static> {
    cell: Option<TaskCell<T>>,
}

impl<T: Send + 'static> fmt::Debug for Completer<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Completer")
            .field("cell", &self.cell.as_ref().map(TaskCell::id))
            .finish()
    }
}

impl<T: Send + 'static> Completer<T> {
    fn new(cell: TaskCell<T>) -> Self {
        Self { cell: Some(cell) }
    }

    /// Whether the cell was canceled, so the result will be discarded.
    pub fn is_canceled(&self) -> bool {
        self.cell.as_ref().is_some_and(TaskCell::is_canceled)
    }

    /// Complete the cell.
    pub fn complete(
        self,
        value: T,
    ) -> TaskResult<()> {
        self.set_result(Ok(value))
    }

    /// Fail the cell with an operation error.
    pub fn fail(
        self,
        error: impl Into<anyhow::Error>,
    ) -> TaskResult<()> {
        self.set_result(Err(TaskError::failed(error)))
    }

    /// Cancel the cell.
    pub fn cancel(self) {
        let _ = self.set_result(Err(TaskError::Canceled));
    }

    /// Settle the cell from a result.
    pub fn set_result(
        mut self,
        result: TaskResult<T>,
    ) -> TaskResult<()> {
        match self.cell.take() {
            Some(cell) => cell.set_result(result),
            None => Ok(()),
        }
    }
}

impl<T: Send + 'static> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            debug!("Completer for {} dropped without a result", cell.id());
            let _ = cell.fail(anyhow!("completion callback dropped without a result"));
        }
    }
}

type ProgressHandler<P> = Arc<dyn Fn(P) + Send + Sync>;
type Liveness = Arc<dyn Fn() -> bool + Send + Sync>;

/// Progress observer.
pub struct Progress<P> {
    handler: ProgressHandler<P>,
    live: Option<Liveness>,
}

impl<P> Clone for Progress<P> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            live: self.live.clone(),
        }
    }
}

impl<P> fmt::Debug for Progress<P> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Progress")
            .field("active", &self.is_active())
            .finish()
    }
}

impl<P> Progress<P> {
    /// Observer that forwards every report to `handler`.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(P) + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            live: None,
        }
    }

    fn tied_to<T: Send + 'static>(
        handler: ProgressHandler<P>,
        cell: &TaskCell<T>,
    ) -> Self {
        let cell = cell.clone();
        Self {
            handler,
            live: Some(Arc::new(move || !cell.is_terminal())),
        }
    }

    /// Whether reports are still delivered.
    pub fn is_active(&self) -> bool {
        self.live.as_ref().map_or(true, |live| live())
    }

    /// Report progress. Ignored once the owning operation has settled.
    pub fn report(
        &self,
        value: P,
    ) {
        if self.is_active() {
            (self.handler)(value);
        }
    }
}

/// Adapt a callback-based operation.
///
/// `start` runs synchronously and receives the completer. A panic in
/// `start` fails the cell.
pub fn from_callback<T, F>(start: F) -> TaskCell<T>
where
    T: Send + 'static,
    F: FnOnce(Completer<T>),
{
    let cell = TaskCell::new();
    cell.mark_running();
    let completer = Completer::new(cell.clone());
    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || start(completer))) {
        let _ = cell.fail_with(TaskError::from_panic(payload));
    }
    cell
}

/// Adapt a callback-based operation that also reports progress.
///
/// Reports reach `on_progress` until the cell settles.
pub fn from_callback_with_progress<T, P, H, F>(
    on_progress: H,
    start: F,
) -> TaskCell<T>
where
    T: Send + 'static,
    H: Fn(P) + Send + Sync + 'static,
    F: FnOnce(Completer<T>, Progress<P>),
{
    let cell = TaskCell::new();
    cell.mark_running();
    let progress = Progress::tied_to(Arc::new(on_progress), &cell);
    let completer = Completer::new(cell.clone());
    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || start(completer, progress))) {
        let _ = cell.fail_with(TaskError::from_panic(payload));
    }
    cell
}
