//! Task cells
//!
//! A [`TaskCell`] is the unit of suspended work: it stores the outcome of one
//! asynchronous operation and at most one continuation waiting for it.
//!
//! ```text
//! Pending ──► Running ──► Completed | Failed | Canceled
//!    └────────────────────────────────┘
//! ```
//!
//! States are monotonic. The first of `complete` / `fail` / `cancel` wins;
//! later `complete` / `fail` calls on a completed or failed cell are
//! [`TaskError::InvalidState`], on a canceled cell they are silently ignored
//! since completion racing cancellation is expected.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::runtime::cancel::{CancellationToken, Registration};
use crate::runtime::diagnostics::report_unobserved;
use crate::runtime::errors::{Outcome, TaskError, TaskResult};
use crate::runtime::scheduler::queue::ScheduledItem;
use crate::runtime::scheduler::{Phase, PhaseScheduler, Timing};

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Allocate the next process-wide task id.
    pub fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, not started.
    Pending,
    /// The operation is executing.
    Running,
    /// Finished with a value.
    Completed,
    /// Finished with an error.
    Failed,
    /// Canceled before finishing.
    Canceled,
}

impl TaskState {
    /// Whether no further transition is possible.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Canceled
        )
    }

    fn of<T>(outcome: &Outcome<T>) -> Self {
        match outcome {
            Outcome::Completed(_) => TaskState::Completed,
            Outcome::Failed(_) => TaskState::Failed,
            Outcome::Canceled => TaskState::Canceled,
        }
    }
}

/// Where a scheduled continuation resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeTarget {
    /// On the main thread, during the next drain of the phase.
    Phase(Phase),
    /// On the worker pool.
    ThreadPool,
}

/// How a stored continuation is invoked once its cell settles.
#[derive(Clone)]
pub enum Dispatch {
    /// Run on whichever context settles the cell.
    Inline,
    /// Hand to a scheduler.
    Scheduled {
        /// Scheduler that owns the target queue or pool.
        scheduler: PhaseScheduler,
        /// Phase or pool to resume on.
        target: ResumeTarget,
    },
}

impl Dispatch {
    /// Resume during the next drain of `phase`.
    pub fn phase(
        scheduler: &PhaseScheduler,
        phase: Phase,
    ) -> Self {
        Dispatch::Scheduled {
            scheduler: scheduler.clone(),
            target: ResumeTarget::Phase(phase),
        }
    }

    /// Resume on the scheduler's worker pool.
    pub fn thread_pool(scheduler: &PhaseScheduler) -> Self {
        Dispatch::Scheduled {
            scheduler: scheduler.clone(),
            target: ResumeTarget::ThreadPool,
        }
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Dispatch::Inline => f.write_str("Inline"),
            Dispatch::Scheduled { target, .. } => write!(f, "Scheduled({:?})", target),
        }
    }
}

type Resume<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

struct Continuation<T> {
    resume: Resume<T>,
    dispatch: Dispatch,
}

impl<T: Send + 'static> Continuation<T> {
    fn invoke(
        self,
        outcome: Outcome<T>,
    ) {
        let Continuation { resume, dispatch } = self;
        match dispatch {
            Dispatch::Inline => resume(outcome),
            Dispatch::Scheduled { scheduler, target } => {
                let item = ScheduledItem::new(move || resume(outcome));
                match target {
                    ResumeTarget::Phase(phase) => scheduler.schedule(Timing::Phase(phase), item),
                    ResumeTarget::ThreadPool => scheduler.schedule_on_pool(item),
                }
            }
        }
    }
}

struct CellState<T> {
    state: TaskState,
    /// Present while terminal and not yet handed to anyone.
    outcome: Option<Outcome<T>>,
    /// Present only while pending or running.
    continuation: Option<Continuation<T>>,
    consumed: bool,
    registration: Option<Registration>,
}

struct CellInner<T> {
    id: TaskId,
    state: Mutex<CellState<T>>,
}

impl<T> Drop for CellInner<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(registration) = state.registration.take() {
            registration.dispose();
        }
        if let Some(Outcome::Failed(error)) = state.outcome.take() {
            report_unobserved(TaskError::UnobservedFailure {
                task: self.id,
                cause: Box::new(error),
            });
        }
    }
}

/// Handle to a task cell.
///
/// Handles are cheap to clone; all clones refer to the same cell. The
/// outcome is handed out exactly once, either to the attached continuation
/// or to [`TaskCell::try_take_outcome`]. Awaiting a handle (it implements
/// `IntoFuture`) consumes the outcome the same way.
pub struct TaskCell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Clone for TaskCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for TaskCell<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskCell")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.lock().state)
            .finish()
    }
}

impl<T: Send + 'static> Default for TaskCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> TaskCell<T> {
    /// Create a pending cell.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CellInner {
                id: TaskId::next(),
                state: Mutex::new(CellState {
                    state: TaskState::Pending,
                    outcome: None,
                    continuation: None,
                    consumed: false,
                    registration: None,
                }),
            }),
        }
    }

    /// Create a cell that already holds `outcome`.
    pub fn from_outcome(outcome: Outcome<T>) -> Self {
        let cell = Self::new();
        cell.settle(outcome);
        cell
    }

    /// Create a completed cell.
    pub fn completed(value: T) -> Self {
        Self::from_outcome(Outcome::Completed(value))
    }

    /// Create a failed cell.
    pub fn failed(error: impl Into<anyhow::Error>) -> Self {
        Self::from_outcome(Outcome::Failed(TaskError::failed(error)))
    }

    /// Create a canceled cell.
    pub fn canceled() -> Self {
        Self::from_outcome(Outcome::Canceled)
    }

    /// Get the cell id.
    #[inline]
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Get the current state.
    #[inline]
    pub fn state(&self) -> TaskState {
        self.inner.state.lock().state
    }

    /// Whether the cell reached a terminal state.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether the cell was canceled.
    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.state() == TaskState::Canceled
    }

    /// Whether two handles refer to the same cell.
    pub fn ptr_eq(
        &self,
        other: &TaskCell<T>,
    ) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Move a pending cell to `Running`. No-op in any other state.
    pub fn mark_running(&self) {
        let mut state = self.inner.state.lock();
        if state.state == TaskState::Pending {
            state.state = TaskState::Running;
        }
    }

    /// Complete the cell with a value.
    pub fn complete(
        &self,
        value: T,
    ) -> TaskResult<()> {
        self.settle_checked(Outcome::Completed(value))
    }

    /// Fail the cell with an operation error.
    pub fn fail(
        &self,
        error: impl Into<anyhow::Error>,
    ) -> TaskResult<()> {
        self.fail_with(TaskError::failed(error))
    }

    /// Fail the cell with a runtime error.
    ///
    /// [`TaskError::Canceled`] is routed to [`TaskCell::cancel`] so that
    /// cancellation is never recorded as a failure.
    pub fn fail_with(
        &self,
        error: TaskError,
    ) -> TaskResult<()> {
        if error.is_canceled() {
            self.cancel();
            return Ok(());
        }
        self.settle_checked(Outcome::Failed(error))
    }

    /// Settle the cell from a result.
    pub fn set_result(
        &self,
        result: TaskResult<T>,
    ) -> TaskResult<()> {
        match result {
            Ok(value) => self.complete(value),
            Err(error) => self.fail_with(error),
        }
    }

    /// Settle the cell from another cell's outcome.
    pub fn set_outcome(
        &self,
        outcome: Outcome<T>,
    ) -> TaskResult<()> {
        match outcome {
            Outcome::Completed(value) => self.complete(value),
            Outcome::Failed(error) => self.fail_with(error),
            Outcome::Canceled => {
                self.cancel();
                Ok(())
            }
        }
    }

    /// Cancel the cell.
    ///
    /// Returns `true` if this call moved the cell to `Canceled`.
    pub fn cancel(&self) -> bool {
        self.settle(Outcome::Canceled).is_none()
    }

    /// Attach the single continuation.
    ///
    /// If the cell is already terminal, `resume` runs synchronously on the
    /// caller with the stored outcome regardless of `dispatch`. If the bound
    /// cancellation source was already requested, the cell is canceled first
    /// and `resume` sees [`Outcome::Canceled`].
    pub fn attach_continuation<F>(
        &self,
        resume: F,
        dispatch: Dispatch,
    ) -> TaskResult<()>
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let source_requested = {
            let state = self.inner.state.lock();
            !state.state.is_terminal()
                && state
                    .registration
                    .as_ref()
                    .is_some_and(Registration::is_requested)
        };
        if source_requested {
            self.cancel();
        }

        let mut state = self.inner.state.lock();
        if state.continuation.is_some() {
            return Err(TaskError::invalid_state(format!(
                "{} already has a continuation",
                self.inner.id
            )));
        }
        if state.consumed {
            return Err(TaskError::invalid_state(format!(
                "{} outcome was already consumed",
                self.inner.id
            )));
        }

        match state.outcome.take() {
            Some(outcome) => {
                state.consumed = true;
                drop(state);
                resume(outcome);
            }
            None => {
                state.continuation = Some(Continuation {
                    resume: Box::new(resume),
                    dispatch,
                });
            }
        }
        Ok(())
    }

    /// Take the outcome if the cell is terminal and nobody consumed it yet.
    pub fn try_take_outcome(&self) -> Option<Outcome<T>> {
        let mut state = self.inner.state.lock();
        let outcome = state.outcome.take();
        if outcome.is_some() {
            state.consumed = true;
        }
        outcome
    }

    /// Observe a cancellation token.
    ///
    /// A cell observes at most one source; binding again releases the
    /// previous registration. Binding to a requested token cancels the cell
    /// immediately.
    pub fn bind_cancellation(
        &self,
        token: &CancellationToken,
    ) {
        if !token.can_be_canceled() || self.is_terminal() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let registration = token.register(move || {
            if let Some(inner) = weak.upgrade() {
                TaskCell { inner }.cancel();
            }
        });

        let stale = {
            let mut state = self.inner.state.lock();
            if state.state.is_terminal() {
                Some(registration)
            } else {
                state.registration.replace(registration)
            }
        };
        if let Some(stale) = stale {
            stale.dispose();
        }
    }

    /// Builder form of [`TaskCell::bind_cancellation`].
    pub fn with_cancellation(
        self,
        token: &CancellationToken,
    ) -> Self {
        self.bind_cancellation(token);
        self
    }

    /// Detach the cell: nobody will await it.
    ///
    /// A value is dropped when it arrives; a failure is reported as
    /// [`TaskError::UnobservedFailure`] through the diagnostics policy.
    pub fn forget(self) {
        let id = self.inner.id;
        let attached = self.attach_continuation(
            move |outcome| {
                if let Outcome::Failed(error) = outcome {
                    report_unobserved(TaskError::UnobservedFailure {
                        task: id,
                        cause: Box::new(error),
                    });
                }
            },
            Dispatch::Inline,
        );
        if let Err(error) = attached {
            tracing::debug!("{} not detached: {}", id, error);
        }
    }

    fn settle_checked(
        &self,
        outcome: Outcome<T>,
    ) -> TaskResult<()> {
        match self.settle(outcome) {
            None | Some(TaskState::Canceled) => Ok(()),
            Some(state) => Err(TaskError::invalid_state(format!(
                "{} is already {:?}",
                self.inner.id, state
            ))),
        }
    }

    /// Returns the previous state if the cell was already terminal.
    fn settle(
        &self,
        outcome: Outcome<T>,
    ) -> Option<TaskState> {
        let (continuation, registration, outcome) = {
            let mut state = self.inner.state.lock();
            if state.state.is_terminal() {
                return Some(state.state);
            }
            state.state = TaskState::of(&outcome);
            let registration = state.registration.take();
            match state.continuation.take() {
                Some(continuation) => {
                    state.consumed = true;
                    (Some(continuation), registration, Some(outcome))
                }
                None => {
                    state.outcome = Some(outcome);
                    (None, registration, None)
                }
            }
        };

        if let Some(registration) = registration {
            registration.dispose();
        }
        if let (Some(continuation), Some(outcome)) = (continuation, outcome) {
            continuation.invoke(outcome);
        }
        None
    }
}
