//! Runtime errors and task outcomes

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::runtime::task::TaskId;

/// Shared failure cause carried by [`TaskError::OperationFailed`].
///
/// Causes are reference counted so an aggregated outcome (for example the
/// result of `when_all`) can hand the original cause to its own awaiter.
#[derive(Clone)]
pub struct Cause(Arc<anyhow::Error>);

impl Cause {
    /// Wrap an error as a shared cause.
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(error.into()))
    }

    /// Borrow the underlying error.
    #[inline]
    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }

    /// Try to downcast the underlying error.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Whether two causes are the same shared error.
    pub fn ptr_eq(
        &self,
        other: &Cause,
    ) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Cause {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Cause {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

/// Runtime result
pub type TaskResult<T> = Result<T, TaskError>;

/// Runtime errors
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// API misuse, e.g. completing a cell that is already terminal.
    #[error("Invalid task state: {0}")]
    InvalidState(String),

    /// The wrapped asynchronous operation reported an error.
    #[error("Operation failed: {0}")]
    OperationFailed(Cause),

    /// The operation was canceled.
    ///
    /// Only produced when a caller asks for cancellation to be treated as an
    /// error; otherwise cancellation is [`Outcome::Canceled`].
    #[error("Operation canceled")]
    Canceled,

    /// A detached task failed and nobody consumed the outcome.
    #[error("Unobserved failure in {task}: {cause}")]
    UnobservedFailure {
        /// The task that failed.
        task: TaskId,
        /// The failure that went unobserved.
        cause: Box<TaskError>,
    },

    /// A continuation panicked while it was being resumed.
    #[error("Continuation panicked: {0}")]
    Panicked(String),

    /// A timeout elapsed before the awaited cell reached a terminal state.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl TaskError {
    /// Wrap an arbitrary error as an operation failure.
    pub fn failed(error: impl Into<anyhow::Error>) -> Self {
        TaskError::OperationFailed(Cause::new(error))
    }

    /// Build an invalid-state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        TaskError::InvalidState(message.into())
    }

    /// Build a panic error from a `catch_unwind` payload.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        TaskError::Panicked(panic_message(payload.as_ref()))
    }

    /// The operation cause, if this is an operation failure.
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            TaskError::OperationFailed(cause) => Some(cause),
            TaskError::UnobservedFailure { cause, .. } => cause.cause(),
            _ => None,
        }
    }

    /// Whether this error stands for cancellation.
    #[inline]
    pub fn is_canceled(&self) -> bool {
        matches!(self, TaskError::Canceled)
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Terminal outcome of a task cell.
///
/// Cancellation is a distinct outcome, not an error. Use
/// [`Outcome::into_result`] to treat it as one, or
/// [`Outcome::suppress_cancel`] to keep it separate from failures.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// The operation produced a value.
    Completed(T),
    /// The operation failed.
    Failed(TaskError),
    /// The operation was canceled.
    Canceled,
}

impl<T> Outcome<T> {
    /// Whether the outcome is a value.
    #[inline]
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    /// Whether the outcome is a failure.
    #[inline]
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// Whether the outcome is a cancellation.
    #[inline]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Outcome::Canceled)
    }

    /// Convert to a result, treating cancellation as [`TaskError::Canceled`].
    pub fn into_result(self) -> TaskResult<T> {
        match self {
            Outcome::Completed(value) => Ok(value),
            Outcome::Failed(error) => Err(error),
            Outcome::Canceled => Err(TaskError::Canceled),
        }
    }

    /// Convert to a result where cancellation is `Ok(None)`.
    ///
    /// Failures still surface as `Err` carrying the original cause.
    pub fn suppress_cancel(self) -> TaskResult<Option<T>> {
        match self {
            Outcome::Completed(value) => Ok(Some(value)),
            Outcome::Failed(error) => Err(error),
            Outcome::Canceled => Ok(None),
        }
    }

    /// The value, if completed.
    pub fn ok(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// The failure, if failed.
    pub fn err(&self) -> Option<&TaskError> {
        match self {
            Outcome::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// Map the completed value.
    pub fn map<U, F: FnOnce(T) -> U>(
        self,
        f: F,
    ) -> Outcome<U> {
        match self {
            Outcome::Completed(value) => Outcome::Completed(f(value)),
            Outcome::Failed(error) => Outcome::Failed(error),
            Outcome::Canceled => Outcome::Canceled,
        }
    }
}

impl<T> From<TaskResult<T>> for Outcome<T> {
    fn from(result: TaskResult<T>) -> Self {
        match result {
            Ok(value) => Outcome::Completed(value),
            Err(TaskError::Canceled) => Outcome::Canceled,
            Err(error) => Outcome::Failed(error),
        }
    }
}
