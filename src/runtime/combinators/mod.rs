//! Combinators
//!
//! Higher-level operations composed from task cells: fan-in
//! ([`when_all`]), first-wins ([`when_any`], [`race`], [`timeout`]) and
//! adapters that turn foreign shapes of asynchrony into cells (step-based
//! coroutines, completion callbacks, tokio tasks and OS threads, polled
//! predicates).

pub mod callback;
pub mod coroutine;
pub mod native;
pub mod race;
pub mod timeout;
pub mod wait;
pub mod when_all;

pub use callback::{from_callback, from_callback_with_progress, Completer, Progress};
pub use coroutine::{coroutine_fn, Coroutine, CoroutineFn, CoroutineStep};
pub use native::{from_thread, from_tokio};
pub use race::{race, when_any};
pub use timeout::timeout;
pub use when_all::{when_all, when_all2, when_all3, when_all4};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::runtime::errors::Outcome;
use crate::runtime::task::{Dispatch, TaskCell};

/// Attach an inline observer to `cell`.
///
/// If the cell cannot take a continuation (one is already attached, or its
/// outcome was consumed) the observer sees the attach error as a failure.
pub(crate) fn observe<T, F>(
    cell: &TaskCell<T>,
    resume: F,
) where
    T: Send + 'static,
    F: FnOnce(Outcome<T>) + Send + 'static,
{
    let slot = Arc::new(Mutex::new(Some(resume)));
    let attached_slot = slot.clone();
    let attached = cell.attach_continuation(
        move |outcome| {
            let resume = attached_slot.lock().take();
            if let Some(resume) = resume {
                resume(outcome);
            }
        },
        Dispatch::Inline,
    );

    if let Err(error) = attached {
        let resume = slot.lock().take();
        if let Some(resume) = resume {
            resume(Outcome::Failed(error));
        }
    }
}
