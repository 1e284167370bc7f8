//! Polled waits.
//!
//! Predicates and selectors run on the main thread, once per drain of the
//! chosen phase, starting with the next one.

use std::sync::{Arc, Weak};

use crate::runtime::errors::TaskError;
use crate::runtime::scheduler::{Phase, PhaseScheduler};
use crate::runtime::task::TaskCell;

impl PhaseScheduler {
    /// Completes once `predicate` returns `true`.
    pub fn wait_until<F>(
        &self,
        mut predicate: F,
        phase: Phase,
    ) -> TaskCell<()>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.poll_every(phase, move || predicate().then_some(Ok(())))
    }

    /// Completes once `predicate` returns `false`.
    pub fn wait_while<F>(
        &self,
        mut predicate: F,
        phase: Phase,
    ) -> TaskCell<()>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.wait_until(move || !predicate(), phase)
    }

    /// Completes with the new value once `selector(target)` differs from
    /// its value at the time of this call.
    ///
    /// Only a weak reference to `target` is kept; the cell is canceled if
    /// the target is dropped first.
    pub fn wait_until_value_changed<S, V, F>(
        &self,
        target: &Arc<S>,
        mut selector: F,
        phase: Phase,
    ) -> TaskCell<V>
    where
        S: Send + Sync + 'static,
        V: PartialEq + Send + 'static,
        F: FnMut(&S) -> V + Send + 'static,
    {
        let initial = selector(&**target);
        let target: Weak<S> = Arc::downgrade(target);
        self.poll_every(phase, move || {
            let Some(target) = target.upgrade() else {
                return Some(Err(TaskError::Canceled));
            };
            let current = selector(&*target);
            (current != initial).then_some(Ok(current))
        })
    }
}
