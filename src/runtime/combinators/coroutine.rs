//! Step-based coroutines
//!
//! A [`Coroutine`] is an explicit state machine: each call to
//! [`Coroutine::resume`] runs one step and says how long to wait before the
//! next. The scheduler drives it and exposes it as a `TaskCell<()>` that
//! completes when the routine reports [`CoroutineStep::Done`].
//!
//! The first step runs synchronously inside `start_coroutine`.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::trace;

use crate::runtime::cancel::CancellationToken;
use crate::runtime::errors::{Outcome, TaskError};
use crate::runtime::scheduler::{Phase, PhaseScheduler, ScheduledItem, Timing, WeakScheduler};
use crate::runtime::task::{Dispatch, TaskCell};

/// What a coroutine waits for after a step.
#[derive(Debug)]
pub enum CoroutineStep {
    /// Resume during the next Update drain.
    Yield,
    /// Resume during the next drain of the phase.
    YieldPhase(Phase),
    /// Resume during the Update drain after this many frame advances.
    WaitFrames(u32),
    /// Resume during the next Update drain after the cell settles. A failed
    /// or canceled cell ends the coroutine the same way.
    Await(TaskCell<()>),
    /// The routine is exhausted.
    Done,
}

/// A step-based routine.
pub trait Coroutine: Send + 'static {
    /// Run one step.
    fn resume(&mut self) -> CoroutineStep;
}

/// Coroutine backed by a closure. See [`coroutine_fn`].
pub struct CoroutineFn<F> {
    step: F,
}

impl<F> Coroutine for CoroutineFn<F>
where
    F: FnMut() -> CoroutineStep + Send + 'static,
{
    fn resume(&mut self) -> CoroutineStep {
        (self.step)()
    }
}

/// Wrap a closure as a coroutine; each call is one step.
pub fn coroutine_fn<F>(step: F) -> CoroutineFn<F>
where
    F: FnMut() -> CoroutineStep + Send + 'static,
{
    CoroutineFn { step }
}

impl PhaseScheduler {
    /// Drive `routine` and expose it as a cell.
    pub fn start_coroutine<C: Coroutine>(
        &self,
        routine: C,
    ) -> TaskCell<()> {
        self.start_coroutine_with_cancellation(&CancellationToken::none(), routine)
    }

    /// Drive `routine` until it finishes or `token` is requested.
    ///
    /// A canceled coroutine is dropped before its next step.
    pub fn start_coroutine_with_cancellation<C: Coroutine>(
        &self,
        token: &CancellationToken,
        routine: C,
    ) -> TaskCell<()> {
        let cell = TaskCell::new().with_cancellation(token);
        if cell.is_terminal() {
            return cell;
        }
        cell.mark_running();
        step(self.downgrade(), cell.clone(), routine);
        cell
    }
}

fn step<C: Coroutine>(
    scheduler: WeakScheduler,
    cell: TaskCell<()>,
    mut routine: C,
) {
    if cell.is_terminal() {
        trace!("Dropping coroutine {}", cell.id());
        return;
    }

    let next = match catch_unwind(AssertUnwindSafe(|| routine.resume())) {
        Ok(next) => next,
        Err(payload) => {
            let _ = cell.fail_with(TaskError::from_panic(payload));
            return;
        }
    };

    let timing = match next {
        CoroutineStep::Done => {
            let _ = cell.complete(());
            return;
        }
        CoroutineStep::Yield => Timing::Phase(Phase::Update),
        CoroutineStep::YieldPhase(phase) => Timing::Phase(phase),
        CoroutineStep::WaitFrames(frames) => Timing::AfterFrames(frames),
        CoroutineStep::Await(awaited) => {
            await_then_step(scheduler, cell, routine, awaited);
            return;
        }
    };

    let Some(strong) = scheduler.upgrade() else {
        cell.cancel();
        return;
    };
    let weak = scheduler.clone();
    strong.schedule(timing, ScheduledItem::new(move || step(weak, cell, routine)));
}

fn await_then_step<C: Coroutine>(
    scheduler: WeakScheduler,
    cell: TaskCell<()>,
    routine: C,
    awaited: TaskCell<()>,
) {
    let Some(strong) = scheduler.upgrade() else {
        cell.cancel();
        return;
    };

    let resumed = cell.clone();
    let attached = awaited.attach_continuation(
        move |outcome| match outcome {
            Outcome::Completed(()) => step(scheduler, resumed, routine),
            Outcome::Failed(error) => {
                let _ = resumed.fail_with(error);
            }
            Outcome::Canceled => {
                resumed.cancel();
            }
        },
        Dispatch::phase(&strong, Phase::Update),
    );
    if let Err(error) = attached {
        let _ = cell.fail_with(error);
    }
}
