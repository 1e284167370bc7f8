//! Async sequences
//!
//! A sequence is a future driven by the phase scheduler. It is written as
//! straight-line `async` code and suspends only at explicit await points:
//! awaiting a [`TaskCell`], a phase yield, a delay, or a thread switch.
//!
//! Each sequence carries an [`Affinity`]. A main-thread sequence woken on
//! the main thread is polled inline; woken from another thread it is queued
//! for the scheduler's default resume phase. A pool sequence is re-submitted
//! to the worker pool on every wake. A small state machine guarantees that
//! two polls of one sequence never overlap:
//!
//! ```text
//! IDLE ──wake──► SCHEDULED ──run──► RUNNING ──Pending──► IDLE
//!                    ▲                  │ wake
//!                    └──── NOTIFIED ◄───┘
//! RUNNING ──Ready / panic / canceled──► DONE
//! ```

use std::cell::Cell;
use std::future::{Future, IntoFuture};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};

use parking_lot::Mutex;
use tracing::trace;

use crate::runtime::cancel::{CancellationToken, Registration};
use crate::runtime::errors::{Outcome, TaskError, TaskResult};
use crate::runtime::scheduler::{Phase, PhaseScheduler, ScheduledItem, Timing, WeakScheduler};
use crate::runtime::task::{Dispatch, TaskCell};

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;
const NOTIFIED: u8 = 3;
const DONE: u8 = 4;

/// Which execution context a sequence resumes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    /// The scheduler's main thread; the phase is used when the wake comes
    /// from another thread.
    Main(Phase),
    /// The worker pool.
    ThreadPool,
}

thread_local! {
    /// Affinity of the sequence being polled on this thread.
    static CURRENT: Cell<Option<Affinity>> = const { Cell::new(None) };
    /// Affinity change requested by the sequence being polled.
    static REQUESTED: Cell<Option<Affinity>> = const { Cell::new(None) };
}

/// Affinity of the sequence currently polled on this thread, if any.
pub fn current_affinity() -> Option<Affinity> {
    CURRENT.with(Cell::get)
}

/// Ask the running sequence to move to `affinity` at its next wake.
///
/// Returns `false` when called outside a sequence.
pub(crate) fn request_affinity(affinity: Affinity) -> bool {
    if current_affinity().is_none() {
        return false;
    }
    REQUESTED.with(|requested| requested.set(Some(affinity)));
    true
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = TaskResult<T>> + Send>>;

struct Sequence<T> {
    state: AtomicU8,
    affinity: Mutex<Affinity>,
    future: Mutex<Option<BoxFuture<T>>>,
    output: TaskCell<T>,
    scheduler: WeakScheduler,
    registration: Mutex<Option<Registration>>,
}

impl<T: Send + 'static> Sequence<T> {
    fn notify(self: &Arc<Self>) {
        loop {
            match self.state.load(Ordering::Acquire) {
                IDLE => {
                    if self
                        .state
                        .compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.dispatch(false);
                        return;
                    }
                }
                RUNNING => {
                    if self
                        .state
                        .compare_exchange(RUNNING, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    /// Called in `SCHEDULED`.
    fn dispatch(
        self: &Arc<Self>,
        from_poll: bool,
    ) {
        let Some(scheduler) = self.scheduler.upgrade() else {
            trace!("Scheduler gone, abandoning {}", self.output.id());
            self.finish();
            self.output.cancel();
            return;
        };

        let affinity = *self.affinity.lock();
        match affinity {
            Affinity::Main(_) if !from_poll && scheduler.is_main_thread() => self.run(),
            Affinity::Main(phase) => {
                let this = self.clone();
                scheduler.schedule(Timing::Phase(phase), self.scheduled_item(move || this.run()));
            }
            Affinity::ThreadPool => {
                let this = self.clone();
                scheduler.schedule_on_pool(self.scheduled_item(move || this.run()));
            }
        }
    }

    fn scheduled_item<F>(
        self: &Arc<Self>,
        run: F,
    ) -> ScheduledItem
    where
        F: FnOnce() + Send + 'static,
    {
        let output = self.output.clone();
        ScheduledItem::new(run).with_failure_hook(move |error| {
            let _ = output.fail_with(error);
        })
    }

    /// Called in `SCHEDULED`.
    fn run(self: &Arc<Self>) {
        self.state.store(RUNNING, Ordering::Release);

        if self.output.is_terminal() {
            self.finish();
            return;
        }
        self.output.mark_running();

        let affinity = *self.affinity.lock();
        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);

        let outer_current = CURRENT.with(|current| current.replace(Some(affinity)));
        let outer_requested = REQUESTED.with(|requested| requested.take());
        let polled = {
            let mut slot = self.future.lock();
            match slot.as_mut() {
                Some(future) => catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))),
                None => Ok(Poll::Pending),
            }
        };
        let requested = REQUESTED.with(|requested| requested.replace(outer_requested));
        CURRENT.with(|current| current.set(outer_current));

        match polled {
            Ok(Poll::Ready(result)) => {
                self.finish();
                let _ = self.output.set_result(result);
            }
            Err(payload) => {
                self.finish();
                let _ = self.output.fail_with(TaskError::from_panic(payload));
            }
            Ok(Poll::Pending) => {
                if let Some(affinity) = requested {
                    *self.affinity.lock() = affinity;
                }
                if self
                    .state
                    .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    self.state.store(SCHEDULED, Ordering::Release);
                    self.dispatch(true);
                }
            }
        }
    }

    fn finish(&self) {
        self.state.store(DONE, Ordering::Release);
        drop(self.future.lock().take());
        if let Some(registration) = self.registration.lock().take() {
            registration.dispose();
        }
    }
}

impl<T: Send + 'static> Wake for Sequence<T> {
    fn wake(self: Arc<Self>) {
        self.notify();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.notify();
    }
}

impl PhaseScheduler {
    /// Start a sequence.
    ///
    /// The sequence runs synchronously on the caller until its first
    /// suspension and then resumes per its affinity (main thread initially).
    /// The returned cell settles with the sequence's result; a panic fails
    /// it with [`TaskError::Panicked`], `Err(TaskError::Canceled)` cancels it.
    pub fn spawn<T, F>(
        &self,
        future: F,
    ) -> TaskCell<T>
    where
        T: Send + 'static,
        F: Future<Output = TaskResult<T>> + Send + 'static,
    {
        self.spawn_with_cancellation(&CancellationToken::none(), future)
    }

    /// Start a sequence observing `token`.
    ///
    /// Requesting the token cancels the returned cell at once; the future
    /// itself is dropped at its next wake, which the cancellation triggers.
    pub fn spawn_with_cancellation<T, F>(
        &self,
        token: &CancellationToken,
        future: F,
    ) -> TaskCell<T>
    where
        T: Send + 'static,
        F: Future<Output = TaskResult<T>> + Send + 'static,
    {
        let output = TaskCell::new().with_cancellation(token);
        if output.is_terminal() {
            return output;
        }

        let sequence = Arc::new(Sequence {
            state: AtomicU8::new(SCHEDULED),
            affinity: Mutex::new(Affinity::Main(self.config().default_resume_phase)),
            future: Mutex::new(Some(Box::pin(future))),
            output: output.clone(),
            scheduler: self.downgrade(),
            registration: Mutex::new(None),
        });

        if token.can_be_canceled() {
            let weak: Weak<Sequence<T>> = Arc::downgrade(&sequence);
            let registration = token.register(move || {
                if let Some(sequence) = weak.upgrade() {
                    sequence.notify();
                }
            });
            *sequence.registration.lock() = Some(registration);
        }

        trace!("Spawned sequence {}", output.id());
        sequence.run();
        output
    }

    /// Start a sequence nobody awaits. Failures are reported as unobserved.
    pub fn spawn_detached<F>(
        &self,
        future: F,
    ) where
        F: Future<Output = TaskResult<()>> + Send + 'static,
    {
        self.spawn(future).forget();
    }
}

struct Handoff<T> {
    outcome: Option<Outcome<T>>,
    waker: Option<Waker>,
}

/// Future returned by awaiting a [`TaskCell`].
///
/// Resolves to the cell's [`Outcome`], consuming it.
pub struct CellFuture<T> {
    cell: Option<TaskCell<T>>,
    handoff: Option<Arc<Mutex<Handoff<T>>>>,
}

impl<T: Send + 'static> Future for CellFuture<T> {
    type Output = Outcome<T>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Outcome<T>> {
        let this = &mut *self;

        if let Some(handoff) = &this.handoff {
            let mut handoff = handoff.lock();
            if let Some(outcome) = handoff.outcome.take() {
                return Poll::Ready(outcome);
            }
            match &handoff.waker {
                Some(waker) if waker.will_wake(cx.waker()) => {}
                _ => handoff.waker = Some(cx.waker().clone()),
            }
            return Poll::Pending;
        }

        let Some(cell) = this.cell.take() else {
            return Poll::Ready(Outcome::Failed(TaskError::invalid_state(
                "cell future polled after completion",
            )));
        };

        let handoff = Arc::new(Mutex::new(Handoff {
            outcome: None,
            waker: None,
        }));
        let writer = handoff.clone();
        let attached = cell.attach_continuation(
            move |outcome| {
                let waker = {
                    let mut handoff = writer.lock();
                    handoff.outcome = Some(outcome);
                    handoff.waker.take()
                };
                if let Some(waker) = waker {
                    waker.wake();
                }
            },
            Dispatch::Inline,
        );
        if let Err(error) = attached {
            return Poll::Ready(Outcome::Failed(error));
        }

        {
            let mut guard = handoff.lock();
            if let Some(outcome) = guard.outcome.take() {
                return Poll::Ready(outcome);
            }
            guard.waker = Some(cx.waker().clone());
        }
        this.handoff = Some(handoff);
        Poll::Pending
    }
}

impl<T: Send + 'static> IntoFuture for TaskCell<T> {
    type Output = Outcome<T>;
    type IntoFuture = CellFuture<T>;

    fn into_future(self) -> CellFuture<T> {
        CellFuture {
            cell: Some(self),
            handoff: None,
        }
    }
}
