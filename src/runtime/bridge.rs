//! Thread-affinity bridge
//!
//! Moves a sequence between the scheduler's main thread and the worker
//! pool. Inside a sequence, awaiting [`PhaseScheduler::switch_to_thread_pool`]
//! re-submits the sequence to the pool and the code after the await runs on
//! a worker; awaiting [`PhaseScheduler::switch_to_main_thread`] brings it
//! back into a phase drain. A sequence's resumptions stay totally ordered
//! across switches since at most one poll of it is ever in flight.
//!
//! Data that crosses the switch must be owned by the sequence or guarded by
//! explicit synchronization; the bridge orders resumptions, nothing more.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tracing::{trace, warn};

use crate::runtime::cancel::CancellationToken;
use crate::runtime::errors::{TaskError, TaskResult};
use crate::runtime::scheduler::{Phase, PhaseScheduler, ScheduledItem, Timing};
use crate::runtime::sequence::{current_affinity, request_affinity, Affinity};
use crate::runtime::task::TaskCell;

/// Future returned by [`PhaseScheduler::switch_to_thread_pool`].
#[must_use = "futures do nothing unless awaited"]
pub struct SwitchToThreadPool {
    scheduler: PhaseScheduler,
    switched: bool,
}

impl Future for SwitchToThreadPool {
    type Output = ();

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<()> {
        if self.switched {
            return Poll::Ready(());
        }
        self.switched = true;

        if request_affinity(Affinity::ThreadPool) {
            cx.waker().wake_by_ref();
        } else {
            // Foreign executor: resume after a pool round-trip.
            let waker = cx.waker().clone();
            self.scheduler.pool().execute(Box::new(move || waker.wake()));
        }
        Poll::Pending
    }
}

/// Future returned by [`PhaseScheduler::switch_to_main_thread`].
#[must_use = "futures do nothing unless awaited"]
pub struct SwitchToMainThread {
    scheduler: PhaseScheduler,
    phase: Phase,
    switched: bool,
}

impl Future for SwitchToMainThread {
    type Output = ();

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<()> {
        if self.switched {
            return Poll::Ready(());
        }

        let on_main = self.scheduler.is_main_thread();
        let in_sequence = request_affinity(Affinity::Main(self.phase));
        if on_main {
            return Poll::Ready(());
        }

        self.switched = true;
        if in_sequence {
            cx.waker().wake_by_ref();
        } else {
            let waker = cx.waker().clone();
            self.scheduler
                .schedule(Timing::Phase(self.phase), ScheduledItem::new(move || waker.wake()));
        }
        Poll::Pending
    }
}

impl PhaseScheduler {
    /// Continue the current sequence on the worker pool.
    pub fn switch_to_thread_pool(&self) -> SwitchToThreadPool {
        SwitchToThreadPool {
            scheduler: self.clone(),
            switched: false,
        }
    }

    /// Continue the current sequence on the main thread, during the
    /// default resume phase. Completes immediately on the main thread.
    pub fn switch_to_main_thread(&self) -> SwitchToMainThread {
        self.switch_to_main_thread_on(self.config().default_resume_phase)
    }

    /// Continue the current sequence on the main thread during `phase`.
    ///
    /// Later cross-thread wakes of the sequence also resume in `phase`.
    pub fn switch_to_main_thread_on(
        &self,
        phase: Phase,
    ) -> SwitchToMainThread {
        SwitchToMainThread {
            scheduler: self.clone(),
            phase,
            switched: false,
        }
    }

    /// Run `f` on the worker pool.
    ///
    /// The returned cell settles with `f`'s result; a panic in `f` fails it
    /// with [`TaskError::Panicked`].
    pub fn run_on_thread_pool<T, F>(
        &self,
        f: F,
    ) -> TaskCell<T>
    where
        T: Send + 'static,
        F: FnOnce() -> TaskResult<T> + Send + 'static,
    {
        self.run_on_thread_pool_with_cancellation(&CancellationToken::none(), f)
    }

    /// Run `f` on the worker pool on behalf of `token`'s owner.
    ///
    /// Requesting the token cancels the returned cell immediately. If `f`
    /// has not started it is skipped; if it is already running it runs to
    /// the end and its result is discarded.
    pub fn run_on_thread_pool_with_cancellation<T, F>(
        &self,
        token: &CancellationToken,
        f: F,
    ) -> TaskCell<T>
    where
        T: Send + 'static,
        F: FnOnce() -> TaskResult<T> + Send + 'static,
    {
        let cell = TaskCell::new().with_cancellation(token);
        if cell.is_terminal() {
            return cell;
        }

        let worker = cell.clone();
        let failed = cell.clone();
        let item = ScheduledItem::new(move || {
            if worker.is_terminal() {
                trace!("Skipping pool work for {}", worker.id());
                return;
            }
            worker.mark_running();
            if let Err(error) = worker.set_result(f()) {
                warn!("Pool result for {} not delivered: {}", worker.id(), error);
            }
        })
        .with_failure_hook(move |error: TaskError| {
            let _ = failed.fail_with(error);
        });
        self.schedule_on_pool(item);
        cell
    }
}

/// Whether the calling code runs inside a pool-affine sequence.
pub fn on_thread_pool() -> bool {
    current_affinity() == Some(Affinity::ThreadPool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::cancel::CancellationSource;
    use crate::runtime::errors::Outcome;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{Duration, Instant};

    const DT: Duration = Duration::from_millis(16);

    fn tick_until(
        sched: &PhaseScheduler,
        mut done: impl FnMut() -> bool,
    ) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            sched.tick(DT);
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_switch_round_trip_returns_to_draining_thread() {
        let sched = PhaseScheduler::with_workers(2).unwrap();
        let main = thread::current().id();
        let inner = sched.clone();
        let cell = sched.spawn(async move {
            inner.switch_to_thread_pool().await;
            let worker = thread::current().id();
            let pooled = on_thread_pool();
            inner.switch_to_main_thread().await;
            Ok((worker, pooled, thread::current().id()))
        });

        assert!(tick_until(&sched, || cell.is_terminal()));
        let (worker, pooled, resumed) = cell.try_take_outcome().unwrap().into_result().unwrap();
        assert_ne!(worker, main);
        assert!(pooled);
        assert_eq!(resumed, main);
    }

    #[test]
    fn test_switch_to_main_on_main_thread_is_immediate() {
        let sched = PhaseScheduler::with_workers(1).unwrap();
        let inner = sched.clone();
        let cell = sched.spawn(async move {
            inner.switch_to_main_thread().await;
            Ok(())
        });
        assert!(cell.try_take_outcome().unwrap().is_completed());
    }

    #[test]
    fn test_run_on_thread_pool_delivers_value() {
        let sched = PhaseScheduler::with_workers(2).unwrap();
        let main = thread::current().id();
        let cell = sched.run_on_thread_pool(move || Ok(thread::current().id() != main));
        assert!(tick_until(&sched, || cell.is_terminal()));
        assert!(matches!(cell.try_take_outcome(), Some(Outcome::Completed(true))));
    }

    #[test]
    fn test_run_on_thread_pool_panic_fails_cell() {
        let sched = PhaseScheduler::with_workers(1).unwrap();
        let cell = sched.run_on_thread_pool::<(), _>(|| panic!("worker exploded"));
        assert!(tick_until(&sched, || cell.is_terminal()));
        let outcome = cell.try_take_outcome().unwrap();
        assert!(matches!(outcome.err(), Some(TaskError::Panicked(msg)) if msg == "worker exploded"));
    }

    #[test]
    fn test_cancel_while_running_discards_result() {
        let sched = PhaseScheduler::with_workers(1).unwrap();
        let source = CancellationSource::new();
        let started = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let finished = Arc::new(AtomicBool::new(false));

        let (s, r, f) = (started.clone(), release.clone(), finished.clone());
        let cell = sched.run_on_thread_pool_with_cancellation(&source.token(), move || {
            s.wait();
            r.wait();
            f.store(true, Ordering::SeqCst);
            Ok(7)
        });

        started.wait();
        source.request();
        assert!(cell.is_canceled());
        release.wait();

        assert!(tick_until(&sched, || finished.load(Ordering::SeqCst)));
        assert!(matches!(cell.try_take_outcome(), Some(Outcome::Canceled)));

        // The worker is still serving jobs.
        let next = sched.run_on_thread_pool(|| Ok(1));
        assert!(tick_until(&sched, || next.is_terminal()));
    }

    #[test]
    fn test_requested_token_skips_pool_work() {
        let sched = PhaseScheduler::with_workers(1).unwrap();
        let source = CancellationSource::new();
        source.request();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let cell = sched.run_on_thread_pool_with_cancellation(&source.token(), move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        assert!(cell.is_canceled());
        thread::sleep(Duration::from_millis(20));
        assert!(!ran.load(Ordering::SeqCst));
    }
}
