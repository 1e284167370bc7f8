//! Phase scheduler
//!
//! The host drives the scheduler once per tick: it calls
//! [`PhaseScheduler::drain`] for each phase in its own fixed order, then
//! [`PhaseScheduler::advance_frame`] once per full cycle.
//!
//! ```text
//! tick N:  drain(PreUpdate) → drain(Update) → drain(LateUpdate)
//!          → drain(FixedUpdate) → drain(EndOfFrame) → advance_frame(dt)
//! ```
//!
//! A drain swaps the phase's queue with an empty one and resumes the captured
//! continuations in insertion order. Continuations scheduled during the drain
//! wait for the next occurrence of the phase, so every drain terminates. A
//! continuation that panics is isolated: it fails its own task and the drain
//! carries on.

pub mod queue;
pub mod timer;

#[cfg(test)]
mod tests;

pub use queue::{FrameQueue, PhaseQueue, ScheduledItem};
pub use timer::{DelayType, FrameClock, TimerQueue};

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::runtime::errors::{TaskError, TaskResult};
use crate::runtime::pool::{PoolConfig, ThreadPool, WorkerPool};
use crate::runtime::task::TaskCell;

/// A named point in the host's per-tick update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Before the main update.
    PreUpdate,
    /// The main update.
    Update,
    /// After the main update, before rendering.
    LateUpdate,
    /// The fixed-timestep step.
    FixedUpdate,
    /// After rendering.
    EndOfFrame,
}

impl Phase {
    /// Number of phases.
    pub const COUNT: usize = 5;

    /// Phases in the order [`PhaseScheduler::tick`] drains them.
    pub const ALL: [Phase; Phase::COUNT] = [
        Phase::PreUpdate,
        Phase::Update,
        Phase::LateUpdate,
        Phase::FixedUpdate,
        Phase::EndOfFrame,
    ];

    #[inline]
    fn index(self) -> usize {
        match self {
            Phase::PreUpdate => 0,
            Phase::Update => 1,
            Phase::LateUpdate => 2,
            Phase::FixedUpdate => 3,
            Phase::EndOfFrame => 4,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// When a scheduled item becomes runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timing {
    /// The next drain of a phase.
    Phase(Phase),
    /// The Update phase after the next frame advance.
    NextFrame,
    /// The Update phase after `n` frame advances. Zero means the next Update drain.
    AfterFrames(u32),
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Phase whose drain checks time-based delays.
    pub timer_phase: Phase,
    /// Phase a main-thread sequence resumes in when woken from another thread.
    pub default_resume_phase: Phase,
    /// Time scale at startup.
    pub initial_time_scale: f32,
    /// Catch panics at the drain boundary.
    pub catch_panics: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timer_phase: Phase::Update,
            default_resume_phase: Phase::Update,
            initial_time_scale: 1.0,
            catch_panics: true,
        }
    }
}

/// Scheduler statistics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Items pushed into phase or frame queues.
    pub items_scheduled: AtomicUsize,
    /// Items resumed by drains.
    pub items_resumed: AtomicUsize,
    /// Items that panicked during a drain.
    pub items_panicked: AtomicUsize,
    /// Jobs handed to the worker pool.
    pub pool_jobs: AtomicUsize,
}

impl SchedulerStats {
    /// Record a scheduled item.
    #[inline]
    pub fn record_scheduled(&self) {
        self.items_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a resumed item.
    #[inline]
    pub fn record_resumed(
        &self,
        ok: bool,
    ) {
        self.items_resumed.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.items_panicked.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a pool job.
    #[inline]
    pub fn record_pool_job(&self) {
        self.pool_jobs.fetch_add(1, Ordering::Relaxed);
    }
}

struct Shared {
    config: SchedulerConfig,
    queues: [PhaseQueue; Phase::COUNT],
    frames: Mutex<FrameQueue>,
    timers: Mutex<TimerQueue>,
    clock: Mutex<FrameClock>,
    frame: AtomicU64,
    main_thread: Mutex<ThreadId>,
    pool: Arc<dyn WorkerPool>,
    stats: SchedulerStats,
}

/// Handle to a phase scheduler. Clones share the same queues.
#[derive(Clone)]
pub struct PhaseScheduler {
    shared: Arc<Shared>,
}

/// Non-owning scheduler handle.
#[derive(Clone)]
pub struct WeakScheduler {
    shared: Weak<Shared>,
}

impl WeakScheduler {
    /// Upgrade to a full handle if the scheduler is still alive.
    pub fn upgrade(&self) -> Option<PhaseScheduler> {
        self.shared.upgrade().map(|shared| PhaseScheduler { shared })
    }
}

impl fmt::Debug for PhaseScheduler {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("PhaseScheduler")
            .field("frame", &self.frame_count())
            .field("time_scale", &self.time_scale())
            .field("workers", &self.shared.pool.num_workers())
            .finish()
    }
}

impl PhaseScheduler {
    /// Create a scheduler that offloads work to `pool`.
    ///
    /// The calling thread is the main thread until a drain runs elsewhere.
    pub fn new(
        config: SchedulerConfig,
        pool: Arc<dyn WorkerPool>,
    ) -> Self {
        let clock = FrameClock::new(config.initial_time_scale);
        Self {
            shared: Arc::new(Shared {
                config,
                queues: Default::default(),
                frames: Mutex::new(FrameQueue::new()),
                timers: Mutex::new(TimerQueue::new()),
                clock: Mutex::new(clock),
                frame: AtomicU64::new(0),
                main_thread: Mutex::new(thread::current().id()),
                pool,
                stats: SchedulerStats::default(),
            }),
        }
    }

    /// Create a scheduler with a built-in worker pool.
    pub fn with_pool_config(
        config: SchedulerConfig,
        pool_config: &PoolConfig,
    ) -> io::Result<Self> {
        let pool = crate::runtime::pool::build_pool(pool_config)?;
        Ok(Self::new(config, pool))
    }

    /// Create a scheduler with default configuration and `workers` pool threads.
    pub fn with_workers(workers: usize) -> io::Result<Self> {
        let pool = ThreadPool::new(&PoolConfig {
            num_workers: workers,
            ..PoolConfig::default()
        })?;
        Ok(Self::new(SchedulerConfig::default(), Arc::new(pool)))
    }

    /// Non-owning handle.
    pub fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Get the configuration.
    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Get statistics.
    #[inline]
    pub fn stats(&self) -> &SchedulerStats {
        &self.shared.stats
    }

    /// Get the worker pool.
    #[inline]
    pub fn pool(&self) -> &Arc<dyn WorkerPool> {
        &self.shared.pool
    }

    /// Frames advanced so far.
    #[inline]
    pub fn frame_count(&self) -> u64 {
        self.shared.frame.load(Ordering::Acquire)
    }

    /// Current time scale.
    pub fn time_scale(&self) -> f32 {
        self.shared.clock.lock().time_scale()
    }

    /// Set the time scale applied to [`DelayType::Scaled`] delays.
    ///
    /// Negative scales are clamped to 0; non-finite scales are ignored.
    pub fn set_time_scale(
        &self,
        scale: f32,
    ) {
        if scale < 0.0 {
            warn!("Negative time scale {} clamped to 0", scale);
        }
        if !self.shared.clock.lock().set_time_scale(scale) {
            warn!("Ignoring non-finite time scale {}", scale);
        }
    }

    /// Scaled time accumulated from frame deltas.
    pub fn scaled_time(&self) -> Duration {
        self.shared.clock.lock().scaled()
    }

    /// Unscaled time accumulated from frame deltas.
    pub fn unscaled_time(&self) -> Duration {
        self.shared.clock.lock().unscaled()
    }

    /// Whether the calling thread is the one draining phases.
    pub fn is_main_thread(&self) -> bool {
        *self.shared.main_thread.lock() == thread::current().id()
    }

    /// Number of items waiting for `phase`.
    pub fn pending(
        &self,
        phase: Phase,
    ) -> usize {
        self.shared.queues[phase.index()].len()
    }

    /// Number of items waiting for frame advances.
    pub fn pending_frames(&self) -> usize {
        self.shared.frames.lock().len()
    }

    /// Number of pending time-based delays.
    pub fn pending_timers(&self) -> usize {
        self.shared.timers.lock().len()
    }

    /// Queue an item.
    pub fn schedule(
        &self,
        timing: Timing,
        item: ScheduledItem,
    ) {
        self.shared.stats.record_scheduled();
        match timing {
            Timing::Phase(phase) => self.shared.queues[phase.index()].push(item),
            Timing::AfterFrames(0) => self.shared.queues[Phase::Update.index()].push(item),
            Timing::NextFrame => self.shared.frames.lock().push(1, item),
            Timing::AfterFrames(frames) => self.shared.frames.lock().push(frames, item),
        }
    }

    /// Hand an item to the worker pool.
    pub fn schedule_on_pool(
        &self,
        item: ScheduledItem,
    ) {
        self.shared.stats.record_pool_job();
        self.shared.pool.execute(Box::new(move || {
            item.run(true);
        }));
    }

    /// Resume every continuation queued for `phase` before this call.
    ///
    /// When `phase` is the timer phase, due delays resume first. Items
    /// enqueued by anything resumed here, timers included, wait for the next
    /// drain. Returns the number of continuations resumed.
    pub fn drain(
        &self,
        phase: Phase,
    ) -> usize {
        *self.shared.main_thread.lock() = thread::current().id();
        let catch = self.shared.config.catch_panics;
        let mut resumed = 0;

        // Captured before timers fire: anything they enqueue waits for the next drain.
        let queued = self.shared.queues[phase.index()].take();

        if phase == self.shared.config.timer_phase {
            let clock = *self.shared.clock.lock();
            let due = self.shared.timers.lock().take_due(&clock, Instant::now());
            for item in due {
                self.shared.stats.record_resumed(item.run(catch));
                resumed += 1;
            }
        }

        for item in queued {
            self.shared.stats.record_resumed(item.run(catch));
            resumed += 1;
        }

        if resumed > 0 {
            trace!("Drained {} continuations in {}", resumed, phase);
        }
        resumed
    }

    /// End the current frame.
    ///
    /// Accumulates `delta` into the frame clocks and releases next-frame and
    /// expired after-N-frames items into the Update queue.
    pub fn advance_frame(
        &self,
        delta: Duration,
    ) -> u64 {
        self.shared.clock.lock().advance(delta);
        let ready = self.shared.frames.lock().advance();
        let update = &self.shared.queues[Phase::Update.index()];
        for item in ready {
            update.push(item);
        }
        self.shared.frame.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Run one full host cycle: drain every phase in [`Phase::ALL`] order,
    /// then advance the frame.
    pub fn tick(
        &self,
        delta: Duration,
    ) -> usize {
        let resumed = Phase::ALL.iter().map(|phase| self.drain(*phase)).sum();
        self.advance_frame(delta);
        resumed
    }

    /// Drop every queued item without running it.
    ///
    /// Used when the host tears the loop down; tasks waiting on dropped
    /// items never resume.
    pub fn clear(&self) {
        for queue in &self.shared.queues {
            drop(queue.take());
        }
        *self.shared.frames.lock() = FrameQueue::new();
        *self.shared.timers.lock() = TimerQueue::new();
    }

    /// Completes during the next drain of `phase`.
    pub fn yield_phase(
        &self,
        phase: Phase,
    ) -> TaskCell<()> {
        self.complete_at(Timing::Phase(phase))
    }

    /// Completes during the next Update drain.
    pub fn yield_now(&self) -> TaskCell<()> {
        self.yield_phase(Phase::Update)
    }

    /// Completes during the Update drain of the next frame.
    pub fn next_frame(&self) -> TaskCell<()> {
        self.complete_at(Timing::NextFrame)
    }

    /// Completes during the Update drain after `frames` frame advances.
    pub fn delay_frames(
        &self,
        frames: u32,
    ) -> TaskCell<()> {
        self.complete_at(Timing::AfterFrames(frames))
    }

    /// Completes during the next EndOfFrame drain.
    pub fn wait_for_end_of_frame(&self) -> TaskCell<()> {
        self.yield_phase(Phase::EndOfFrame)
    }

    /// Completes during the next FixedUpdate drain.
    pub fn wait_for_fixed_update(&self) -> TaskCell<()> {
        self.yield_phase(Phase::FixedUpdate)
    }

    /// Completes during the first timer-phase drain after `delay` elapsed
    /// on the clock chosen by `delay_type`.
    pub fn delay(
        &self,
        delay: Duration,
        delay_type: DelayType,
    ) -> TaskCell<()> {
        let cell = TaskCell::new();
        let item = completion_item(&cell);
        let clock = *self.shared.clock.lock();
        self.shared
            .timers
            .lock()
            .push(delay, delay_type, &clock, item);
        cell
    }

    fn complete_at(
        &self,
        timing: Timing,
    ) -> TaskCell<()> {
        let cell = TaskCell::new();
        self.schedule(timing, completion_item(&cell));
        cell
    }

    /// Evaluate `poll` once per drain of `phase` until it yields a result.
    ///
    /// The returned cell settles with that result; a panic in `poll` fails
    /// it. Canceling the cell stops the polling.
    pub(crate) fn poll_every<R, F>(
        &self,
        phase: Phase,
        poll: F,
    ) -> TaskCell<R>
    where
        R: Send + 'static,
        F: FnMut() -> Option<TaskResult<R>> + Send + 'static,
    {
        let cell = TaskCell::new();
        poll_step(self.downgrade(), phase, cell.clone(), poll);
        cell
    }
}

fn completion_item(cell: &TaskCell<()>) -> ScheduledItem {
    let watched = cell.clone();
    let cell = cell.clone();
    ScheduledItem::new(move || {
        // A canceled cell ignores the completion.
        let _ = cell.complete(());
    })
    .with_liveness(move || !watched.is_terminal())
}

fn poll_step<R, F>(
    scheduler: WeakScheduler,
    phase: Phase,
    cell: TaskCell<R>,
    mut poll: F,
) where
    R: Send + 'static,
    F: FnMut() -> Option<TaskResult<R>> + Send + 'static,
{
    let Some(strong) = scheduler.upgrade() else {
        cell.cancel();
        return;
    };
    let failed = cell.clone();
    let item = ScheduledItem::new(move || {
        if cell.is_terminal() {
            return;
        }
        match poll() {
            Some(result) => {
                let _ = cell.set_result(result);
            }
            None => poll_step(scheduler, phase, cell, poll),
        }
    })
    .with_failure_hook(move |error: TaskError| {
        let _ = failed.fail_with(error);
    });
    strong.schedule(Timing::Phase(phase), item);
}
