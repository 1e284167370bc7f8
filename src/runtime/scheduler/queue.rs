//! Continuation queues for the phase scheduler
//!
//! Each phase owns a [`PhaseQueue`]. Draining swaps the queue with an empty
//! one, so items pushed while a drain is running land in the next
//! occurrence of that phase. Frame-deferred items wait in a [`FrameQueue`]
//! until `advance_frame` releases them.

use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::Mutex;
use tracing::error;

use crate::runtime::errors::TaskError;

type Run = Box<dyn FnOnce() + Send>;
type FailureHook = Box<dyn FnOnce(TaskError) + Send>;
type Liveness = Box<dyn Fn() -> bool + Send>;

/// A continuation waiting in a queue.
pub struct ScheduledItem {
    run: Run,
    on_panic: Option<FailureHook>,
    live: Option<Liveness>,
}

impl std::fmt::Debug for ScheduledItem {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ScheduledItem")
            .field("has_failure_hook", &self.on_panic.is_some())
            .field("has_liveness", &self.live.is_some())
            .finish()
    }
}

impl ScheduledItem {
    /// Wrap a resume action.
    pub fn new<F>(run: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            run: Box::new(run),
            on_panic: None,
            live: None,
        }
    }

    /// Let timer and frame queues drop the item early once `live` returns
    /// `false`.
    pub fn with_liveness<F>(
        mut self,
        live: F,
    ) -> Self
    where
        F: Fn() -> bool + Send + 'static,
    {
        self.live = Some(Box::new(live));
        self
    }

    /// Whether running the item can still have an effect.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.live.as_ref().map_or(true, |live| live())
    }

    /// Route a panic in the resume action to `hook` as a failed outcome.
    pub fn with_failure_hook<F>(
        mut self,
        hook: F,
    ) -> Self
    where
        F: FnOnce(TaskError) + Send + 'static,
    {
        self.on_panic = Some(Box::new(hook));
        self
    }

    /// Run the item. Returns `false` if it panicked.
    ///
    /// With `catch` set, a panic is converted into a failure for the item's
    /// hook and does not unwind into the caller.
    pub fn run(
        self,
        catch: bool,
    ) -> bool {
        let ScheduledItem { run, on_panic, .. } = self;
        if !catch {
            run();
            return true;
        }

        match catch_unwind(AssertUnwindSafe(run)) {
            Ok(()) => true,
            Err(payload) => {
                let error = TaskError::from_panic(payload);
                error!("{}", error);
                if let Some(hook) = on_panic {
                    if catch_unwind(AssertUnwindSafe(move || hook(error))).is_err() {
                        error!("Failure hook panicked");
                    }
                }
                false
            }
        }
    }
}

/// Ordered continuations for one phase.
#[derive(Debug, Default)]
pub struct PhaseQueue {
    items: Mutex<Vec<ScheduledItem>>,
}

impl PhaseQueue {
    /// Create an empty queue.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item.
    #[inline]
    pub fn push(
        &self,
        item: ScheduledItem,
    ) {
        self.items.lock().push(item);
    }

    /// Swap the queue with an empty one and return the captured items.
    #[inline]
    pub fn take(&self) -> Vec<ScheduledItem> {
        std::mem::take(&mut *self.items.lock())
    }

    /// Number of queued items.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Check if empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

struct FrameEntry {
    remaining: u32,
    item: ScheduledItem,
}

/// Items waiting for a number of frame advances.
///
/// "Next frame" is a wait of one advance.
#[derive(Default)]
pub struct FrameQueue {
    entries: Vec<FrameEntry>,
}

impl FrameQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Release `item` after `frames` advances. `frames` must be at least 1.
    pub fn push(
        &mut self,
        frames: u32,
        item: ScheduledItem,
    ) {
        self.entries.push(FrameEntry {
            remaining: frames.max(1),
            item,
        });
    }

    /// Count one frame down and return the items that expired, in insertion order.
    ///
    /// Items whose waiter has already settled are dropped.
    pub fn advance(&mut self) -> Vec<ScheduledItem> {
        let mut ready = Vec::new();
        let mut waiting = Vec::with_capacity(self.entries.len());
        for mut entry in self.entries.drain(..) {
            if !entry.item.is_live() {
                continue;
            }
            entry.remaining -= 1;
            if entry.remaining == 0 {
                ready.push(entry.item);
            } else {
                waiting.push(entry);
            }
        }
        self.entries = waiting;
        ready
    }

    /// Number of waiting items.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
