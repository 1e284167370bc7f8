//! Time-based delays
//!
//! Deadlines are checked once per drain of the scheduler's timer phase.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::queue::ScheduledItem;

/// Which clock a delay is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayType {
    /// Host frame deltas multiplied by the time scale. Pauses at scale 0.
    #[default]
    Scaled,
    /// Host frame deltas, ignoring the time scale.
    Unscaled,
    /// Monotonic wall clock.
    Realtime,
}

/// Frame-driven clocks, advanced once per frame by the host delta.
#[derive(Debug, Clone, Copy)]
pub struct FrameClock {
    scaled: Duration,
    unscaled: Duration,
    time_scale: f32,
}

impl FrameClock {
    /// Create a clock at zero with the given time scale.
    ///
    /// A non-finite scale falls back to 1.
    pub fn new(time_scale: f32) -> Self {
        let time_scale = if time_scale.is_finite() { time_scale.max(0.0) } else { 1.0 };
        Self {
            scaled: Duration::ZERO,
            unscaled: Duration::ZERO,
            time_scale,
        }
    }

    /// Accumulate one frame. Both clocks saturate at [`Duration::MAX`].
    pub fn advance(
        &mut self,
        delta: Duration,
    ) {
        let scaled_delta = Duration::try_from_secs_f32(delta.as_secs_f32() * self.time_scale)
            .unwrap_or(Duration::MAX);
        self.unscaled = self.unscaled.saturating_add(delta);
        self.scaled = self.scaled.saturating_add(scaled_delta);
    }

    /// Total scaled time.
    #[inline]
    pub fn scaled(&self) -> Duration {
        self.scaled
    }

    /// Total unscaled time.
    #[inline]
    pub fn unscaled(&self) -> Duration {
        self.unscaled
    }

    /// Current time scale.
    #[inline]
    pub fn time_scale(&self) -> f32 {
        self.time_scale
    }

    /// Set the time scale. Negative values are clamped to zero, non-finite
    /// values are ignored. Returns whether the scale was applied.
    pub fn set_time_scale(
        &mut self,
        scale: f32,
    ) -> bool {
        if !scale.is_finite() {
            return false;
        }
        self.time_scale = scale.max(0.0);
        true
    }
}

#[derive(Debug, Clone, Copy)]
enum Deadline {
    Scaled(Duration),
    Unscaled(Duration),
    Realtime(Instant),
    /// The deadline lies past what the clock can represent.
    Never,
}

impl Deadline {
    fn is_due(
        &self,
        clock: &FrameClock,
        now: Instant,
    ) -> bool {
        match *self {
            Deadline::Scaled(at) => clock.scaled >= at,
            Deadline::Unscaled(at) => clock.unscaled >= at,
            Deadline::Realtime(at) => now >= at,
            Deadline::Never => false,
        }
    }
}

struct TimerEntry {
    deadline: Deadline,
    item: ScheduledItem,
}

/// Pending delays.
#[derive(Default)]
pub struct TimerQueue {
    entries: Vec<TimerEntry>,
}

impl TimerQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `item` to run once `delay` has elapsed on the chosen clock.
    ///
    /// A deadline that overflows the clock never comes due.
    pub fn push(
        &mut self,
        delay: Duration,
        delay_type: DelayType,
        clock: &FrameClock,
        item: ScheduledItem,
    ) {
        let deadline = match delay_type {
            DelayType::Scaled => clock.scaled.checked_add(delay).map(Deadline::Scaled),
            DelayType::Unscaled => clock.unscaled.checked_add(delay).map(Deadline::Unscaled),
            DelayType::Realtime => Instant::now().checked_add(delay).map(Deadline::Realtime),
        }
        .unwrap_or(Deadline::Never);
        self.entries.push(TimerEntry { deadline, item });
    }

    /// Remove and return every due item, in registration order.
    ///
    /// Items whose waiter has already settled are dropped.
    pub fn take_due(
        &mut self,
        clock: &FrameClock,
        now: Instant,
    ) -> Vec<ScheduledItem> {
        let mut due = Vec::new();
        let mut waiting = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if !entry.item.is_live() {
                continue;
            }
            if entry.deadline.is_due(clock, now) {
                due.push(entry.item);
            } else {
                waiting.push(entry);
            }
        }
        self.entries = waiting;
        due
    }

    /// Number of pending delays.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
