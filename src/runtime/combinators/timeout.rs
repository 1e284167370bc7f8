//! Timeouts as a race between a cell and a delay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::observe;
use crate::runtime::errors::{Outcome, TaskError};
use crate::runtime::scheduler::{DelayType, PhaseScheduler};
use crate::runtime::task::TaskCell;

/// Settle with `cell`'s outcome, or fail with [`TaskError::Timeout`] if
/// `duration` elapses first on the `delay_type` clock.
///
/// Whichever side loses is canceled.
pub fn timeout<T: Send + 'static>(
    scheduler: &PhaseScheduler,
    cell: TaskCell<T>,
    duration: Duration,
    delay_type: DelayType,
) -> TaskCell<T> {
    let output = TaskCell::new();
    output.mark_running();
    let timer = scheduler.delay(duration, delay_type);
    let decided = Arc::new(AtomicBool::new(false));

    {
        let decided = decided.clone();
        let output = output.clone();
        let timer = timer.clone();
        observe(&cell, move |outcome| {
            if decided.swap(true, Ordering::AcqRel) {
                return;
            }
            timer.cancel();
            let _ = output.set_outcome(outcome);
        });
    }

    let timed_out = output.clone();
    observe(&timer, move |outcome: Outcome<()>| {
        if !outcome.is_completed() || decided.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("{} timed out after {:?}", cell.id(), duration);
        cell.cancel();
        let _ = timed_out.fail_with(TaskError::Timeout(duration));
    });

    output
}
