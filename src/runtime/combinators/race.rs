//! First-wins combinators.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::observe;
use crate::runtime::cancel::CancellationSource;
use crate::runtime::errors::{Outcome, TaskError};
use crate::runtime::task::TaskCell;

type OnSettled = Box<dyn FnOnce() + Send>;

struct First<T> {
    settled: AtomicBool,
    live: AtomicUsize,
    output: TaskCell<(usize, T)>,
    on_settled: Mutex<Option<OnSettled>>,
}

impl<T: Send + 'static> First<T> {
    fn record(
        &self,
        index: usize,
        outcome: Outcome<T>,
    ) {
        let winner = match outcome {
            Outcome::Completed(value) => Outcome::Completed((index, value)),
            Outcome::Failed(error) => Outcome::Failed(error),
            Outcome::Canceled => {
                // Canceled inputs drop out; the result is canceled only when all do.
                if self.live.fetch_sub(1, Ordering::AcqRel) == 1 && !self.settled.swap(true, Ordering::AcqRel) {
                    self.output.cancel();
                    self.fire_settled();
                }
                return;
            }
        };

        if self.settled.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!("Input {} settled {} first", index, self.output.id());
        let _ = self.output.set_outcome(winner);
        self.fire_settled();
    }

    fn fire_settled(&self) {
        let on_settled = self.on_settled.lock().take();
        if let Some(on_settled) = on_settled {
            on_settled();
        }
    }
}

fn first_of<T: Send + 'static>(
    cells: &[TaskCell<T>],
    on_settled: Option<OnSettled>,
) -> TaskCell<(usize, T)> {
    let output = TaskCell::new();
    if cells.is_empty() {
        let _ = output.fail_with(TaskError::invalid_state("no cells to race"));
        return output;
    }
    output.mark_running();

    let first = Arc::new(First {
        settled: AtomicBool::new(false),
        live: AtomicUsize::new(cells.len()),
        output: output.clone(),
        on_settled: Mutex::new(on_settled),
    });
    for (index, cell) in cells.iter().enumerate() {
        let first = first.clone();
        observe(cell, move |outcome| first.record(index, outcome));
    }
    output
}

/// Settle with the first input that completes or fails.
///
/// Completes with the winner's index and value. Canceled inputs are
/// skipped; if every input is canceled the result is canceled. Losers keep
/// running; see [`race`] to cut them off.
pub fn when_any<T: Send + 'static>(cells: Vec<TaskCell<T>>) -> TaskCell<(usize, T)> {
    first_of(&cells, None)
}

/// Like [`when_any`], but every input observes `source` and the source is
/// requested as soon as a winner exists, canceling the losers.
pub fn race<T: Send + 'static>(
    source: &CancellationSource,
    cells: Vec<TaskCell<T>>,
) -> TaskCell<(usize, T)> {
    let token = source.token();
    for cell in &cells {
        cell.bind_cancellation(&token);
    }
    let source = source.clone();
    first_of(
        &cells,
        Some(Box::new(move || {
            source.request();
        })),
    )
}
