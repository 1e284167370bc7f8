//! Fan-in over task cells.
//!
//! The result cell settles once every input is terminal:
//! - the first failure by input position wins, regardless of completion order;
//! - otherwise any cancellation cancels the result;
//! - otherwise it completes with the values in input order.
//!
//! Inputs run concurrently; each gets exactly one inline observer and no
//! further scheduling happens.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::observe;
use crate::runtime::errors::Outcome;
use crate::runtime::task::TaskCell;

type Slots<T> = SmallVec<[Option<Outcome<T>>; 8]>;

struct Join<T> {
    slots: Mutex<Slots<T>>,
    remaining: AtomicUsize,
    output: TaskCell<Vec<T>>,
}

impl<T: Send + 'static> Join<T> {
    fn record(
        &self,
        index: usize,
        outcome: Outcome<T>,
    ) {
        self.slots.lock()[index] = Some(outcome);
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let slots = std::mem::take(&mut *self.slots.lock());
            self.finish(slots);
        }
    }

    fn finish(
        &self,
        slots: Slots<T>,
    ) {
        let mut values = Vec::with_capacity(slots.len());
        let mut canceled = false;
        for slot in slots {
            match slot {
                Some(Outcome::Completed(value)) => values.push(value),
                Some(Outcome::Failed(error)) => {
                    let _ = self.output.fail_with(error);
                    return;
                }
                Some(Outcome::Canceled) | None => canceled = true,
            }
        }

        if canceled {
            self.output.cancel();
        } else {
            let _ = self.output.complete(values);
        }
    }
}

/// Wait for every cell in `cells`.
///
/// An empty input completes immediately with an empty vector.
pub fn when_all<T: Send + 'static>(cells: Vec<TaskCell<T>>) -> TaskCell<Vec<T>> {
    if cells.is_empty() {
        return TaskCell::completed(Vec::new());
    }

    let output = TaskCell::new();
    output.mark_running();

    let join = Arc::new(Join {
        slots: Mutex::new((0..cells.len()).map(|_| None).collect()),
        remaining: AtomicUsize::new(cells.len()),
        output: output.clone(),
    });

    for (index, cell) in cells.iter().enumerate() {
        let join = join.clone();
        observe(cell, move |outcome| join.record(index, outcome));
    }
    output
}

macro_rules! when_all_tuple {
    ($(#[$doc:meta])* $name:ident, $count:expr, $($ty:ident $cell:ident $idx:tt),+) => {
        $(#[$doc])*
        pub fn $name<$($ty: Send + 'static),+>(
            $($cell: TaskCell<$ty>),+
        ) -> TaskCell<($($ty,)+)> {
            fn finish<$($ty: Send + 'static),+>(
                output: &TaskCell<($($ty,)+)>,
                slots: ($(Option<Outcome<$ty>>,)+),
            ) {
                let mut canceled = false;
                let ($($cell,)+) = slots;
                $(
                    let $cell = match $cell {
                        Some(Outcome::Completed(value)) => Some(value),
                        Some(Outcome::Failed(error)) => {
                            let _ = output.fail_with(error);
                            return;
                        }
                        Some(Outcome::Canceled) | None => {
                            canceled = true;
                            None
                        }
                    };
                )+
                match ($($cell,)+) {
                    ($(Some($cell),)+) if !canceled => {
                        let _ = output.complete(($($cell,)+));
                    }
                    _ => {
                        output.cancel();
                    }
                }
            }

            let output = TaskCell::new();
            output.mark_running();
            let slots: Arc<Mutex<($(Option<Outcome<$ty>>,)+)>> = Arc::new(Mutex::new(Default::default()));
            let remaining = Arc::new(AtomicUsize::new($count));

            $(
                {
                    let slots = slots.clone();
                    let remaining = remaining.clone();
                    let output = output.clone();
                    observe(&$cell, move |outcome| {
                        slots.lock().$idx = Some(outcome);
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            let taken = std::mem::take(&mut *slots.lock());
                            finish(&output, taken);
                        }
                    });
                }
            )+
            output
        }
    };
}

when_all_tuple!(
    /// Wait for two cells of different types.
    when_all2, 2, A a 0, B b 1
);
when_all_tuple!(
    /// Wait for three cells of different types.
    when_all3, 3, A a 0, B b 1, C c 2
);
when_all_tuple!(
    /// Wait for four cells of different types.
    when_all4, 4, A a 0, B b 1, C c 2, D d 3
);
