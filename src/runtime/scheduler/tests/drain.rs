//! Drain semantics

use super::scheduler;
use crate::runtime::errors::{Outcome, TaskError};
use crate::runtime::scheduler::{DelayType, Phase, PhaseScheduler, ScheduledItem, Timing};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DT: Duration = Duration::from_millis(16);

fn push_log(
    sched: &PhaseScheduler,
    phase: Phase,
    log: &Arc<Mutex<Vec<String>>>,
    entry: &str,
) {
    let log = log.clone();
    let entry = entry.to_string();
    sched.schedule(Timing::Phase(phase), ScheduledItem::new(move || log.lock().push(entry)));
}

#[test]
fn test_drain_runs_in_insertion_order() {
    let sched = scheduler();
    let log = Arc::new(Mutex::new(Vec::new()));
    for entry in ["a", "b", "c"] {
        push_log(&sched, Phase::Update, &log, entry);
    }
    push_log(&sched, Phase::LateUpdate, &log, "late");

    assert_eq!(sched.drain(Phase::Update), 3);
    assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    assert_eq!(sched.pending(Phase::LateUpdate), 1);
}

#[test]
fn test_nested_enqueue_waits_for_next_drain() {
    let sched = scheduler();
    let log = Arc::new(Mutex::new(Vec::new()));

    let nested_sched = sched.clone();
    let nested_log = log.clone();
    sched.schedule(
        Timing::Phase(Phase::Update),
        ScheduledItem::new(move || {
            nested_log.lock().push("outer".to_string());
            push_log(&nested_sched, Phase::Update, &nested_log, "inner");
        }),
    );

    assert_eq!(sched.drain(Phase::Update), 1);
    assert_eq!(*log.lock(), vec!["outer"]);
    assert_eq!(sched.pending(Phase::Update), 1);

    sched.drain(Phase::Update);
    assert_eq!(*log.lock(), vec!["outer", "inner"]);
}

#[test]
fn test_timer_resumed_work_enqueued_for_timer_phase_waits() {
    let sched = scheduler();
    let steps = Arc::new(AtomicU32::new(0));

    let inner = sched.clone();
    let counter = steps.clone();
    let task = sched.spawn(async move {
        inner.delay(Duration::ZERO, DelayType::Unscaled).await.into_result()?;
        counter.fetch_add(1, Ordering::SeqCst);
        inner.yield_now().await.into_result()?;
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    assert_eq!(sched.drain(Phase::Update), 1);
    assert_eq!(steps.load(Ordering::SeqCst), 1);
    assert!(!task.is_terminal());
    assert_eq!(sched.pending(Phase::Update), 1);

    assert_eq!(sched.drain(Phase::Update), 1);
    assert_eq!(steps.load(Ordering::SeqCst), 2);
    assert!(task.is_terminal());
}

#[test]
fn test_self_rescheduling_item_terminates_each_drain() {
    fn again(sched: PhaseScheduler, count: Arc<Mutex<u32>>) {
        let next = sched.clone();
        sched.schedule(
            Timing::Phase(Phase::Update),
            ScheduledItem::new(move || {
                *count.lock() += 1;
                again(next, count);
            }),
        );
    }

    let sched = scheduler();
    let count = Arc::new(Mutex::new(0));
    again(sched.clone(), count.clone());
    for _ in 0..3 {
        sched.drain(Phase::Update);
    }
    assert_eq!(*count.lock(), 3);
    sched.clear();
}

#[test]
fn test_panic_is_isolated_to_its_item() {
    let sched = scheduler();
    let log = Arc::new(Mutex::new(Vec::new()));
    let failed = Arc::new(Mutex::new(None));

    push_log(&sched, Phase::Update, &log, "before");
    let slot = failed.clone();
    sched.schedule(
        Timing::Phase(Phase::Update),
        ScheduledItem::new(|| panic!("continuation blew up"))
            .with_failure_hook(move |error| *slot.lock() = Some(error)),
    );
    push_log(&sched, Phase::Update, &log, "after");

    assert_eq!(sched.drain(Phase::Update), 3);
    assert_eq!(*log.lock(), vec!["before", "after"]);
    assert!(matches!(failed.lock().take(), Some(TaskError::Panicked(_))));
    assert_eq!(sched.stats().items_panicked.load(std::sync::atomic::Ordering::Relaxed), 1);
}

#[test]
fn test_tick_drains_phases_in_order() {
    let sched = scheduler();
    let log = Arc::new(Mutex::new(Vec::new()));
    for phase in Phase::ALL.iter().rev() {
        push_log(&sched, *phase, &log, &phase.to_string());
    }

    sched.tick(DT);
    let expected: Vec<String> = Phase::ALL.iter().map(|p| p.to_string()).collect();
    assert_eq!(*log.lock(), expected);
    assert_eq!(sched.frame_count(), 1);
}

#[test]
fn test_yield_primitives_complete_in_their_phase() {
    let sched = scheduler();
    let end = sched.wait_for_end_of_frame();
    let fixed = sched.wait_for_fixed_update();

    sched.drain(Phase::Update);
    assert!(!end.is_terminal());
    sched.drain(Phase::FixedUpdate);
    assert!(fixed.is_terminal());
    assert!(!end.is_terminal());
    sched.drain(Phase::EndOfFrame);
    assert!(matches!(end.try_take_outcome(), Some(Outcome::Completed(()))));
}

#[test]
fn test_next_frame_and_delay_frames() {
    let sched = scheduler();
    let next = sched.next_frame();
    let third = sched.delay_frames(3);
    let now = sched.delay_frames(0);

    sched.drain(Phase::Update);
    assert!(now.is_terminal());
    assert!(!next.is_terminal());

    sched.advance_frame(DT);
    sched.drain(Phase::Update);
    assert!(next.is_terminal());
    assert!(!third.is_terminal());

    sched.tick(DT);
    sched.tick(DT);
    assert!(!third.is_terminal());
    assert_eq!(sched.pending(Phase::Update), 1);
    sched.drain(Phase::Update);
    assert!(third.is_terminal());
}

#[test]
fn test_main_thread_follows_drain() {
    let sched = scheduler();
    assert!(sched.is_main_thread());

    let remote = sched.clone();
    std::thread::spawn(move || {
        remote.drain(Phase::Update);
        assert!(remote.is_main_thread());
    })
    .join()
    .unwrap();
    assert!(!sched.is_main_thread());
}

#[test]
fn test_clear_drops_pending_items() {
    let sched = scheduler();
    let yielded = sched.yield_now();
    let _ = sched.next_frame();
    let _ = sched.delay(Duration::from_secs(1), crate::runtime::scheduler::DelayType::Realtime);
    sched.clear();
    assert_eq!(sched.pending(Phase::Update), 0);
    assert_eq!(sched.pending_frames(), 0);
    assert_eq!(sched.pending_timers(), 0);
    sched.drain(Phase::Update);
    assert!(!yielded.is_terminal());
}

#[test]
fn test_dropping_scheduler_releases_queued_items() {
    let sched = scheduler();
    let weak = sched.downgrade();
    let polled = sched.poll_every(Phase::Update, || None::<crate::runtime::errors::TaskResult<()>>);
    let yielded = sched.yield_now();
    drop(sched);

    assert!(weak.upgrade().is_none());
    assert!(!polled.is_terminal());
    assert!(!yielded.is_terminal());
}

proptest! {
    #[test]
    fn prop_drain_matches_insertion_order(phases in proptest::collection::vec(0usize..Phase::COUNT, 1..40)) {
        let sched = scheduler();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (index, phase) in phases.iter().enumerate() {
            push_log(&sched, Phase::ALL[*phase], &log, &index.to_string());
        }

        for phase in Phase::ALL {
            sched.drain(phase);
        }

        let mut expected = Vec::new();
        for (slot, _) in Phase::ALL.iter().enumerate() {
            for (index, phase) in phases.iter().enumerate() {
                if *phase == slot {
                    expected.push(index.to_string());
                }
            }
        }
        prop_assert_eq!(log.lock().clone(), expected);
    }
}
