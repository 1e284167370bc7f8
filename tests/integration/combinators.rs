use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use parking_lot::Mutex;

use phasetask::runtime::{
    coroutine_fn, from_callback, from_callback_with_progress, from_tokio, race, timeout, when_all,
    when_all2, CancellationSource, Completer, CoroutineStep, DelayType, Phase, PhaseScheduler,
    Progress, TaskCell, TaskError,
};

use crate::{drive, wait_settled};

#[test]
fn test_when_all_reports_first_failure_by_position() {
    let cells: Vec<TaskCell<u32>> = (0..4).map(|_| TaskCell::new()).collect();
    let all = when_all(cells.clone());

    cells[3].fail(anyhow!("third")).unwrap();
    cells[1].fail(anyhow!("first")).unwrap();
    cells[0].complete(0).unwrap();
    assert!(!all.is_terminal());
    cells[2].complete(2).unwrap();

    let error = wait_settled(&all).into_result().unwrap_err();
    assert_eq!(error.cause().unwrap().to_string(), "first");
}

#[test]
fn test_sequence_awaits_mixed_join() {
    let scheduler = PhaseScheduler::with_workers(2).unwrap();
    let inner = scheduler.clone();

    let task = scheduler.spawn(async move {
        let frames = inner.delay_frames(2);
        let pool = inner.run_on_thread_pool(|| Ok((1..=100u32).sum::<u32>()));
        let start = inner.frame_count();
        let ((), sum) = when_all2(frames, pool).await.into_result()?;
        Ok((sum, inner.frame_count() - start))
    });

    let (sum, frames) = drive(&scheduler, &task).into_result().unwrap();
    assert_eq!(sum, 5050);
    assert!(frames >= 2);
}

#[test]
fn test_race_cancels_losers() {
    let scheduler = PhaseScheduler::with_workers(1).unwrap();
    let source = CancellationSource::new();
    let slow = scheduler.delay(Duration::from_secs(60), DelayType::Unscaled);
    let fast = scheduler.delay_frames(1);
    let winner = race(&source, vec![slow.clone(), fast]);

    let (index, ()) = drive(&scheduler, &winner).into_result().unwrap();
    assert_eq!(index, 1);
    assert!(source.is_requested());
    assert!(slow.is_canceled());
}

#[test]
fn test_timeout_inside_sequence() {
    let scheduler = PhaseScheduler::with_workers(1).unwrap();
    let inner = scheduler.clone();
    let never = TaskCell::<u8>::new();
    let watched = never.clone();

    let task = scheduler.spawn(async move {
        let guarded = timeout(&inner, watched, Duration::from_millis(30), DelayType::Unscaled);
        Ok(guarded.await.into_result())
    });

    let result = drive(&scheduler, &task).into_result().unwrap();
    assert!(matches!(result, Err(TaskError::Timeout(d)) if d == Duration::from_millis(30)));
    assert!(never.is_canceled());
}

#[test]
fn test_coroutine_runs_across_phases() {
    let scheduler = PhaseScheduler::with_workers(1).unwrap();
    let phases = Arc::new(Mutex::new(Vec::new()));
    let seen = phases.clone();
    let step = Arc::new(AtomicU32::new(0));
    let counter = step.clone();

    let routine = scheduler.start_coroutine(coroutine_fn(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        seen.lock().push(n);
        match n {
            0 => CoroutineStep::YieldPhase(Phase::LateUpdate),
            1 => CoroutineStep::WaitFrames(2),
            2 => CoroutineStep::YieldPhase(Phase::EndOfFrame),
            _ => CoroutineStep::Done,
        }
    }));

    assert_eq!(*phases.lock(), vec![0]);
    assert!(drive(&scheduler, &routine).is_completed());
    assert_eq!(*phases.lock(), vec![0, 1, 2, 3]);
    assert_eq!(step.load(Ordering::SeqCst), 4);
}

#[test]
fn test_coroutine_awaits_callback_operation() {
    let scheduler = PhaseScheduler::with_workers(1).unwrap();
    let slot: Arc<Mutex<Option<Completer<()>>>> = Arc::new(Mutex::new(None));
    let pending = slot.clone();
    let mut awaited = false;

    let routine = scheduler.start_coroutine(coroutine_fn(move || {
        if awaited {
            return CoroutineStep::Done;
        }
        awaited = true;
        let pending = pending.clone();
        CoroutineStep::Await(from_callback(move |done| {
            *pending.lock() = Some(done);
        }))
    }));

    for _ in 0..3 {
        scheduler.tick(Duration::from_millis(16));
    }
    assert!(!routine.is_terminal());

    let completer = slot.lock().take().unwrap();
    completer.complete(()).unwrap();
    assert!(drive(&scheduler, &routine).is_completed());
}

#[test]
fn test_callback_loader_reports_progress_until_settled() {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    let (late_tx, late_rx) = crossbeam::channel::bounded::<Progress<u8>>(1);

    let load = from_callback_with_progress(
        move |p: u8| sink.lock().push(p),
        move |done: Completer<String>, progress: Progress<u8>| {
            thread::spawn(move || {
                for pct in [10, 50, 90] {
                    progress.report(pct);
                    thread::sleep(Duration::from_millis(1));
                }
                let _ = late_tx.send(progress);
                let _ = done.complete("payload".to_string());
            });
        },
    );

    assert_eq!(wait_settled(&load).into_result().unwrap(), "payload");
    let late = late_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(!late.is_active());
    late.report(100);
    assert_eq!(*reports.lock(), vec![10, 50, 90]);
}

#[test]
fn test_dropped_completer_fails_operation() {
    let load = from_callback(|done: Completer<u8>| {
        thread::spawn(move || drop(done));
    });
    let error = wait_settled(&load).into_result().unwrap_err();
    assert!(matches!(error, TaskError::OperationFailed(_)));
}

#[test]
fn test_tokio_task_feeds_sequence() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let scheduler = PhaseScheduler::with_workers(1).unwrap();
    let inner = scheduler.clone();
    let handle = runtime.handle().clone();

    let task = scheduler.spawn(async move {
        let join = handle.spawn(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            21u32
        });
        let value = from_tokio(&handle, join).await.into_result()?;
        inner.switch_to_main_thread().await;
        Ok(value * 2)
    });

    assert_eq!(drive(&scheduler, &task).into_result().unwrap(), 42);
}
