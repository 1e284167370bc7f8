use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use crossbeam::channel;
use parking_lot::Mutex;

use phasetask::runtime::{
    from_thread, on_thread_pool, OwnerLifetime, PhaseScheduler, TaskError, TaskResult,
};

use crate::drive;

#[test]
fn test_round_trip_resumes_on_draining_thread() {
    let scheduler = PhaseScheduler::with_workers(2).unwrap();
    let host = thread::current().id();
    let inner = scheduler.clone();

    let task = scheduler.spawn(async move {
        inner.switch_to_thread_pool().await;
        let worker = thread::current().id();
        let on_pool = on_thread_pool();
        inner.switch_to_main_thread().await;
        Ok((worker, on_pool, thread::current().id()))
    });

    let (worker, on_pool, resumed) = drive(&scheduler, &task).into_result().unwrap();
    assert!(on_pool);
    assert_ne!(worker, host);
    assert_eq!(resumed, host);
}

#[test]
fn test_repeated_switches_stay_ordered() {
    let scheduler = PhaseScheduler::with_workers(3).unwrap();
    let inner = scheduler.clone();
    let trace = Arc::new(Mutex::new(Vec::new()));
    let log = trace.clone();

    let task = scheduler.spawn(async move {
        for round in 0..3 {
            log.lock().push((round, on_thread_pool()));
            inner.switch_to_thread_pool().await;
            log.lock().push((round, on_thread_pool()));
            inner.switch_to_main_thread().await;
        }
        Ok(())
    });

    assert!(drive(&scheduler, &task).is_completed());
    let expected: Vec<_> = (0..3).flat_map(|round| [(round, false), (round, true)]).collect();
    assert_eq!(*trace.lock(), expected);
}

#[test]
fn test_destroying_owner_cancels_pending_pool_work() {
    let scheduler = PhaseScheduler::with_workers(1).unwrap();
    let owner = OwnerLifetime::new("panel");
    let (release, released) = channel::bounded::<()>(1);
    let (started_tx, started) = channel::bounded::<()>(1);

    let inner = scheduler.clone();
    let token = owner.cancellation_token();
    let task = scheduler.spawn_with_cancellation(&owner.cancellation_token(), async move {
        let work = inner.run_on_thread_pool_with_cancellation(&token, move || {
            let _ = started_tx.send(());
            let _ = released.recv_timeout(Duration::from_secs(5));
            Ok(1u32)
        });
        work.await.into_result()
    });

    started.recv_timeout(Duration::from_secs(5)).unwrap();
    scheduler.tick(Duration::from_millis(16));
    assert!(!task.is_terminal());

    owner.destroy();
    assert!(task.is_canceled());

    // The blocked job finishes and the worker takes new jobs.
    release.send(()).unwrap();
    let next = scheduler.run_on_thread_pool(|| Ok(7));
    assert_eq!(drive(&scheduler, &next).into_result().unwrap(), 7);
}

#[test]
fn test_pool_failure_reaches_awaiting_sequence() {
    let scheduler = PhaseScheduler::with_workers(2).unwrap();
    let inner = scheduler.clone();

    let task = scheduler.spawn(async move {
        let work = inner.run_on_thread_pool(|| -> TaskResult<u32> { Err(TaskError::failed(anyhow!("disk full"))) });
        Ok(work.await)
    });

    let outcome = drive(&scheduler, &task).into_result().unwrap();
    assert!(outcome.is_failed());
    assert!(outcome.err().unwrap().to_string().contains("disk full"));
}

#[test]
fn test_thread_adapter_joins_on_update() {
    let scheduler = PhaseScheduler::with_workers(1).unwrap();
    let worker = thread::spawn(|| {
        thread::sleep(Duration::from_millis(5));
        "done"
    });
    let cell = from_thread(&scheduler, worker);
    assert_eq!(drive(&scheduler, &cell).into_result().unwrap(), "done");
}
