use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use parking_lot::Mutex;
use quickcheck::{quickcheck, TestResult};

use phasetask::runtime::{
    clear_unobserved_failure_hook, set_unobserved_failure_hook, CancellationSource,
    CancellationState, DelayType, OwnerLifetime, PhaseScheduler, TaskCell, TaskError, TaskId,
};

use crate::drive;

fn fires_in_registration_order(disposed: Vec<bool>) -> TestResult {
    if disposed.len() > 64 {
        return TestResult::discard();
    }

    let source = CancellationSource::new();
    let fired = Arc::new(Mutex::new(Vec::new()));
    let registrations: Vec<_> = (0..disposed.len())
        .map(|i| {
            let fired = fired.clone();
            source.register(move || fired.lock().push(i))
        })
        .collect();
    for (registration, dispose) in registrations.iter().zip(&disposed) {
        if *dispose {
            source.deregister(registration);
        }
    }

    source.request();
    let expected: Vec<usize> = disposed
        .iter()
        .enumerate()
        .filter(|(_, dispose)| !**dispose)
        .map(|(i, _)| i)
        .collect();
    let fired = fired.lock().clone();
    TestResult::from_bool(fired == expected && source.state() == CancellationState::Finalized)
}

#[test]
fn quickcheck_callbacks_fire_in_registration_order() {
    quickcheck(fires_in_registration_order as fn(Vec<bool>) -> TestResult);
}

#[test]
fn test_owner_teardown_cancels_linked_work() {
    let scheduler = PhaseScheduler::with_workers(1).unwrap();
    let window = OwnerLifetime::new("window");
    let session = CancellationSource::new();
    let scope = CancellationSource::linked(&[window.cancellation_token(), session.token()]);

    let token = scope.token();
    let inner = scheduler.clone();
    let task = scheduler.spawn_with_cancellation(&scope.token(), async move {
        let wait = inner
            .delay(Duration::from_secs(60), DelayType::Unscaled)
            .with_cancellation(&token);
        wait.await.into_result()
    });
    let sibling = scheduler.delay_frames(100).with_cancellation(&scope.token());

    scheduler.tick(Duration::from_millis(16));
    assert!(!task.is_terminal());

    drop(window);
    assert!(scope.is_requested());
    assert!(!session.is_requested());
    assert!(task.is_canceled());
    assert!(sibling.is_canceled());
}

#[test]
fn test_late_binding_to_requested_token_cancels() {
    let owner = OwnerLifetime::new("gone");
    owner.destroy();
    let cell = TaskCell::<u8>::new().with_cancellation(&owner.cancellation_token());
    assert!(cell.is_canceled());
}

#[test]
fn test_unobserved_failure_reaches_hook() {
    let scheduler = PhaseScheduler::with_workers(1).unwrap();
    let seen: Arc<Mutex<Vec<(TaskId, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    set_unobserved_failure_hook(move |error| {
        if let TaskError::UnobservedFailure { task, cause } = error {
            sink.lock().push((*task, cause.to_string()));
        }
    });

    let forgotten = TaskCell::<u8>::new();
    let forgotten_id = forgotten.id();
    forgotten.clone().forget();
    forgotten.fail(anyhow!("lost")).unwrap();

    scheduler.spawn_detached(async { Err(TaskError::failed(anyhow!("detached"))) });
    let settle = scheduler.delay_frames(1);
    drive(&scheduler, &settle);
    clear_unobserved_failure_hook();

    let seen = seen.lock().clone();
    assert!(seen
        .iter()
        .any(|(task, cause)| *task == forgotten_id && cause.contains("lost")));
    assert!(seen.iter().any(|(_, cause)| cause.contains("detached")));
}
