//! Unobserved-failure reporting
//!
//! A detached task (see [`TaskCell::forget`](crate::runtime::task::TaskCell::forget))
//! that fails has nobody to re-raise its cause to. Such failures are routed
//! through a process-wide policy that the host sets explicitly.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::runtime::errors::TaskError;

/// What to do with a failure nobody observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnobservedFailurePolicy {
    /// Drop the failure silently.
    Ignore,
    /// Emit an `error!` event.
    #[default]
    Log,
    /// Panic on the reporting thread.
    ///
    /// Reports raised while the thread is already unwinding are logged instead.
    Panic,
}

type Hook = Arc<dyn Fn(&TaskError) + Send + Sync>;

struct Diagnostics {
    policy: UnobservedFailurePolicy,
    hook: Option<Hook>,
}

static DIAGNOSTICS: Lazy<RwLock<Diagnostics>> = Lazy::new(|| {
    RwLock::new(Diagnostics {
        policy: UnobservedFailurePolicy::default(),
        hook: None,
    })
});

/// Set the unobserved-failure policy.
pub fn set_unobserved_failure_policy(policy: UnobservedFailurePolicy) {
    DIAGNOSTICS.write().policy = policy;
}

/// Get the current unobserved-failure policy.
pub fn unobserved_failure_policy() -> UnobservedFailurePolicy {
    DIAGNOSTICS.read().policy
}

/// Install a hook that sees every unobserved failure before the policy runs.
pub fn set_unobserved_failure_hook<F>(hook: F)
where
    F: Fn(&TaskError) + Send + Sync + 'static,
{
    DIAGNOSTICS.write().hook = Some(Arc::new(hook));
}

/// Remove the unobserved-failure hook.
pub fn clear_unobserved_failure_hook() {
    DIAGNOSTICS.write().hook = None;
}

/// Report an unobserved failure.
pub(crate) fn report_unobserved(error: TaskError) {
    // Copy out so the hook can reconfigure diagnostics without deadlocking.
    let (policy, hook) = {
        let diagnostics = DIAGNOSTICS.read();
        (diagnostics.policy, diagnostics.hook.clone())
    };

    if let Some(hook) = hook {
        hook(&error);
    }

    apply_policy(policy, &error);
}

fn apply_policy(
    policy: UnobservedFailurePolicy,
    error: &TaskError,
) {
    match policy {
        UnobservedFailurePolicy::Ignore => {}
        UnobservedFailurePolicy::Log => {
            tracing::error!("{}", error);
        }
        UnobservedFailurePolicy::Panic => {
            if std::thread::panicking() {
                tracing::error!("{}", error);
            } else {
                panic!("{}", error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::errors::panic_message;
    use crate::runtime::task::TaskCell;
    use anyhow::anyhow;
    use parking_lot::Mutex;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    // The hook is process-wide; tests that install one take turns.
    static HOOK_TESTS: Mutex<()> = parking_lot::const_mutex(());

    fn lost(message: &str) -> TaskError {
        TaskError::failed(anyhow!("{}", message))
    }

    #[test]
    fn test_default_policy_is_log() {
        assert_eq!(UnobservedFailurePolicy::default(), UnobservedFailurePolicy::Log);
    }

    #[test]
    fn test_ignore_and_log_do_not_panic() {
        let error = lost("quiet");
        assert!(catch_unwind(AssertUnwindSafe(|| apply_policy(UnobservedFailurePolicy::Ignore, &error))).is_ok());
        assert!(catch_unwind(AssertUnwindSafe(|| apply_policy(UnobservedFailurePolicy::Log, &error))).is_ok());
    }

    #[test]
    fn test_panic_policy_panics_with_the_error() {
        let error = lost("loud");
        let payload = catch_unwind(AssertUnwindSafe(|| apply_policy(UnobservedFailurePolicy::Panic, &error)))
            .expect_err("panic policy must panic");
        assert!(panic_message(&*payload).contains("loud"));
    }

    struct ReportOnDrop(TaskError);

    impl Drop for ReportOnDrop {
        fn drop(&mut self) {
            apply_policy(UnobservedFailurePolicy::Panic, &self.0);
        }
    }

    #[test]
    fn test_panic_policy_logs_while_unwinding() {
        // A second panic here would abort the test process.
        let payload = catch_unwind(|| {
            let _report = ReportOnDrop(lost("during unwind"));
            panic!("outer");
        })
        .expect_err("outer panic propagates");
        assert_eq!(panic_message(&*payload), "outer");
    }

    #[test]
    fn test_dropping_unconsumed_failed_cell_reports() {
        let _turn = HOOK_TESTS.lock();
        let cell = TaskCell::<u8>::new();
        let id = cell.id();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        set_unobserved_failure_hook(move |error| {
            if let TaskError::UnobservedFailure { task, cause } = error {
                if *task == id {
                    sink.lock().push(cause.to_string());
                }
            }
        });

        cell.fail(anyhow!("dropped")).unwrap();
        drop(cell);
        clear_unobserved_failure_hook();

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("dropped"));
    }

    #[test]
    fn test_consumed_failure_is_not_reported() {
        let _turn = HOOK_TESTS.lock();
        let cell = TaskCell::<u8>::new();
        let id = cell.id();
        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        set_unobserved_failure_hook(move |error| {
            if matches!(error, TaskError::UnobservedFailure { task, .. } if *task == id) {
                *sink.lock() += 1;
            }
        });

        cell.fail(anyhow!("handled")).unwrap();
        assert!(cell.try_take_outcome().is_some());
        drop(cell);
        clear_unobserved_failure_hook();

        assert_eq!(*seen.lock(), 0);
    }
}
