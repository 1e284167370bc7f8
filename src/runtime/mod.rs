//! Runtime system
//!
//! This module contains the task cells, cancellation, the phase scheduler
//! and everything built on them.

pub mod bridge;
pub mod cancel;
pub mod combinators;
pub mod diagnostics;
pub mod errors;
pub mod pool;
pub mod scheduler;
pub mod sequence;
pub mod task;

pub use bridge::{on_thread_pool, SwitchToMainThread, SwitchToThreadPool};
pub use cancel::{
    CancellationSource, CancellationState, CancellationToken, DestroyNotifier, OwnerLifetime,
    Registration,
};
pub use combinators::{
    coroutine_fn, from_callback, from_callback_with_progress, from_thread, from_tokio, race,
    timeout, when_all, when_all2, when_all3, when_all4, when_any, Completer, Coroutine,
    CoroutineStep, Progress,
};
pub use diagnostics::{
    clear_unobserved_failure_hook, set_unobserved_failure_hook, set_unobserved_failure_policy,
    unobserved_failure_policy, UnobservedFailurePolicy,
};
pub use errors::{Cause, Outcome, TaskError, TaskResult};
pub use pool::{build_pool, PoolBackend, PoolConfig, ThreadPool, WorkerPool, WorkerPoolExt};
pub use scheduler::{
    DelayType, Phase, PhaseScheduler, SchedulerConfig, SchedulerStats, Timing, WeakScheduler,
};
pub use sequence::{current_affinity, Affinity, CellFuture};
pub use task::{Dispatch, ResumeTarget, TaskCell, TaskId, TaskState};
