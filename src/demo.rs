//! Simulated host loop
//!
//! Drives a scheduler the way a game engine would and runs a handful of
//! sequences that exercise frame waits, thread switches, a callback-based
//! loader with progress, a coroutine and owner-scoped cancellation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use crossbeam::channel;
use parking_lot::Mutex;
use tracing::info;

use crate::runtime::{
    coroutine_fn, from_callback_with_progress, when_all2, Completer, CoroutineStep, DelayType,
    Outcome, OwnerLifetime, PhaseScheduler, Progress,
};

/// Host loop settings.
#[derive(Debug, Clone)]
pub struct DemoOptions {
    /// Upper bound on simulated frames.
    pub frames: u32,
    /// Frame delta fed to the scheduler.
    pub delta: Duration,
    /// Real time slept after each frame.
    pub frame_sleep: Duration,
    /// Frame at which the demo owner is destroyed.
    pub destroy_owner_at: u32,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            frames: 600,
            delta: Duration::from_millis(16),
            frame_sleep: Duration::from_millis(1),
            destroy_owner_at: 5,
        }
    }
}

/// What the demo observed.
#[derive(Debug, Clone, Default)]
pub struct DemoReport {
    /// Frames the host loop ran.
    pub frames_run: u32,
    /// Sum computed on the worker pool.
    pub pool_sum: u64,
    /// Whether the code after switching back ran on the host thread.
    pub resumed_on_host: bool,
    /// Bytes returned by the simulated loader.
    pub loaded_bytes: usize,
    /// Progress values the loader reported.
    pub progress: Vec<f32>,
    /// Steps the coroutine ran.
    pub coroutine_steps: u32,
    /// Whether destroying the owner canceled its pending pool work.
    pub owner_work_canceled: bool,
}

/// Run the demo on `scheduler`, which must be driven from this thread.
pub fn run_demo(
    scheduler: &PhaseScheduler,
    options: &DemoOptions,
) -> anyhow::Result<DemoReport> {
    let host = thread::current().id();

    let compute = {
        let sched = scheduler.clone();
        scheduler.spawn(async move {
            sched.delay_frames(3).await.into_result()?;
            sched
                .delay(Duration::from_millis(40), DelayType::Scaled)
                .await
                .into_result()?;
            sched.switch_to_thread_pool().await;
            let sum: u64 = (1..=10_000u64).sum();
            sched.switch_to_main_thread().await;
            Ok((sum, thread::current().id() == host))
        })
    };

    let progress_seen = Arc::new(Mutex::new(Vec::new()));
    let progress_sink = progress_seen.clone();
    let load = from_callback_with_progress(
        move |p: f32| {
            info!("Loading {:.0}%", p * 100.0);
            progress_sink.lock().push(p);
        },
        |done: Completer<Vec<u8>>, progress: Progress<f32>| {
            thread::spawn(move || {
                for step in 1..=4 {
                    thread::sleep(Duration::from_millis(2));
                    progress.report(step as f32 / 4.0);
                }
                let _ = done.complete(vec![0u8; 1024]);
            });
        },
    );

    let steps = Arc::new(AtomicU32::new(0));
    let coroutine = {
        let steps = steps.clone();
        scheduler.start_coroutine(coroutine_fn(move || {
            if steps.fetch_add(1, Ordering::SeqCst) < 4 {
                CoroutineStep::WaitFrames(1)
            } else {
                CoroutineStep::Done
            }
        }))
    };

    let owner = OwnerLifetime::new("demo-owner");
    let (release, released) = channel::bounded::<()>(1);
    let owned = {
        let sched = scheduler.clone();
        let token = owner.cancellation_token();
        scheduler.spawn_with_cancellation(&owner.cancellation_token(), async move {
            let work = sched.run_on_thread_pool_with_cancellation(&token, move || {
                let _ = released.recv_timeout(Duration::from_secs(1));
                Ok(42u32)
            });
            work.await.into_result()
        })
    };

    let both = when_all2(compute, load);
    let mut frames_run = 0;
    while frames_run < options.frames {
        scheduler.tick(options.delta);
        frames_run += 1;

        if frames_run == options.destroy_owner_at {
            owner.destroy();
            let _ = release.try_send(());
        }
        if both.is_terminal() && coroutine.is_terminal() && owned.is_terminal() {
            break;
        }
        thread::sleep(options.frame_sleep);
    }
    info!("Host loop ran {} frames", frames_run);

    let ((pool_sum, resumed_on_host), bytes) = match both.try_take_outcome() {
        Some(outcome) => outcome.into_result().context("Demo sequences failed")?,
        None => {
            scheduler.clear();
            anyhow::bail!("Demo sequences did not finish in {} frames", frames_run)
        }
    };

    let progress = progress_seen.lock().clone();
    Ok(DemoReport {
        frames_run,
        pool_sum,
        resumed_on_host,
        loaded_bytes: bytes.len(),
        progress,
        coroutine_steps: steps.load(Ordering::SeqCst),
        owner_work_canceled: matches!(owned.try_take_outcome(), Some(Outcome::Canceled)),
    })
}
