//! phasetask: a phase-aware cooperative task runtime
//!
//! Asynchronous work (timers, frame waits, background computation, I/O
//! callbacks) is written as linear `async` sequences and executed inside a
//! host loop that advances through fixed per-frame phases on one logical
//! main thread.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use phasetask::runtime::{DelayType, PhaseScheduler};
//!
//! fn main() -> phasetask::Result<()> {
//!     let scheduler = PhaseScheduler::with_workers(2)?;
//!     let inner = scheduler.clone();
//!     let task = scheduler.spawn(async move {
//!         inner.delay(Duration::from_millis(50), DelayType::Scaled).await.into_result()?;
//!         inner.switch_to_thread_pool().await;
//!         let answer = 6 * 7;
//!         inner.switch_to_main_thread().await;
//!         Ok(answer)
//!     });
//!
//!     while !task.is_terminal() {
//!         scheduler.tick(Duration::from_millis(16));
//!     }
//!     Ok(())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/phasetask")]
#![warn(rust_2018_idioms)]

pub mod demo;
pub mod runtime;
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use thiserror::Error;

use tracing::debug;

use crate::runtime::diagnostics::set_unobserved_failure_policy;
use crate::runtime::PhaseScheduler;
use crate::util::config::RuntimeConfig;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "phasetask";

/// Build a scheduler from a resolved configuration.
///
/// Installs the configured unobserved-failure policy and starts the worker
/// pool. The calling thread becomes the main thread.
pub fn build_scheduler(config: &RuntimeConfig) -> Result<PhaseScheduler> {
    set_unobserved_failure_policy(config.diagnostics.unobserved_failure);
    let scheduler = PhaseScheduler::with_pool_config(config.scheduler.clone(), &config.pool)
        .context("Failed to start worker pool")?;
    debug!(
        "Scheduler ready: {} workers, timer phase {}",
        scheduler.pool().num_workers(),
        scheduler.config().timer_phase
    );
    Ok(scheduler)
}
