//! Worker pools
//!
//! The thread-affinity bridge offloads continuations through the
//! [`WorkerPool`] trait. Two backends are provided: the built-in
//! [`ThreadPool`] (named OS threads fed by a crossbeam MPMC channel) and
//! `rayon::ThreadPool`.
//!
//! Jobs run in any order and in parallel with each other and with the main
//! thread. A job that panics is caught and logged; it never takes a worker
//! down.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::runtime::errors::{panic_message, TaskError};
use crate::runtime::task::TaskCell;

/// A unit of work submitted to a pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Task-submission interface used by the thread-affinity bridge.
pub trait WorkerPool: Send + Sync {
    /// Run `job` on some worker.
    fn execute(
        &self,
        job: Job,
    );

    /// Number of worker threads.
    fn num_workers(&self) -> usize;
}

/// Join-handle submission for any [`WorkerPool`].
pub trait WorkerPoolExt {
    /// Run `f` on the pool. The returned cell completes when `f` returns and
    /// fails with [`TaskError::Panicked`] if it panics.
    fn submit<F>(
        &self,
        f: F,
    ) -> TaskCell<()>
    where
        F: FnOnce() + Send + 'static;
}

impl<P: WorkerPool + ?Sized> WorkerPoolExt for P {
    fn submit<F>(
        &self,
        f: F,
    ) -> TaskCell<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = TaskCell::new();
        let job_handle = handle.clone();
        self.execute(Box::new(move || {
            job_handle.mark_running();
            let settled = match catch_unwind(AssertUnwindSafe(f)) {
                Ok(()) => job_handle.complete(()),
                Err(payload) => job_handle.fail_with(TaskError::from_panic(payload)),
            };
            if let Err(error) = settled {
                warn!("Join handle already settled: {}", error);
            }
        }));
        handle
    }
}

/// Worker pool backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolBackend {
    /// [`ThreadPool`].
    #[default]
    Builtin,
    /// `rayon::ThreadPool`.
    Rayon,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub num_workers: usize,
    /// Worker thread name prefix.
    pub thread_name: String,
    /// Which pool implementation to build.
    pub backend: PoolBackend,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let num_cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            num_workers: num_cpus,
            thread_name: "phasetask-worker".to_string(),
            backend: PoolBackend::Builtin,
        }
    }
}

/// Build the pool described by `config`.
pub fn build_pool(config: &PoolConfig) -> io::Result<Arc<dyn WorkerPool>> {
    match config.backend {
        PoolBackend::Builtin => Ok(Arc::new(ThreadPool::new(config)?)),
        PoolBackend::Rayon => {
            let prefix = config.thread_name.clone();
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.num_workers.max(1))
                .thread_name(move |index| format!("{}-{}", prefix, index))
                .build()
                .map_err(io::Error::other)?;
            Ok(Arc::new(pool))
        }
    }
}

fn run_job(job: Job) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
        error!("Worker job panicked: {}", panic_message(payload.as_ref()));
    }
}

/// Fixed-size pool of named worker threads.
pub struct ThreadPool {
    sender: RwLock<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_workers: usize,
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("num_workers", &self.num_workers)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ThreadPool {
    /// Spawn the worker threads.
    pub fn new(config: &PoolConfig) -> io::Result<Self> {
        let num_workers = config.num_workers.max(1);
        let (sender, receiver) = channel::unbounded::<Job>();

        let mut workers = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, worker_id))
                .spawn(move || Self::worker_loop(worker_id, receiver))?;
            workers.push(worker);
        }
        debug!("Started {} pool workers", num_workers);

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(workers),
            num_workers,
        })
    }

    fn worker_loop(
        worker_id: usize,
        receiver: Receiver<Job>,
    ) {
        while let Ok(job) = receiver.recv() {
            run_job(job);
        }
        debug!("Pool worker {} exiting", worker_id);
    }

    /// Whether the pool still accepts jobs.
    pub fn is_running(&self) -> bool {
        self.sender.read().is_some()
    }

    /// Stop accepting jobs, let workers finish queued ones, and join them.
    pub fn shutdown(&self) {
        drop(self.sender.write().take());

        let current = thread::current().id();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("Pool worker panicked outside a job");
            }
        }
    }
}

impl WorkerPool for ThreadPool {
    fn execute(
        &self,
        job: Job,
    ) {
        let sender = self.sender.read();
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(job).is_err() {
                    warn!("Worker pool disconnected; job dropped");
                }
            }
            None => warn!("Worker pool shut down; job dropped"),
        }
    }

    fn num_workers(&self) -> usize {
        self.num_workers
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl WorkerPool for rayon::ThreadPool {
    fn execute(
        &self,
        job: Job,
    ) {
        // rayon aborts the process on an unhandled panic in `spawn`.
        self.spawn(move || run_job(job));
    }

    fn num_workers(&self) -> usize {
        self.current_num_threads()
    }
}
