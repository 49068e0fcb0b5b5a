//! Bounded OS-thread worker pool.
//!
//! A fixed set of named threads drain one FIFO job queue. Submission never
//! blocks: a full queue or a stopped pool hands the job back to the caller
//! so it can be requeued elsewhere. `pause` parks the pool between jobs,
//! which is how limits are swapped without a job observing half of them.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

/// Unit of work run on a pool thread.
pub trait Job: Send + 'static {
    fn run(self);
}

/// A boxed closure job.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

impl Job for Task {
    fn run(self) {
        self()
    }
}

/// Called on each worker thread just before it exits.
pub type ExitHook = Arc<dyn Fn() + Send + Sync>;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads (0 = one per CPU).
    pub num_threads: usize,
    /// Maximum queued jobs not yet picked up by a thread.
    pub queue_size: usize,
    /// Thread stack size in bytes (0 = default).
    pub stack_size: usize,
    pub thread_name_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            queue_size: 1024,
            stack_size: 0,
            thread_name_prefix: "ldap-worker".to_string(),
        }
    }
}

/// Errors for worker pool operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("worker pool is shut down")]
    PoolShutdown,

    #[error("job queue is full")]
    QueueFull,

    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawnFailed(String),
}

/// A rejected submission. The job comes back untouched.
pub struct SubmitError<J> {
    pub job: J,
    pub reason: WorkerPoolError,
}

impl<J> std::fmt::Debug for SubmitError<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitError").field("reason", &self.reason).finish_non_exhaustive()
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerPoolStats {
    pub threads: usize,
    pub active: usize,
    pub queued: usize,
    pub paused: bool,
    pub submitted: u64,
    pub executed: u64,
    pub rejected: u64,
    pub panicked: u64,
    pub avg_exec_time_us: u64,
}

struct QueueState<J> {
    jobs: VecDeque<J>,
    active: usize,
    paused: bool,
    shutdown: bool,
}

struct Shared<J> {
    state: Mutex<QueueState<J>>,
    work_cv: Condvar,
    idle_cv: Condvar,
    queue_size: usize,
    submitted: AtomicU64,
    executed: AtomicU64,
    rejected: AtomicU64,
    panicked: AtomicU64,
    avg_exec_time_us: AtomicU64,
}

/// Fixed-size pool of worker threads.
pub struct WorkerPool<J: Job> {
    shared: Arc<Shared<J>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl<J: Job> WorkerPool<J> {
    pub fn new(config: WorkerPoolConfig) -> Result<Self, WorkerPoolError> {
        Self::spawn(config, None)
    }

    /// Create a pool whose threads run `hook` on exit.
    pub fn with_exit_hook(config: WorkerPoolConfig, hook: ExitHook) -> Result<Self, WorkerPoolError> {
        Self::spawn(config, Some(hook))
    }

    fn spawn(config: WorkerPoolConfig, hook: Option<ExitHook>) -> Result<Self, WorkerPoolError> {
        let num_threads = if config.num_threads == 0 {
            num_cpus::get().max(1)
        } else {
            config.num_threads
        };
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                jobs: VecDeque::with_capacity(config.queue_size),
                active: 0,
                paused: false,
                shutdown: false,
            }),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            queue_size: config.queue_size.max(1),
            submitted: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            avg_exec_time_us: AtomicU64::new(0),
        });

        let pool = Self { shared, handles: Mutex::new(Vec::with_capacity(num_threads)), num_threads };
        for id in 0..num_threads {
            let shared = pool.shared.clone();
            let hook = hook.clone();
            let mut builder = thread::Builder::new().name(format!("{}-{}", config.thread_name_prefix, id));
            if config.stack_size > 0 {
                builder = builder.stack_size(config.stack_size);
            }
            let spawned = builder.spawn(move || {
                worker_loop(&shared);
                if let Some(hook) = hook {
                    hook();
                }
            });
            match spawned {
                Ok(handle) => pool.handles.lock().push(handle),
                Err(e) => {
                    // Dropping the pool stops the threads already started.
                    return Err(WorkerPoolError::ThreadSpawnFailed(e.to_string()));
                }
            }
        }
        tracing::debug!(threads = num_threads, queue_size = pool.shared.queue_size, "worker pool started");
        Ok(pool)
    }

    /// Queue a job without blocking.
    pub fn submit(&self, job: J) -> Result<(), SubmitError<J>> {
        let mut state = self.shared.state.lock();
        let reason = if state.shutdown {
            WorkerPoolError::PoolShutdown
        } else if state.jobs.len() >= self.shared.queue_size {
            WorkerPoolError::QueueFull
        } else {
            state.jobs.push_back(job);
            drop(state);
            self.shared.submitted.fetch_add(1, Ordering::Relaxed);
            self.shared.work_cv.notify_one();
            return Ok(());
        };
        drop(state);
        self.shared.rejected.fetch_add(1, Ordering::Relaxed);
        Err(SubmitError { job, reason })
    }

    /// Number of worker threads.
    pub fn capacity(&self) -> usize {
        self.num_threads
    }

    pub fn queue_capacity(&self) -> usize {
        self.shared.queue_size
    }

    /// Stop starting new jobs and wait for running ones to finish.
    ///
    /// Submissions are still queued while paused. Must not be called from a
    /// worker thread of this pool.
    pub fn pause(&self) {
        let mut state = self.shared.state.lock();
        state.paused = true;
        while state.active > 0 {
            self.shared.idle_cv.wait(&mut state);
        }
    }

    pub fn resume(&self) {
        self.shared.state.lock().paused = false;
        self.shared.work_cv.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Refuse new jobs, let the threads drain the queue, and join them.
    ///
    /// Safe to call from a worker thread; that thread is not joined.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.paused = false;
        }
        self.shared.work_cv.notify_all();

        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("worker thread exited abnormally");
            }
        }
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let state = self.shared.state.lock();
        WorkerPoolStats {
            threads: self.num_threads,
            active: state.active,
            queued: state.jobs.len(),
            paused: state.paused,
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            executed: self.shared.executed.load(Ordering::Relaxed),
            rejected: self.shared.rejected.load(Ordering::Relaxed),
            panicked: self.shared.panicked.load(Ordering::Relaxed),
            avg_exec_time_us: self.shared.avg_exec_time_us.load(Ordering::Relaxed),
        }
    }
}

impl<J: Job> Drop for WorkerPool<J> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<J: Job>(shared: &Shared<J>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if !state.paused {
                    if let Some(job) = state.jobs.pop_front() {
                        state.active += 1;
                        break Some(job);
                    }
                }
                if state.shutdown && state.jobs.is_empty() {
                    break None;
                }
                shared.work_cv.wait(&mut state);
            }
        };
        let Some(job) = job else { break };

        let start = Instant::now();
        if panic::catch_unwind(AssertUnwindSafe(|| job.run())).is_err() {
            shared.panicked.fetch_add(1, Ordering::Relaxed);
            tracing::error!("job panicked on worker thread");
        }
        let exec_us = start.elapsed().as_micros() as u64;
        shared.executed.fetch_add(1, Ordering::Relaxed);
        // Rolling average; a lost update under contention is acceptable.
        let avg = shared.avg_exec_time_us.load(Ordering::Relaxed);
        let next = if avg == 0 { exec_us } else { (avg * 9 + exec_us) / 10 };
        shared.avg_exec_time_us.store(next, Ordering::Relaxed);

        let mut state = shared.state.lock();
        state.active -= 1;
        if state.active == 0 {
            shared.idle_cv.notify_all();
        }
    }
}
