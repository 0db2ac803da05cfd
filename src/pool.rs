//! Fixed-size worker pool with a re-entrant dispatch loop.
//!
//! Workers drain three priority queues and park on the pool condvar when
//! idle. The part that matters for correctness of future resolution is
//! [`PoolShared::dispatch_while`]: a worker that must block on a future's
//! result donates its call stack back to the pool by re-entering the same
//! dispatch mechanism, so nested future dependencies cannot strand the pool
//! with every worker asleep.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use lazy_static::lazy_static;
use tracing::{debug, error};

use crate::config::PoolConfig;
use crate::error::InvocationError;
use crate::thread::{Thread, ThreadKind};

/// Queue priority of a pool task. Queues are drained highest first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Priority {
    Highest,
    #[default]
    Medium,
    /// Used for future-backed tasks so a waiting consumer gets a chance to
    /// steal the task before a worker picks it up.
    Lowest,
}

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    enabled: bool,
    idle_workers: usize,
}

/// State shared between the pool handle and its workers. Nameable outside
/// the crate through [`crate::ThreadKind::PoolWorker`], but opaque there.
pub struct PoolShared {
    highest: SegQueue<Job>,
    medium: SegQueue<Job>,
    lowest: SegQueue<Job>,
    state: Mutex<PoolState>,
    cv: Condvar,
}

impl PoolShared {
    fn new() -> Self {
        Self {
            highest: SegQueue::new(),
            medium: SegQueue::new(),
            lowest: SegQueue::new(),
            state: Mutex::new(PoolState { enabled: true, idle_workers: 0 }),
            cv: Condvar::new(),
        }
    }

    fn push(&self, job: Job, priority: Priority) {
        match priority {
            Priority::Highest => self.highest.push(job),
            Priority::Medium => self.medium.push(job),
            Priority::Lowest => self.lowest.push(job),
        }
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.idle_workers > 0 {
            self.cv.notify_one();
        }
    }

    fn pop_job(&self) -> Option<Job> {
        self.highest
            .pop()
            .or_else(|| self.medium.pop())
            .or_else(|| self.lowest.pop())
    }

    fn has_pending(&self) -> bool {
        !self.highest.is_empty() || !self.medium.is_empty() || !self.lowest.is_empty()
    }

    fn pending_count(&self) -> usize {
        self.highest.len() + self.medium.len() + self.lowest.len()
    }

    /// Wakes every parked worker so each re-checks its wait predicate.
    pub(crate) fn wake_up_all(&self) {
        let _state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.cv.notify_all();
    }

    /// One task failing must never take a shared worker thread down with it.
    fn run_job(job: Job) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            let failure = InvocationError::from_panic(payload);
            error!("uncaught failure in pool task: {failure}");
        }
    }

    /// Re-enters the dispatch loop on the calling worker thread, executing
    /// other queued tasks while `still_waiting` reports true.
    ///
    /// Parking inside this loop is bounded: the settlement waker that calls
    /// [`wake_up_all`](Self::wake_up_all) may fire between the predicate
    /// check and the park, and a missed wakeup must not strand the worker.
    pub(crate) fn dispatch_while(&self, mut still_waiting: impl FnMut() -> bool) {
        loop {
            if !still_waiting() {
                return;
            }
            if let Some(job) = self.pop_job() {
                Self::run_job(job);
                continue;
            }
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.enabled {
                return;
            }
            if self.has_pending() {
                continue;
            }
            state.idle_workers += 1;
            let (guard, _) = self
                .cv
                .wait_timeout(state, Duration::from_millis(50))
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            state.idle_workers -= 1;
        }
    }

    fn worker_main(&self) {
        loop {
            while let Some(job) = self.pop_job() {
                Self::run_job(job);
                // A cancellation that raced the task's completion leaves a
                // stale interrupt request; it must not leak into the next
                // task.
                Thread::current().reset_interrupt_flag();
            }
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.enabled {
                return;
            }
            if self.has_pending() {
                continue;
            }
            state.idle_workers += 1;
            state = self.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
            state.idle_workers -= 1;
            if !state.enabled {
                return;
            }
        }
    }
}

/// Fixed-size thread pool.
///
/// Dropping the pool disables the queues, wakes every worker and joins them;
/// tasks already being executed run to completion.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<Thread>>,
}

impl ThreadPool {
    /// Creates a pool with `workers` worker threads.
    pub fn new(workers: usize) -> Self {
        Self::with_config(PoolConfig {
            workers,
            ..PoolConfig::default()
        })
    }

    pub fn with_config(config: PoolConfig) -> Self {
        let shared = Arc::new(PoolShared::new());
        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let main = Arc::clone(&shared);
            let mut worker = Thread::with_kind(
                Some(format!("{}{}", config.thread_name_prefix, index + 1)),
                ThreadKind::PoolWorker(Arc::downgrade(&shared)),
                move || {
                    main.worker_main();
                    Ok(())
                },
            );
            if let Err(e) = worker.start() {
                error!("failed to start pool worker {}: {e}", index + 1);
                continue;
            }
            workers.push(worker);
        }
        debug!(workers = workers.len(), "thread pool started");
        Self { shared, workers: Mutex::new(workers) }
    }

    /// The process-wide pool, sized from [`PoolConfig::default`].
    pub fn global() -> &'static ThreadPool {
        lazy_static! {
            static ref GLOBAL: ThreadPool = ThreadPool::with_config(PoolConfig::default());
        }
        &GLOBAL
    }

    /// Schedules a fire-and-forget task at [`Priority::Medium`].
    pub fn run<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.run_with_priority(f, Priority::Medium);
    }

    pub fn run_with_priority<F: FnOnce() + Send + 'static>(&self, f: F, priority: Priority) {
        self.shared.push(Box::new(f), priority);
    }

    /// Wakes all parked workers; used when a future resolves so waiters
    /// re-check their predicates promptly.
    pub fn wake_up_all(&self) {
        self.shared.wake_up_all();
    }

    /// Discards all tasks not yet claimed by a worker.
    pub fn clear(&self) {
        while self.shared.pop_job().is_some() {}
    }

    pub fn pending_task_count(&self) -> usize {
        self.shared.pending_count()
    }

    pub fn idle_worker_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .idle_workers
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            state.enabled = false;
            self.shared.cv.notify_all();
        }
        let mut workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for worker in &mut workers {
            let _ = worker.join();
        }
    }
}
