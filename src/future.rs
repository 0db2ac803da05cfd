//! Shared, cancellable, observable futures.
//!
//! A [`Future`] is a reference-counted handle to a promise slot. The slot
//! either owns a task claimed and executed exactly once by whichever thread
//! gets there first (a pool worker, or a waiting consumer stealing it), or it
//! is manually driven through [`Future::supply_value`] /
//! [`Future::supply_err`].
//!
//! Resolution is write-once: exactly one of value, error or interrupted is
//! ever recorded, and the value/error slots are `OnceLock`s so observers can
//! read them without the state mutex once set. The mutex still linearizes
//! every transition.

use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use tracing::error;

use crate::error::{FutureError, Interrupted, InvocationError, TaskAbort, TaskResult};
use crate::interrupt::InterruptibleCondvar;
use crate::pool::{Priority, ThreadPool};
use crate::thread::{Thread, ThreadHandle, ThreadKind};

type TaskFn<T> = Box<dyn FnOnce() -> TaskResult<T> + Send + 'static>;
type SuccessFn<T> = Box<dyn FnOnce(&T) + Send + 'static>;
type ErrorFn = Box<dyn FnOnce(&InvocationError) + Send + 'static>;
type WakeFn = Box<dyn FnOnce() + Send + 'static>;

/// Controls [`Future::wait_with`] behaviour.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitFlags {
    /// If the task has not been picked up yet, run it on the calling thread
    /// instead of sleeping. Which thread ends up executing a task under this
    /// flag is deliberately non-deterministic.
    pub allow_inline_execution: bool,
    /// If the calling thread is a pool worker, re-enter its dispatch loop
    /// instead of idling the worker.
    pub allow_worker_reentrancy: bool,
}

impl WaitFlags {
    pub const JUST_WAIT: WaitFlags = WaitFlags {
        allow_inline_execution: false,
        allow_worker_reentrancy: false,
    };
    pub const DEFAULT: WaitFlags = WaitFlags {
        allow_inline_execution: true,
        allow_worker_reentrancy: true,
    };
}

impl Default for WaitFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

struct ControlCell<T> {
    /// Present only until claimed; its presence is the "not picked up yet"
    /// signal.
    task: Option<TaskFn<T>>,
    /// Remembers that a task was ever attached, for misuse checks on the
    /// manual supply path.
    had_task: bool,
    /// The thread that claimed the task; set at most once, target of
    /// interruption on cancel.
    thread: Option<ThreadHandle>,
    cancelled: bool,
    /// Set by the executing side after the task body finished, whatever the
    /// outcome; the cancel-then-join in drop waits on this.
    task_done: bool,
    on_success: Vec<SuccessFn<T>>,
    on_error: Vec<ErrorFn>,
    /// One-shot wakeups fired on any settlement, with or without a result;
    /// registered by re-entrant pool waits.
    wakers: Vec<WakeFn>,
}

struct SharedState<T> {
    value: OnceLock<T>,
    error: OnceLock<InvocationError>,
    interrupted: AtomicBool,
    cell: Mutex<ControlCell<T>>,
    cv: InterruptibleCondvar,
}

impl<T: Send + Sync + 'static> SharedState<T> {
    fn new(task: Option<TaskFn<T>>) -> Self {
        let had_task = task.is_some();
        Self {
            value: OnceLock::new(),
            error: OnceLock::new(),
            interrupted: AtomicBool::new(false),
            cell: Mutex::new(ControlCell {
                task,
                had_task,
                thread: None,
                cancelled: false,
                task_done: false,
                on_success: Vec::new(),
                on_error: Vec::new(),
                wakers: Vec::new(),
            }),
            cv: InterruptibleCondvar::new(),
        }
    }

    fn has_result(&self) -> bool {
        self.value.get().is_some()
            || self.error.get().is_some()
            || self.interrupted.load(Ordering::Acquire)
    }

    fn has_value(&self) -> bool {
        self.value.get().is_some()
    }

    /// True once waiting is pointless: a terminal state was recorded, or the
    /// future is cancelled with no execution left that could record one.
    fn resolution_settled(&self) -> bool {
        if self.has_result() {
            return true;
        }
        let cell = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
        cell.cancelled && (cell.thread.is_none() || cell.task_done)
    }

    /// Claims task execution for `thread`. Fails if another thread already
    /// claimed it or the future was cancelled first.
    fn try_claim(&self, thread: ThreadHandle) -> bool {
        let mut cell = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
        if cell.cancelled || cell.thread.is_some() {
            return false;
        }
        cell.thread = Some(thread);
        true
    }

    /// Monotonic; forbids new claims and requests interruption of an
    /// already-claimed, still-unresolved task. Never discards a result.
    fn cancel(&self) {
        let mut cell = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
        if cell.cancelled {
            return;
        }
        cell.cancelled = true;
        if let Some(thread) = &cell.thread {
            if !self.has_result() {
                thread.interrupt();
            }
        }
        drop(cell);
        self.cv.notify_all();
    }

    /// Stores the value, signals waiters and fires the success chain once.
    /// Callbacks run with no lock held, so they may re-enter the future.
    fn supply(&self, value: T) {
        let mut cell = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
        if self.has_result() {
            debug_assert!(false, "future resolved twice");
            return;
        }
        let stored = self.value.set(value);
        debug_assert!(stored.is_ok());
        self.cv.notify_all();
        let callbacks = if cell.cancelled {
            Vec::new()
        } else {
            std::mem::take(&mut cell.on_success)
        };
        let wakers = std::mem::take(&mut cell.wakers);
        drop(cell);
        for wake in wakers {
            wake();
        }
        if let Some(value) = self.value.get() {
            for callback in callbacks {
                invoke_success(callback, value);
            }
        }
    }

    /// Captures a task failure and fires the error chain once. A cancelled
    /// future discards the failure (its consumers are leaving anyway).
    fn report_error(&self, failure: InvocationError) {
        let mut cell = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
        if cell.cancelled || self.has_result() {
            return;
        }
        let stored = self.error.set(failure);
        debug_assert!(stored.is_ok());
        self.cv.notify_all();
        let callbacks = std::mem::take(&mut cell.on_error);
        let wakers = std::mem::take(&mut cell.wakers);
        drop(cell);
        for wake in wakers {
            wake();
        }
        if let Some(failure) = self.error.get() {
            for callback in callbacks {
                invoke_error(callback, failure);
            }
        }
    }

    fn report_interrupted(&self) {
        let mut cell = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
        self.interrupted.store(true, Ordering::Release);
        self.cv.notify_all();
        let wakers = std::mem::take(&mut cell.wakers);
        drop(cell);
        for wake in wakers {
            wake();
        }
    }

    /// Also drains the wakers: a cancelled task that aborts records no
    /// result, and this is the only settlement its waiters will see.
    fn mark_task_done(&self) {
        let mut cell = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
        cell.task_done = true;
        let wakers = std::mem::take(&mut cell.wakers);
        drop(cell);
        self.cv.notify_all();
        for wake in wakers {
            wake();
        }
    }

    /// Exactly-once claim-and-run. Returns true when the future reached a
    /// terminal state through this call (or its handles are already gone),
    /// false when execution belongs to someone else.
    fn try_execute(weak: &Weak<FutureGuard<T>>) -> bool {
        let Some(guard) = weak.upgrade() else {
            // Future discarded; nothing to do.
            return true;
        };
        // Strong reference to the state itself: keeps the promise slot's
        // memory alive through write-back even if every handle is dropped
        // mid-execution.
        let state = Arc::clone(&guard.state);
        if state.value.get().is_some() {
            return false;
        }
        if !state.try_claim(Thread::current()) {
            return false;
        }
        let task = {
            let mut cell = state.cell.lock().unwrap_or_else(PoisonError::into_inner);
            cell.task.take()
        };
        let Some(task) = task else {
            // Claimed a manual future with nothing to run; release any
            // join-side waiters and bail.
            state.mark_task_done();
            return false;
        };
        // Release the handle before running so that dropping the last
        // consumer handle during execution can proceed with cancellation.
        drop(guard);

        match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(value)) => {
                if weak.upgrade().is_some() {
                    state.supply(value);
                }
            }
            Ok(Err(TaskAbort::Interrupted(_))) => {
                if weak.upgrade().is_some() {
                    state.report_interrupted();
                }
            }
            Ok(Err(TaskAbort::Failed(e))) => {
                if weak.upgrade().is_some() {
                    state.report_error(InvocationError::from_error(e));
                }
            }
            Err(payload) => {
                if weak.upgrade().is_some() {
                    state.report_error(InvocationError::from_panic(payload));
                }
            }
        }
        state.mark_task_done();
        true
    }

}

fn invoke_success<T>(callback: SuccessFn<T>, value: &T) {
    if panic::catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
        error!("future on_success callback panicked");
    }
}

fn invoke_error(callback: ErrorFn, failure: &InvocationError) {
    if panic::catch_unwind(AssertUnwindSafe(|| callback(failure))).is_err() {
        error!("future on_error callback panicked");
    }
}

/// Owns the shared state on behalf of all `Future` handles. Dropping the
/// last handle cancels the task and joins in-flight execution before the
/// state can be released.
struct FutureGuard<T> {
    state: Arc<SharedState<T>>,
}

impl<T> Drop for FutureGuard<T> {
    // Cancel, then join in-flight execution. Spelled out here rather than
    // delegating because the drop glue has no `T: Send + Sync` bounds.
    fn drop(&mut self) {
        let state = &self.state;
        {
            let mut cell = state.cell.lock().unwrap_or_else(PoisonError::into_inner);
            if !cell.cancelled {
                cell.cancelled = true;
                if let Some(thread) = &cell.thread {
                    let resolved = state.value.get().is_some()
                        || state.error.get().is_some()
                        || state.interrupted.load(Ordering::Acquire);
                    if !resolved {
                        thread.interrupt();
                    }
                }
            }
        }
        state.cv.notify_all();

        let current = Thread::current();
        let mut rethrow_interrupted = false;
        let mut cell = state.cell.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let in_flight = cell
                .thread
                .as_ref()
                .is_some_and(|thread| !Arc::ptr_eq(thread, &current));
            if !in_flight || cell.task_done {
                break;
            }
            match state.cv.wait(cell) {
                Ok(guard) => cell = guard,
                Err(Interrupted) => {
                    rethrow_interrupted = true;
                    cell = state.cell.lock().unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        drop(cell);
        if rethrow_interrupted {
            Interrupted.rethrow_later();
        }
    }
}

/// Reference-counted handle to a value that becomes available later.
///
/// Clones share the same promise slot. When the last handle is dropped the
/// task is cancelled and any in-flight execution is joined, so a task body
/// can never outlive every observer of its result.
pub struct Future<T> {
    guard: Arc<FutureGuard<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self { guard: Arc::clone(&self.guard) }
    }
}

impl<T: Send + Sync + 'static> Future<T> {
    /// A manually driven future; resolve it with
    /// [`supply_value`](Self::supply_value) or
    /// [`supply_err`](Self::supply_err).
    pub fn new() -> Self {
        Self::from_state(SharedState::new(None))
    }

    /// A future that is already resolved.
    pub fn with_value(value: T) -> Self {
        let future = Self::new();
        future.guard.state.supply(value);
        future
    }

    pub(crate) fn with_task<F>(task: F) -> Self
    where
        F: FnOnce() -> TaskResult<T> + Send + 'static,
    {
        Self::from_state(SharedState::new(Some(Box::new(task))))
    }

    fn from_state(state: SharedState<T>) -> Self {
        Self {
            guard: Arc::new(FutureGuard { state: Arc::new(state) }),
        }
    }

    fn state(&self) -> &SharedState<T> {
        &self.guard.state
    }

    /// True once a value, error or interruption has been recorded.
    pub fn has_result(&self) -> bool {
        self.state().has_result()
    }

    /// True if the operation completed successfully and the value can be
    /// obtained without waiting.
    pub fn has_value(&self) -> bool {
        self.state().has_value()
    }

    /// True if a call to [`wait`](Self::wait) could block.
    pub fn is_wait_needed(&self) -> bool {
        let state = self.state();
        if state.has_result() {
            return false;
        }
        let cell = state.cell.lock().unwrap_or_else(PoisonError::into_inner);
        cell.thread.is_some() || !cell.cancelled
    }

    /// Requests cancellation. A task not yet picked up will never run; a
    /// task being executed gets its thread interrupted; a completed task is
    /// unaffected.
    pub fn cancel(&self) {
        self.state().cancel();
    }

    /// Producer-side resolution for manually driven futures.
    pub fn supply_value(&self, value: T) {
        debug_assert!(
            !self
                .state()
                .cell
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .had_task,
            "supply_value on a future that owns a task"
        );
        self.state().supply(value);
    }

    /// Producer-side failure for manually driven futures.
    pub fn supply_err(&self, failure: impl Into<anyhow::Error>) {
        debug_assert!(
            !self
                .state()
                .cell
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .had_task,
            "supply_err on a future that owns a task"
        );
        self.state()
            .report_error(InvocationError::from_error(failure.into()));
    }

    /// Registers a success callback. If the value is already present the
    /// callback fires immediately on the calling thread; otherwise it fires
    /// once, on whichever thread resolves the future, after callbacks
    /// registered earlier.
    pub fn on_success<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let state = self.state();
        if let Some(value) = state.value.get() {
            invoke_success(Box::new(callback), value);
            return self;
        }
        let mut cell = state.cell.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = state.value.get() {
            drop(cell);
            invoke_success(Box::new(callback), value);
            return self;
        }
        cell.on_success.push(Box::new(callback));
        self
    }

    /// Registers an error callback; same observation semantics as
    /// [`on_success`](Self::on_success).
    pub fn on_error<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&InvocationError) + Send + 'static,
    {
        let state = self.state();
        if let Some(failure) = state.error.get() {
            invoke_error(Box::new(callback), failure);
            return self;
        }
        let mut cell = state.cell.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(failure) = state.error.get() {
            drop(cell);
            invoke_error(Box::new(callback), failure);
            return self;
        }
        cell.on_error.push(Box::new(callback));
        self
    }

    /// Produces a dependent future resolved from this one's value or error.
    pub fn map<U, F>(&self, f: F) -> Future<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let mapped = Future::<U>::new();
        {
            let mapped = mapped.clone();
            self.on_success(move |value| mapped.guard.state.supply(f(value)));
        }
        {
            let mapped = mapped.clone();
            self.on_error(move |failure| mapped.guard.state.report_error(failure.clone()));
        }
        mapped
    }

    /// Waits with [`WaitFlags::DEFAULT`].
    pub fn wait(&self) -> Result<(), Interrupted> {
        self.wait_with(WaitFlags::DEFAULT)
    }

    /// Blocks until the future reaches a terminal state, the claim was never
    /// taken and cancellation is set, or the calling thread is interrupted.
    ///
    /// Three strategies, in priority order: execute the unclaimed task
    /// inline on the calling thread; on a pool worker, re-enter the pool's
    /// dispatch loop; otherwise park on the shared condvar.
    pub fn wait_with(&self, flags: WaitFlags) -> Result<(), Interrupted> {
        let state = self.state();
        if state.has_result() {
            return Ok(());
        }
        let weak = Arc::downgrade(&self.guard);
        let mut cell = state.cell.lock().unwrap_or_else(PoisonError::into_inner);

        if flags.allow_inline_execution
            && cell.task.is_some()
            && (cell.thread.is_some() || !cell.cancelled)
            && !state.has_result()
        {
            // Not picked up by the pool yet; run it here.
            drop(cell);
            if SharedState::try_execute(&weak) {
                return Thread::interruption_point();
            }
            cell = state.cell.lock().unwrap_or_else(PoisonError::into_inner);
        }

        let current = Thread::current();
        // Waiting on the future whose task this very thread is executing can
        // never be woken by it; return so get() can surface the deadlock.
        if cell
            .thread
            .as_ref()
            .is_some_and(|thread| Arc::ptr_eq(thread, &current))
        {
            drop(cell);
            return Thread::interruption_point();
        }

        if flags.allow_worker_reentrancy {
            if let ThreadKind::PoolWorker(pool) = current.kind() {
                if let Some(pool) = pool.upgrade() {
                    if state.has_result() {
                        return Ok(());
                    }
                    // Settlement must wake parked peers so they re-check
                    // their predicates.
                    let wake = Arc::clone(&pool);
                    cell.wakers.push(Box::new(move || wake.wake_up_all()));
                    drop(cell);

                    let observed = Arc::clone(&self.guard.state);
                    pool.dispatch_while(move || !observed.resolution_settled());
                    return Thread::interruption_point();
                }
            }
        }

        loop {
            // Done, or cancelled with no execution left to wait out. A
            // cancelled task that fails records no result, so `task_done` is
            // what releases waiters in that case. The task cannot be claimed
            // by this thread past the identity check above, so blocking here
            // is safe.
            let abandoned = cell.cancelled && (cell.thread.is_none() || cell.task_done);
            if state.has_result() || abandoned {
                break;
            }
            cell = state.cv.wait(cell)?;
        }
        drop(cell);
        Thread::interruption_point()
    }

    /// Waits, then returns the value or the terminal failure.
    pub fn get(&self) -> Result<T, FutureError>
    where
        T: Clone,
    {
        self.get_with(WaitFlags::DEFAULT)
    }

    pub fn get_with(&self, flags: WaitFlags) -> Result<T, FutureError>
    where
        T: Clone,
    {
        Thread::interruption_point()?;
        self.wait_with(flags)?;
        Thread::interruption_point()?;

        let state = self.state();
        if let Some(failure) = state.error.get() {
            return Err(FutureError::Invocation(failure.clone()));
        }
        if state.interrupted.load(Ordering::Acquire) {
            return Err(FutureError::ExecutionInterrupted);
        }
        if let Some(value) = state.value.get() {
            return Ok(value.clone());
        }
        let cell = state.cell.lock().unwrap_or_else(PoisonError::into_inner);
        if cell.cancelled {
            Err(FutureError::Cancelled)
        } else {
            Err(FutureError::Deadlock)
        }
    }
}

impl<T: Send + Sync + 'static> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadPool {
    /// Schedules `task` on the pool and returns a future observing it.
    ///
    /// The task is enqueued at [`Priority::Lowest`] so a consumer that
    /// reaches [`Future::wait`] first may steal and run it inline.
    pub fn submit<T, F>(&self, task: F) -> Future<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> TaskResult<T> + Send + 'static,
    {
        let future = Future::with_task(task);
        let weak = Arc::downgrade(&future.guard);
        self.run_with_priority(
            move || {
                SharedState::try_execute(&weak);
            },
            Priority::Lowest,
        );
        future
    }
}

/// Manages multiple futures of the same type.
///
/// Waits run in reverse submission order: the newest future is the least
/// likely to have been picked up, so the caller steals it inline instead of
/// idling while the pool works through the backlog.
pub struct FutureSet<T> {
    futures: Vec<Future<T>>,
}

impl<T> Default for FutureSet<T> {
    fn default() -> Self {
        Self { futures: Vec::new() }
    }
}

impl<T: Send + Sync + 'static> FutureSet<T> {
    pub fn new() -> Self {
        Self { futures: Vec::new() }
    }

    pub fn wait_for_all(&self) -> Result<(), Interrupted> {
        for future in self.futures.iter().rev() {
            future.wait()?;
        }
        Ok(())
    }

    /// Returns the first failure among already-resolved futures.
    pub fn check_for_errors(&self) -> Result<(), FutureError> {
        for future in &self.futures {
            if let Some(failure) = future.state().error.get() {
                return Err(FutureError::Invocation(failure.clone()));
            }
            if future.state().interrupted.load(Ordering::Acquire) {
                return Err(FutureError::ExecutionInterrupted);
            }
        }
        Ok(())
    }
}

impl<T> Deref for FutureSet<T> {
    type Target = Vec<Future<T>>;

    fn deref(&self) -> &Self::Target {
        &self.futures
    }
}

impl<T> DerefMut for FutureSet<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.futures
    }
}
