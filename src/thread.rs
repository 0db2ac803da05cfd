//! Thread identity, message queues and cooperative interruption.
//!
//! Every OS thread the crate touches is represented by a [`ThreadContext`]
//! reachable through [`Thread::current`]. Threads created through [`Thread`]
//! install their context before the functor runs; foreign threads get a
//! minimal stand-in lazily the first time they ask for it.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::error;

use crate::error::{Interrupted, ThreadError};
use crate::event_loop::EventLoopShared;
use crate::interrupt::InterruptibleCondvar;
use crate::pool::PoolShared;

/// A unit of work delivered to a thread's message queue.
pub type Message = Box<dyn FnOnce() + Send + 'static>;

type ThreadFn = Box<dyn FnOnce() -> Result<(), Interrupted> + Send + 'static>;

/// Shared, cloneable reference to a thread's context.
pub type ThreadHandle = Arc<ThreadContext>;

/// Capability of a thread, checked directly instead of downcasting.
#[derive(Clone, Default)]
pub enum ThreadKind {
    /// A thread not created through this crate, wrapped lazily.
    #[default]
    External,
    /// A thread spawned via [`Thread`].
    Spawned,
    /// A thread-pool worker; carries the pool it dispatches for so a blocked
    /// wait can re-enter the dispatch loop.
    PoolWorker(Weak<PoolShared>),
}

#[derive(Default)]
struct InterruptState {
    flag: bool,
    /// The condvar this thread is currently parked on, if any. At most one,
    /// since a thread can only block on one wait at a time.
    parked: Option<Arc<Condvar>>,
}

/// Per-thread identity: a FIFO message queue, the currently installed event
/// loop and the cooperative-interruption state.
pub struct ThreadContext {
    name: Option<String>,
    kind: ThreadKind,
    queue_tx: flume::Sender<Message>,
    queue_rx: flume::Receiver<Message>,
    interrupt: Mutex<InterruptState>,
    event_loop: Mutex<Option<Arc<EventLoopShared>>>,
    native_id: OnceLock<std::thread::ThreadId>,
}

thread_local! {
    static CURRENT: RefCell<Option<ThreadHandle>> = const { RefCell::new(None) };
}

impl ThreadContext {
    fn new(name: Option<String>, kind: ThreadKind) -> ThreadHandle {
        let (queue_tx, queue_rx) = flume::unbounded();
        Arc::new(Self {
            name,
            kind,
            queue_tx,
            queue_rx,
            interrupt: Mutex::new(InterruptState::default()),
            event_loop: Mutex::new(None),
            native_id: OnceLock::new(),
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> &ThreadKind {
        &self.kind
    }

    /// Delivers a task to this thread's queue. Tasks are executed by the
    /// owner thread from [`ThreadContext::process_messages`], normally driven
    /// by an installed [`crate::EventLoop`].
    ///
    /// FIFO order is kept relative to other `enqueue` calls; there is no
    /// ordering guarantee against a concurrently running drain beyond
    /// eventual visibility.
    pub fn enqueue<F: FnOnce() + Send + 'static>(&self, f: F) {
        // The receiver lives as long as this context, so send cannot fail.
        let _ = self.queue_tx.send(Box::new(f));
        let installed = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(event_loop) = installed {
            event_loop.notify();
        }
    }

    /// Drains the message queue on the owner thread. Each task runs with no
    /// queue lock held, so a task may enqueue further work without deadlock
    /// and without starving this drain.
    pub fn process_messages(&self) {
        debug_assert!(
            self.native_id
                .get()
                .map_or(true, |id| *id == std::thread::current().id()),
            "process_messages() called from a non-owner thread"
        );
        while let Ok(message) = self.queue_rx.try_recv() {
            message();
        }
    }

    pub(crate) fn queue_is_empty(&self) -> bool {
        self.queue_rx.is_empty()
    }

    /// Requests cooperative interruption. The flag takes effect at the
    /// thread's next interruption point; a thread currently parked on an
    /// [`InterruptibleCondvar`] is woken.
    pub fn interrupt(&self) {
        let mut state = self.interrupt.lock().unwrap_or_else(PoisonError::into_inner);
        state.flag = true;
        if let Some(cv) = &state.parked {
            cv.notify_all();
        }
    }

    /// True if interruption has been requested and not yet consumed.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flag
    }

    pub fn reset_interrupt_flag(&self) {
        self.interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flag = false;
    }

    pub(crate) fn register_parked(&self, cv: &Arc<Condvar>) {
        self.interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .parked = Some(Arc::clone(cv));
    }

    pub(crate) fn clear_parked(&self) {
        self.interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .parked = None;
    }

    /// Installs `event_loop` as the current loop for this thread, returning
    /// whatever was installed before so event loops can nest.
    pub(crate) fn install_event_loop(
        &self,
        event_loop: Arc<EventLoopShared>,
    ) -> Option<Arc<EventLoopShared>> {
        self.event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(event_loop)
    }

    pub(crate) fn restore_event_loop(&self, previous: Option<Arc<EventLoopShared>>) {
        *self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = previous;
    }

    fn bind_to_current_os_thread(&self) {
        let _ = self.native_id.set(std::thread::current().id());
    }
}

/// An owned OS thread with cooperative interruption.
///
/// Construction and start are separate, and the functor is consumed exactly
/// once at [`Thread::start`]. The functor returns `Result<(), Interrupted>`:
/// returning `Err(Interrupted)` is the sanctioned way to end the thread early
/// and is absorbed silently, while a panic is logged and the thread ends
/// cleanly instead of aborting the process.
pub struct Thread {
    context: ThreadHandle,
    functor: Option<ThreadFn>,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    pub fn new<F>(functor: F) -> Self
    where
        F: FnOnce() -> Result<(), Interrupted> + Send + 'static,
    {
        Self::with_kind(None, ThreadKind::Spawned, functor)
    }

    pub fn with_name<F>(name: impl Into<String>, functor: F) -> Self
    where
        F: FnOnce() -> Result<(), Interrupted> + Send + 'static,
    {
        Self::with_kind(Some(name.into()), ThreadKind::Spawned, functor)
    }

    pub(crate) fn with_kind<F>(name: Option<String>, kind: ThreadKind, functor: F) -> Self
    where
        F: FnOnce() -> Result<(), Interrupted> + Send + 'static,
    {
        Self {
            context: ThreadContext::new(name, kind),
            functor: Some(Box::new(functor)),
            handle: None,
        }
    }

    /// Starts thread execution. The new OS thread installs this context as
    /// its "current thread" identity before the functor runs.
    pub fn start(&mut self) -> Result<(), ThreadError> {
        if self.handle.is_some() {
            return Err(ThreadError::AlreadyStarted);
        }
        let functor = self.functor.take().ok_or(ThreadError::AlreadyStarted)?;
        let context = Arc::clone(&self.context);

        let mut builder = std::thread::Builder::new();
        if let Some(name) = &context.name {
            builder = builder.name(name.clone());
        }
        let handle = builder.spawn(move || {
            context.bind_to_current_os_thread();
            CURRENT.with(|current| *current.borrow_mut() = Some(Arc::clone(&context)));
            match panic::catch_unwind(AssertUnwindSafe(functor)) {
                Ok(Ok(())) => {}
                // Cooperative early exit; nothing to report.
                Ok(Err(Interrupted)) => {}
                Err(payload) => {
                    let message = crate::error::InvocationError::from_panic(payload);
                    error!(thread = ?context.name(), "uncaught failure in thread functor: {message}");
                }
            }
        })?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Shared handle to this thread's context, valid before and after start.
    pub fn handle(&self) -> ThreadHandle {
        Arc::clone(&self.context)
    }

    pub fn interrupt(&self) {
        self.context.interrupt();
    }

    pub fn is_interrupted(&self) -> bool {
        self.context.is_interrupted()
    }

    /// Waits for the thread to finish.
    pub fn join(&mut self) -> Result<(), ThreadError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        if handle.thread().id() == std::thread::current().id() {
            self.handle = Some(handle);
            return Err(ThreadError::SelfJoin);
        }
        // A panic in the functor was already caught and logged.
        let _ = handle.join();
        Ok(())
    }

    /// The context of the calling thread, wrapping foreign threads lazily.
    pub fn current() -> ThreadHandle {
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            match &*current {
                Some(handle) => Arc::clone(handle),
                None => {
                    let handle = ThreadContext::new(
                        std::thread::current().name().map(str::to_owned),
                        ThreadKind::External,
                    );
                    handle.bind_to_current_os_thread();
                    *current = Some(Arc::clone(&handle));
                    handle
                }
            }
        })
    }

    /// Interruptible sleep: a timed wait on a throwaway condvar, purely to
    /// gain interruptibility.
    pub fn sleep(duration: Duration) -> Result<(), Interrupted> {
        let cv = InterruptibleCondvar::new();
        let mutex = Mutex::new(());
        let guard = mutex.lock().unwrap_or_else(PoisonError::into_inner);
        cv.wait_timeout(guard, duration).map(|_| ())
    }

    /// The single checkpoint that converts a pending interruption request
    /// into `Err(Interrupted)`, clearing the flag. Safe to call
    /// speculatively.
    pub fn interruption_point() -> Result<(), Interrupted> {
        let current = Self::current();
        let mut state = current
            .interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.flag {
            state.flag = false;
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    /// Drains the calling thread's message queue.
    pub fn process_messages() {
        Self::current().process_messages();
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.context.interrupt();
            let _ = self.join();
        }
    }
}
