use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// Marker returned by interruption points when cooperative cancellation was
/// requested for the calling thread.
///
/// Observing `Interrupted` consumes the request: the thread's interruption
/// flag is cleared before the value is returned, so propagating it with `?`
/// unwinds the task exactly once. Contexts that cannot return an error (for
/// example `Drop` implementations) call [`Interrupted::rethrow_later`] to
/// re-arm the flag for the next interruption point instead.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("thread interrupted")]
pub struct Interrupted;

impl Interrupted {
    /// Schedules the interruption to be raised again at the next
    /// interruption point of the current thread.
    pub fn rethrow_later(self) {
        crate::thread::Thread::current().interrupt();
    }
}

/// The only error a pool task closure is allowed to return.
///
/// Both variants lift through `?`: interruption points yield
/// [`Interrupted`], domain failures convert from [`anyhow::Error`].
#[derive(Error, Debug)]
pub enum TaskAbort {
    /// The task observed a cooperative interruption request and unwound.
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
    /// The task body failed with a domain error.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Result type of a pool task body.
pub type TaskResult<T> = Result<T, TaskAbort>;

/// A captured task failure, delivered lazily to every consumer of the future.
///
/// Wraps domain errors and panics uniformly; cloneable so that multiple
/// `get()` callers and `on_error` callbacks observe the same failure.
#[derive(Error, Debug, Clone)]
#[error("invocation target failure: {message}")]
pub struct InvocationError {
    message: Arc<str>,
}

impl InvocationError {
    pub(crate) fn from_error(err: anyhow::Error) -> Self {
        Self { message: format!("{err:#}").into() }
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked".to_string()
        };
        Self { message: format!("panic: {message}").into() }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Consumer-facing outcome of `Future::get`.
#[derive(Error, Debug, Clone)]
pub enum FutureError {
    /// The task body failed; carries the captured failure.
    #[error(transparent)]
    Invocation(#[from] InvocationError),
    /// The task was aborted by cooperative interruption before producing a
    /// value.
    #[error("future execution interrupted")]
    ExecutionInterrupted,
    /// The future was cancelled and its task produced no result.
    #[error("future cancelled before producing a result")]
    Cancelled,
    /// The future was waited on from the thread that is executing its task.
    #[error("future waited on from its own executing thread")]
    Deadlock,
    /// The calling thread was interrupted while waiting for the result.
    #[error("wait interrupted")]
    WaitInterrupted(#[from] Interrupted),
}

/// Errors related to `Thread` lifecycle misuse.
#[derive(Error, Debug)]
pub enum ThreadError {
    #[error("thread already started")]
    AlreadyStarted,
    #[error("thread join from the thread itself")]
    SelfJoin,
    #[error("failed to spawn thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
}
