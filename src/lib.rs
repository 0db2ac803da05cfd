// Kestrel: cooperative threading and futures.
//
// This crate provides shared cancellable futures resolved on a fixed-size
// thread pool, interruptible threads with per-thread message queues, and a
// nestable per-thread event loop. Blocking on a future never idles a pool
// worker: the wait either steals the task and runs it inline or re-enters
// the worker's dispatch loop.

pub mod config;
pub mod error;
pub mod event_loop;
pub mod future;
pub mod interrupt;
pub mod logging;
pub mod pool;
pub mod thread;

// Re-export commonly used types
pub use config::{default_worker_count, PoolConfig};
pub use error::{FutureError, Interrupted, InvocationError, TaskAbort, TaskResult, ThreadError};
pub use event_loop::{EventLoop, EventLoopHandle};
pub use future::{Future, FutureSet, WaitFlags};
pub use interrupt::InterruptibleCondvar;
pub use pool::{Priority, ThreadPool};
pub use thread::{Message, Thread, ThreadContext, ThreadHandle, ThreadKind};
