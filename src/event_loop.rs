//! Per-thread cooperative scheduler.
//!
//! An [`EventLoop`] drains the owning thread's message queue and blocks until
//! new work is announced via [`EventLoopHandle::notify`] (which `enqueue`
//! does automatically for the installed loop). Loops nest: installing one
//! saves the previously installed loop and restores it on drop, so a modal
//! inner loop can run and hand control back to the outer loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::thread::{Thread, ThreadHandle};

#[derive(Default)]
struct LoopState {
    notified: bool,
}

/// Cross-thread notification surface of an event loop.
pub(crate) struct EventLoopShared {
    state: Mutex<LoopState>,
    cv: Condvar,
    running: AtomicBool,
}

impl EventLoopShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(LoopState::default()),
            cv: Condvar::new(),
            running: AtomicBool::new(true),
        }
    }

    /// Announces new work; callable from any thread.
    pub(crate) fn notify(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.notified = true;
        self.cv.notify_all();
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // Force a wakeup so the loop observes the stop promptly.
        self.notify();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Cloneable handle used to notify or stop a loop from other threads.
#[derive(Clone)]
pub struct EventLoopHandle {
    shared: Arc<EventLoopShared>,
}

impl EventLoopHandle {
    pub fn notify(&self) {
        self.shared.notify();
    }

    pub fn stop(&self) {
        self.shared.stop();
    }
}

/// Single-threaded cooperative scheduler for the thread it is installed on.
pub struct EventLoop {
    thread: ThreadHandle,
    shared: Arc<EventLoopShared>,
    previous: Option<Arc<EventLoopShared>>,
}

impl EventLoop {
    /// Installs a new loop on the calling thread. The previously installed
    /// loop, if any, is saved and restored when this loop is dropped.
    pub fn install() -> Self {
        let thread = Thread::current();
        let shared = Arc::new(EventLoopShared::new());
        let previous = thread.install_event_loop(Arc::clone(&shared));
        Self { thread, shared, previous }
    }

    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle { shared: Arc::clone(&self.shared) }
    }

    /// One scheduling step: drain the queue, then either consume a pending
    /// notification without blocking or, if the queue stayed empty, park
    /// until notified.
    pub fn iteration(&self) {
        self.thread.process_messages();

        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.notified {
            // Work arrived while draining; re-check on the next iteration
            // without blocking.
            state.notified = false;
            return;
        }
        while self.thread.queue_is_empty() && self.shared.is_running() && !state.notified {
            state = self
                .shared
                .cv
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.notified = false;
    }

    /// Runs iterations until [`EventLoopHandle::stop`] is called.
    pub fn run(&self) {
        while self.shared.is_running() {
            self.iteration();
        }
        // Leftovers enqueued between the last drain and the stop.
        self.thread.process_messages();
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shared.stop();
        self.thread.restore_event_loop(self.previous.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn iteration_drains_pending_work() {
        let event_loop = EventLoop::install();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            Thread::current().enqueue(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        event_loop.iteration();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_install_restores_outer_loop() {
        let outer = EventLoop::install();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let inner = EventLoop::install();
            let enqueued_hits = Arc::clone(&hits);
            Thread::current().enqueue(move || {
                enqueued_hits.fetch_add(1, Ordering::SeqCst);
            });
            inner.iteration();
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        }
        // Outer loop is the installed one again and still functional.
        {
            let hits = Arc::clone(&hits);
            Thread::current().enqueue(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        outer.iteration();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
