#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use kestrel::{EventLoop, InterruptibleCondvar, Thread, ThreadError};

    #[test]
    fn interrupt_wakes_sleeping_thread() {
        let mut thread = Thread::new(|| Thread::sleep(Duration::from_secs(10)));
        thread.start().unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let begin = Instant::now();
        thread.interrupt();
        thread.join().unwrap();
        assert!(begin.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn interrupt_wakes_condvar_waiter() {
        let shared = Arc::new((Mutex::new(false), InterruptibleCondvar::new()));
        let observed_interruption = Arc::new(AtomicBool::new(false));

        let mut thread = {
            let shared = Arc::clone(&shared);
            let observed = Arc::clone(&observed_interruption);
            Thread::new(move || {
                let (mutex, cv) = &*shared;
                let guard = mutex.lock().unwrap();
                match cv.wait_while(guard, |ready| !*ready) {
                    Ok(_) => Ok(()),
                    Err(interrupted) => {
                        observed.store(true, Ordering::SeqCst);
                        Err(interrupted)
                    }
                }
            })
        };
        thread.start().unwrap();
        std::thread::sleep(Duration::from_millis(100));

        thread.interrupt();
        thread.join().unwrap();
        assert!(observed_interruption.load(Ordering::SeqCst));
    }

    #[test]
    fn interrupt_pending_before_predicate_wait_does_not_park() {
        let shared = Arc::new((Mutex::new(false), InterruptibleCondvar::new()));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let mut thread = {
            let shared = Arc::clone(&shared);
            Thread::new(move || {
                // Block only once the interrupt is already pending.
                ready_rx.recv().unwrap();
                let (mutex, cv) = &*shared;
                let guard = mutex.lock().unwrap();
                cv.wait_while(guard, |ready| !*ready).map(|_| ())
            })
        };
        thread.start().unwrap();
        thread.interrupt();
        ready_tx.send(()).unwrap();

        // Nobody notifies the condvar; the thread must still come back.
        let begin = Instant::now();
        thread.join().unwrap();
        assert!(begin.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut thread = Thread::new(|| Ok(()));
        thread.start().unwrap();
        assert!(matches!(thread.start(), Err(ThreadError::AlreadyStarted)));
        thread.join().unwrap();
    }

    #[test]
    fn enqueued_work_runs_on_owning_thread_event_loop() {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let mut thread = Thread::with_name("loop-owner", move || {
            let event_loop = EventLoop::install();
            handle_tx.send(event_loop.handle()).unwrap();
            event_loop.run();
            Ok(())
        });
        thread.start().unwrap();
        let loop_handle = handle_rx.recv().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let ran_on = Arc::new(Mutex::new(None));
        {
            let hits = Arc::clone(&hits);
            let ran_on = Arc::clone(&ran_on);
            thread.handle().enqueue(move || {
                hits.fetch_add(1, Ordering::SeqCst);
                *ran_on.lock().unwrap() =
                    std::thread::current().name().map(str::to_owned);
            });
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        loop_handle.stop();
        thread.join().unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(ran_on.lock().unwrap().as_deref(), Some("loop-owner"));
    }

    #[test]
    fn drop_interrupts_and_joins_running_thread() {
        let begin = Instant::now();
        {
            let mut thread = Thread::new(|| Thread::sleep(Duration::from_secs(10)));
            thread.start().unwrap();
            std::thread::sleep(Duration::from_millis(50));
        }
        // Drop must not wait out the full sleep.
        assert!(begin.elapsed() < Duration::from_secs(2));
    }
}
