#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use kestrel::{Future, FutureError, FutureSet, TaskResult, Thread, ThreadPool, WaitFlags};

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn sleeping_task_delivers_value() {
        let pool = ThreadPool::new(2);
        let future = pool.submit(|| {
            Thread::sleep(Duration::from_millis(50))?;
            Ok(42)
        });
        assert_eq!(future.get().unwrap(), 42);
        assert!(future.has_value());
    }

    #[test]
    fn task_executes_exactly_once_across_concurrent_getters() {
        let pool = ThreadPool::new(2);
        let executions = Arc::new(AtomicUsize::new(0));
        let future = {
            let executions = Arc::clone(&executions);
            pool.submit(move || {
                executions.fetch_add(1, Ordering::SeqCst);
                Thread::sleep(Duration::from_millis(20))?;
                Ok(7usize)
            })
        };

        let getters: Vec<_> = (0..4)
            .map(|_| {
                let future = future.clone();
                std::thread::spawn(move || future.get().unwrap())
            })
            .collect();
        for getter in getters {
            assert_eq!(getter.join().unwrap(), 7);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_task_surfaces_invocation_error() {
        let pool = ThreadPool::new(1);
        let future = pool.submit(|| -> TaskResult<i32> {
            Err(anyhow::anyhow!("unknown variable: x").into())
        });
        match future.get() {
            Err(FutureError::Invocation(failure)) => {
                assert!(failure.message().contains("x"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(future.has_result());
        assert!(!future.has_value());
    }

    #[test]
    fn panicking_task_surfaces_invocation_error() {
        let pool = ThreadPool::new(1);
        let future = pool.submit(|| -> TaskResult<i32> { panic!("boom in task") });
        match future.get() {
            Err(FutureError::Invocation(failure)) => {
                assert!(failure.message().contains("boom in task"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn dropping_future_cancels_task_before_pickup() {
        let pool = ThreadPool::new(1);
        // Occupy the single worker so the next task stays queued.
        let blocker = pool.submit(|| {
            Thread::sleep(Duration::from_millis(200))?;
            Ok(())
        });
        let ran = Arc::new(AtomicBool::new(false));
        {
            let ran = Arc::clone(&ran);
            let doomed = pool.submit(move || {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            });
            // Drop before any worker can claim it.
            drop(doomed);
        }
        blocker.get().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn cancellation_after_completion_keeps_value() {
        let pool = ThreadPool::new(1);
        let future = pool.submit(|| Ok(7));
        assert!(wait_until(Duration::from_secs(5), || future.has_result()));
        future.cancel();
        assert_eq!(future.get().unwrap(), 7);
    }

    #[test]
    fn cancelling_running_task_interrupts_it() {
        let pool = ThreadPool::new(1);
        let started = Arc::new(AtomicBool::new(false));
        let future = {
            let started = Arc::clone(&started);
            pool.submit(move || -> TaskResult<i32> {
                started.store(true, Ordering::SeqCst);
                loop {
                    Thread::sleep(Duration::from_millis(10))?;
                }
            })
        };
        assert!(wait_until(Duration::from_secs(5), || {
            started.load(Ordering::SeqCst)
        }));
        future.cancel();
        assert!(matches!(
            future.get_with(WaitFlags::JUST_WAIT),
            Err(FutureError::ExecutionInterrupted)
        ));
    }

    fn nested_chain(depth: usize) -> TaskResult<usize> {
        if depth == 0 {
            return Ok(0);
        }
        let inner = ThreadPool::global().submit(move || nested_chain(depth - 1));
        // Force the worker-re-entrancy path instead of inline stealing.
        let flags = WaitFlags {
            allow_inline_execution: false,
            allow_worker_reentrancy: true,
        };
        let value = inner.get_with(flags).map_err(anyhow::Error::from)?;
        Ok(value + 1)
    }

    #[test]
    fn nested_waits_deeper_than_pool_do_not_deadlock() {
        let future = ThreadPool::global().submit(|| nested_chain(4));
        assert_eq!(future.get().unwrap(), 4);
    }

    #[test]
    fn worker_waiting_on_its_own_task_reports_deadlock() {
        let pool = ThreadPool::new(1);
        let slot: Arc<std::sync::Mutex<Option<Future<i32>>>> =
            Arc::new(std::sync::Mutex::new(None));
        let future = {
            let slot = Arc::clone(&slot);
            pool.submit(move || -> TaskResult<i32> {
                let own = loop {
                    if let Some(own) = slot.lock().unwrap().clone() {
                        break own;
                    }
                    std::thread::sleep(Duration::from_millis(5));
                };
                // Re-entering the dispatch loop would spin forever here; the
                // wait has to recognize its own claim instead.
                let flags = WaitFlags {
                    allow_inline_execution: false,
                    allow_worker_reentrancy: true,
                };
                match own.get_with(flags) {
                    Err(FutureError::Deadlock) => Ok(1),
                    _ => Ok(0),
                }
            })
        };
        *slot.lock().unwrap() = Some(future.clone());
        assert_eq!(future.get_with(WaitFlags::JUST_WAIT).unwrap(), 1);
    }

    #[test]
    fn interrupted_dependency_releases_reentrant_waiter() {
        let pool = ThreadPool::new(2);
        let started = Arc::new(AtomicBool::new(false));
        let dependency = {
            let started = Arc::clone(&started);
            pool.submit(move || -> TaskResult<i32> {
                started.store(true, Ordering::SeqCst);
                loop {
                    Thread::sleep(Duration::from_millis(10))?;
                }
            })
        };
        let waiting = Arc::new(AtomicBool::new(false));
        let dependent = {
            let dependency = dependency.clone();
            let waiting = Arc::clone(&waiting);
            pool.submit(move || -> TaskResult<i32> {
                waiting.store(true, Ordering::SeqCst);
                let flags = WaitFlags {
                    allow_inline_execution: false,
                    allow_worker_reentrancy: true,
                };
                match dependency.get_with(flags) {
                    Err(FutureError::ExecutionInterrupted) => Ok(1),
                    _ => Ok(0),
                }
            })
        };
        assert!(wait_until(Duration::from_secs(5), || {
            started.load(Ordering::SeqCst) && waiting.load(Ordering::SeqCst)
        }));
        dependency.cancel();
        assert_eq!(dependent.get_with(WaitFlags::JUST_WAIT).unwrap(), 1);
    }

    #[test]
    fn wait_blocks_until_value_supplied_from_another_thread() {
        let future = Future::<i32>::new();
        {
            let future = future.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                future.supply_value(42);
            });
        }
        assert_eq!(future.get().unwrap(), 42);
    }

    #[test]
    fn future_set_waits_for_every_member() {
        let pool = ThreadPool::new(2);
        let mut set = FutureSet::new();
        for i in 0..8usize {
            set.push(pool.submit(move || {
                Thread::sleep(Duration::from_millis(10))?;
                Ok(i)
            }));
        }
        set.wait_for_all().unwrap();
        set.check_for_errors().unwrap();
        for (i, future) in set.iter().enumerate() {
            assert!(future.has_value());
            assert_eq!(future.get().unwrap(), i);
        }
    }
}
