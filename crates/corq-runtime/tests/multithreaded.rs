//! Concurrent run-loop tests: several threads driving one context

use corq_runtime::{Context, ContextOptions, InProcessQueue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn new_multithreaded_context(concurrency_hint: usize) -> Context {
    let queue = Arc::new(InProcessQueue::new());
    Context::with_options(queue, ContextOptions { concurrency_hint })
}

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_concurrent_runners_process_every_post_once() {
    const RUNNERS: usize = 3;
    const OPS: usize = 200;

    let context = new_multithreaded_context(RUNNERS + 1);
    let executor = context.executor();
    let count = Arc::new(AtomicUsize::new(0));

    // Keep the runners alive until everything is posted.
    executor.work_started();
    thread::scope(|scope| {
        for _ in 0..RUNNERS {
            scope.spawn(|| context.run());
        }
        for _ in 0..OPS {
            let count = count.clone();
            executor.post(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        executor.work_finished();
    });

    assert_eq!(count.load(Ordering::SeqCst), OPS);
    assert!(context.is_stopped());
}

#[test]
fn test_many_producer_threads_one_runner_pool() {
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 25;

    let context = new_multithreaded_context(2);
    let executor = context.executor();
    let count = Arc::new(AtomicUsize::new(0));

    executor.work_started();
    thread::scope(|scope| {
        for _ in 0..2 {
            scope.spawn(|| context.run());
        }
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let executor = executor.clone();
                let count = count.clone();
                scope.spawn(move || {
                    for posted in 0..PER_PRODUCER {
                        let count = count.clone();
                        executor.post(move || {
                            count.fetch_add(1, Ordering::SeqCst);
                        });
                        // A little jitter so enqueues interleave with drains.
                        if posted % 7 == 0 {
                            thread::sleep(Duration::from_micros(100));
                        }
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        executor.work_finished();
    });

    assert_eq!(count.load(Ordering::SeqCst), PRODUCERS * PER_PRODUCER);
}

#[test]
fn test_dropping_multithreaded_context_drains_pending_posts() {
    const OPS: usize = 20;

    let context = new_multithreaded_context(4);
    let executor = context.executor();
    let dropped = Arc::new(AtomicUsize::new(0));
    let ran = Arc::new(AtomicUsize::new(0));

    for _ in 0..OPS {
        let counter = DropCounter(dropped.clone());
        let ran = ran.clone();
        executor.post(move || {
            let _keep_alive = &counter;
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }

    // No thread ever ran the context; every callable is destroyed unrun.
    drop(context);
    assert_eq!(dropped.load(Ordering::SeqCst), OPS);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn test_stop_releases_all_blocked_runners() {
    const RUNNERS: usize = 3;

    let context = new_multithreaded_context(RUNNERS + 1);
    let executor = context.executor();

    executor.work_started();
    thread::scope(|scope| {
        for _ in 0..RUNNERS {
            scope.spawn(|| context.run());
        }
        thread::sleep(Duration::from_millis(50));
        // Wakes one blocked runner; each exiting runner re-arms the alarm
        // for the next.
        context.stop();
    });

    assert!(context.is_stopped());
    executor.work_finished();
}
