//! Stress tests for the task queue. Run with `cargo test -- --ignored`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use priotask::{PriorityTask, PriorityTaskQueue, QueueConfig, State};

#[test]
#[ignore]
fn stress_many_small_tasks() {
    let queue = PriorityTaskQueue::fixed(4).unwrap();
    let executed = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<PriorityTask<usize>> = (0..1_000)
        .map(|i| {
            let executed = executed.clone();
            let task = PriorityTask::from_fn(move |_| {
                executed.fetch_add(1, Ordering::SeqCst);
                Ok(i)
            });
            assert!(queue.add(&task).unwrap());
            task
        })
        .collect();

    for (i, task) in tasks.iter().enumerate() {
        assert_eq!(task.get().unwrap(), i);
    }
    assert_eq!(executed.load(Ordering::SeqCst), 1_000);

    queue.shutdown();
}

#[test]
#[ignore]
fn stress_cancel_storm() {
    let config = QueueConfig::builder()
        .core_size(2)
        .max_size(4)
        .keep_alive(Duration::from_millis(10))
        .build()
        .unwrap();
    let queue = PriorityTaskQueue::with_config(config).unwrap();

    let tasks: Vec<PriorityTask<u32>> = (0..500u32)
        .map(|i| {
            let task = PriorityTask::from_fn(move |ctx| {
                for _ in 0..100 {
                    ctx.checkpoint()?;
                    std::thread::yield_now();
                }
                Ok(i)
            });
            assert!(queue.add(&task).unwrap());
            task
        })
        .collect();

    // cancel every other task while the pool is churning
    for task in tasks.iter().step_by(2) {
        task.request_cancel();
    }

    let mut completed = 0;
    let mut canceled = 0;
    for task in &tasks {
        assert!(task.wait_timeout(Duration::from_secs(30)));
        match task.state() {
            State::Complete => completed += 1,
            State::Canceled => canceled += 1,
            state => panic!("unexpected terminal state {state:?}"),
        }
    }
    // every even-indexed task was cancel-requested; the odd ones must all
    // complete, and nothing may be lost
    assert_eq!(completed + canceled, 500);
    assert!(completed >= 250);

    queue.shutdown_now();
}

#[test]
#[ignore]
fn stress_shutdown_now_converges() {
    for _ in 0..20 {
        let queue = PriorityTaskQueue::fixed(2).unwrap();
        let tasks: Vec<PriorityTask<u32>> = (0..50u32)
            .map(|i| {
                let task = PriorityTask::from_fn(move |ctx| {
                    loop {
                        ctx.checkpoint()?;
                        std::thread::sleep(Duration::from_micros(50));
                        if i % 7 == 0 {
                            return Ok(i);
                        }
                    }
                });
                assert!(queue.add(&task).unwrap());
                task
            })
            .collect();

        queue.shutdown_now();
        for task in &tasks {
            assert!(
                task.wait_timeout(Duration::from_secs(10)),
                "task stuck after shutdown_now"
            );
            assert!(task.state().is_terminal());
        }
    }
}
