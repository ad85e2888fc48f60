//! Benchmarks for submit/complete round-trips through the queue.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use priotask::{PriorityTask, PriorityTaskQueue};

fn roundtrip(queue: &PriorityTaskQueue, batch: usize) -> u64 {
    let tasks: Vec<PriorityTask<u64>> = (0..batch)
        .map(|i| {
            let task = PriorityTask::from_fn(move |_| Ok(i as u64 * 2));
            queue.add(&task).expect("admission failed");
            task
        })
        .collect();

    tasks.iter().map(|t| t.get().expect("task failed")).sum()
}

fn bench_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("roundtrip");

    for workers in [1usize, 2, 4].iter() {
        let queue = PriorityTaskQueue::fixed(*workers).unwrap();
        group.bench_with_input(
            BenchmarkId::new("batch_100", workers),
            workers,
            |b, _| b.iter(|| roundtrip(&queue, black_box(100))),
        );
        queue.shutdown();
    }

    group.finish();
}

criterion_group!(benches, bench_roundtrip);
criterion_main!(benches);
