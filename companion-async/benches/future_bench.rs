//! Benchmarks for future resolution and combinators.

use companion_async::combinators::collect;
use companion_async::{Future, FutureState};
use companion_async::queue::Queue;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn resolve_benchmark(c: &mut Criterion) {
    c.bench_function("resolve_with_handlers", |b| {
        b.iter(|| {
            let future: Future<u64> = Future::new();
            for _ in 0..8 {
                future.on_completion(&Queue::inline(), |result| {
                    black_box(result.ok());
                });
            }
            future.resolve(black_box(42));
        });
    });
}

fn chain_benchmark(c: &mut Criterion) {
    let queue = Queue::inline();
    c.bench_function("chain_depth_16", |b| {
        b.iter(|| {
            let root: Future<u64> = Future::new();
            let mut tail = root.clone();
            for _ in 0..16 {
                tail = tail.chain(&queue, |value| Future::from_result(value + 1));
            }
            root.resolve(0);
            black_box(tail.value())
        });
    });

    c.bench_function("cancel_chain_depth_16", |b| {
        b.iter(|| {
            let root: Future<u64> = Future::new();
            let mut tail = root.clone();
            for _ in 0..16 {
                tail = tail.map(&queue, |value| value + 1);
            }
            tail.cancel();
            assert_eq!(root.state(), FutureState::Cancelled);
        });
    });
}

fn collect_benchmark(c: &mut Criterion) {
    c.bench_function("collect_64", |b| {
        b.iter(|| {
            let futures: Vec<Future<u64>> = (0..64).map(|_| Future::new()).collect();
            let collected = collect(futures.clone());
            for (i, future) in futures.iter().enumerate() {
                future.resolve(i as u64);
            }
            black_box(collected.value())
        });
    });
}

criterion_group!(benches, resolve_benchmark, chain_benchmark, collect_benchmark);
criterion_main!(benches);
