//! Criterion benchmarks for the drop-oldest queue between receivers and the
//! merger.
//!
//! Run with: cargo bench --bench bounded_queue

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rust_ingest::data::bounded_queue::BoundedQueue;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Push/pop pairs on a queue that never fills.
fn push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("bounded_queue_push_pop");
    group.throughput(Throughput::Elements(1));

    for capacity in [1usize, 12, 1024] {
        let queue = BoundedQueue::new(capacity);
        group.bench_with_input(BenchmarkId::new("capacity", capacity), &capacity, |b, _| {
            b.iter(|| {
                queue.push(black_box(42u64));
                black_box(queue.pop(Some(Duration::ZERO)));
            });
        });
    }
    group.finish();
}

/// Pushes into a full queue, each evicting the oldest item.
fn push_overflow(c: &mut Criterion) {
    let queue = BoundedQueue::new(12);
    for i in 0..12u64 {
        queue.push(i);
    }
    c.bench_function("bounded_queue_push_overflow", |b| {
        b.iter(|| black_box(queue.push(black_box(7u64))));
    });
}

/// One producer thread, one blocking consumer.
fn producer_consumer(c: &mut Criterion) {
    const ITEMS: u64 = 10_000;
    let mut group = c.benchmark_group("bounded_queue_threads");
    group.throughput(Throughput::Elements(ITEMS));
    group.bench_function("spsc", |b| {
        b.iter(|| {
            let queue = Arc::new(BoundedQueue::new(ITEMS as usize));
            let producer = {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..ITEMS {
                        queue.push(i);
                    }
                })
            };
            for _ in 0..ITEMS {
                black_box(queue.pop(None));
            }
            producer.join().unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, push_pop, push_overflow, producer_consumer);
criterion_main!(benches);
