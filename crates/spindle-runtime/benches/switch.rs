use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use spindle_runtime::sync::Mutex;
use spindle_runtime::Scheduler;
use std::sync::Arc;

fn bench_spawn_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn_run");

    for tasks in [1usize, 100, 1000] {
        group.throughput(Throughput::Elements(tasks as u64));
        group.bench_with_input(BenchmarkId::new("tasks", tasks), &tasks, |b, &tasks| {
            let scheduler = Scheduler::with_threads(1).unwrap();
            b.iter(|| {
                for _ in 0..tasks {
                    scheduler.spawn(|| {
                        black_box(0u64);
                    });
                }
                scheduler.run().unwrap();
            });
        });
    }

    group.finish();
}

fn bench_yield_ping_pong(c: &mut Criterion) {
    let mut group = c.benchmark_group("yield");
    let yields = 10_000u64;
    group.throughput(Throughput::Elements(yields * 2));

    group.bench_function("ping_pong", |b| {
        let scheduler = Scheduler::with_threads(1).unwrap();
        b.iter(|| {
            for _ in 0..2 {
                scheduler.spawn(move || {
                    for _ in 0..yields {
                        spindle_runtime::yield_now();
                    }
                });
            }
            scheduler.run().unwrap();
        });
    });

    group.finish();
}

fn bench_contended_mutex(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutex");

    for threads in [1usize, 4] {
        group.bench_with_input(
            BenchmarkId::new("threads", threads),
            &threads,
            |b, &threads| {
                let scheduler = Scheduler::with_threads(threads).unwrap();
                b.iter(|| {
                    let counter = Arc::new(Mutex::new(0u64));
                    for _ in 0..64 {
                        let counter = counter.clone();
                        scheduler.spawn(move || {
                            for _ in 0..100 {
                                *counter.lock() += 1;
                                spindle_runtime::yield_now();
                            }
                        });
                    }
                    scheduler.run().unwrap();
                    black_box(*counter.lock())
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_spawn_run, bench_yield_ping_pong, bench_contended_mutex);
criterion_main!(benches);
