use criterion::{criterion_group, criterion_main, Criterion, BenchmarkId};
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use rdma_epoch::{EpochManager, Reclaimer};

// Benchmark 1: Single-threaded protect/unprotect overhead
fn bench_single_thread_protect(c: &mut Criterion) {
    c.bench_function("rdma_epoch_single_thread_pin", |b| {
        let manager = EpochManager::builder().build().unwrap();

        b.iter(|| {
            let _guard = manager.pin().unwrap();
            black_box(());
        });
    });

    c.bench_function("rdma_epoch_single_thread_protect_unprotect", |b| {
        let manager = EpochManager::builder().build().unwrap();

        b.iter(|| {
            manager.protect().unwrap();
            manager.unprotect().unwrap();
        });
    });

    c.bench_function("crossbeam_epoch_single_thread_pin_unpin", |b| {
        b.iter(|| {
            let _guard = crossbeam_epoch::pin();
            black_box(());
        });
    });
}

// Benchmark 2: Bump plus table scan, by table capacity
fn bench_bump_and_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("bump_and_scan");

    for capacity in [64usize, 128, 512, 2048].iter() {
        group.bench_with_input(
            BenchmarkId::new("rdma_epoch", capacity),
            capacity,
            |b, &capacity| {
                let manager = EpochManager::builder()
                    .table_capacity(capacity)
                    .build()
                    .unwrap();

                b.iter(|| black_box(manager.bump_current_epoch()));
            },
        );
    }

    group.bench_function("crossbeam_epoch_flush", |b| {
        b.iter(|| {
            let guard = crossbeam_epoch::pin();
            guard.flush();
        });
    });

    group.finish();
}

// Benchmark 3: First-use registration from fresh threads
fn bench_thread_registration(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread_registration");

    for num_threads in [2, 4, 8, 16].iter() {
        group.bench_with_input(
            BenchmarkId::new("rdma_epoch", num_threads),
            num_threads,
            |b, &num_threads| {
                let manager = Arc::new(EpochManager::builder().build().unwrap());

                b.iter(|| {
                    let handles: Vec<_> = (0..num_threads)
                        .map(|_| {
                            let m = Arc::clone(&manager);
                            thread::spawn(move || {
                                let _guard = m.pin().unwrap();
                            })
                        })
                        .collect();

                    for handle in handles {
                        let _ = handle.join();
                    }
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("crossbeam_epoch", num_threads),
            num_threads,
            |b, &num_threads| {
                b.iter(|| {
                    let handles: Vec<_> = (0..num_threads)
                        .map(|_| {
                            thread::spawn(|| {
                                let _guard = crossbeam_epoch::pin();
                            })
                        })
                        .collect();

                    for handle in handles {
                        let _ = handle.join();
                    }
                });
            },
        );
    }

    group.finish();
}

// Benchmark 4: Retire and collect
fn bench_retire_collect(c: &mut Criterion) {
    let mut group = c.benchmark_group("retire_collect");

    group.bench_function("rdma_epoch_retire_collect", |b| {
        let manager = EpochManager::builder().build().unwrap();
        let reclaimer = Reclaimer::builder().auto_reclaim_threshold(None).build();

        b.iter(|| {
            for i in 0..64u64 {
                reclaimer.retire(&manager, Box::new(i));
            }
            black_box(reclaimer.collect(&manager));
        });
    });

    group.bench_function("crossbeam_epoch_defer_destroy", |b| {
        b.iter(|| {
            let guard = crossbeam_epoch::pin();
            for i in 0..64u64 {
                let owned = crossbeam_epoch::Owned::new(i).into_shared(&guard);
                // SAFETY: never published, so nobody else can reach it.
                unsafe { guard.defer_destroy(owned) };
            }
            guard.flush();
        });
    });

    group.finish();
}

// Benchmark 5: Concurrent readers with a background bumper
fn bench_concurrent_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_reads");
    group.sample_size(10);

    for num_threads in [2, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::new("rdma_epoch", num_threads),
            num_threads,
            |b, &num_threads| {
                b.iter(|| {
                    let manager = Arc::new(EpochManager::builder().build().unwrap());
                    let counter = Arc::new(AtomicUsize::new(0));

                    let handles: Vec<_> = (0..num_threads)
                        .map(|i| {
                            let m = Arc::clone(&manager);
                            let c = Arc::clone(&counter);

                            thread::spawn(move || {
                                for round in 0..1000 {
                                    let _guard = m.pin().unwrap();
                                    c.fetch_add(1, Ordering::Relaxed);
                                    if i == 0 && round % 16 == 0 {
                                        m.bump_current_epoch();
                                    }
                                }
                            })
                        })
                        .collect();

                    for handle in handles {
                        let _ = handle.join();
                    }
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("crossbeam_epoch", num_threads),
            num_threads,
            |b, &num_threads| {
                b.iter(|| {
                    let counter = Arc::new(AtomicUsize::new(0));

                    let handles: Vec<_> = (0..num_threads)
                        .map(|i| {
                            let c = Arc::clone(&counter);

                            thread::spawn(move || {
                                for round in 0..1000 {
                                    let guard = crossbeam_epoch::pin();
                                    c.fetch_add(1, Ordering::Relaxed);
                                    if i == 0 && round % 16 == 0 {
                                        guard.flush();
                                    }
                                }
                            })
                        })
                        .collect();

                    for handle in handles {
                        let _ = handle.join();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_single_thread_protect,
    bench_bump_and_scan,
    bench_thread_registration,
    bench_retire_collect,
    bench_concurrent_reads
);
criterion_main!(benches);
