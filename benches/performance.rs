//! 性能基准测试
//!
//! 测试 rslock 在不同场景下的性能表现：
//! - 无竞争的共享/排他加锁与释放
//! - 可重入加锁
//! - 批量加锁
//! - 多线程共享锁竞争

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rslock::{Config, LockManager, ResourceType};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn node() -> ResourceType {
    ResourceType::new(0, "Node")
}

/// 创建测试用的 LockManager 实例
fn create_manager() -> Arc<LockManager> {
    let _ = env_logger::builder().is_test(true).try_init();
    Arc::new(LockManager::new(Config::default(), vec![node()]).unwrap())
}

/// 无竞争加锁/释放
fn bench_uncontended(c: &mut Criterion) {
    let manager = create_manager();
    let client = manager.new_client().unwrap();
    let node = node();

    let mut group = c.benchmark_group("uncontended");
    group.throughput(Throughput::Elements(1));

    group.bench_function("shared", |b| {
        let mut id = 0u64;
        b.iter(|| {
            id = id.wrapping_add(1);
            client.acquire_shared(&node, &[black_box(id)]).unwrap();
            client.release_shared(&node, &[id]).unwrap();
        });
    });

    group.bench_function("exclusive", |b| {
        let mut id = 0u64;
        b.iter(|| {
            id = id.wrapping_add(1);
            client.acquire_exclusive(&node, &[black_box(id)]).unwrap();
            client.release_exclusive(&node, &[id]).unwrap();
        });
    });

    group.bench_function("try_exclusive", |b| {
        b.iter(|| {
            assert!(client.try_exclusive_lock(&node, black_box(7)));
            client.release_exclusive(&node, &[7]).unwrap();
        });
    });

    group.finish();
}

/// 可重入加锁，只走客户端本地计数
fn bench_reentrant(c: &mut Criterion) {
    let manager = create_manager();
    let client = manager.new_client().unwrap();
    let node = node();
    client.acquire_shared(&node, &[1]).unwrap();

    c.bench_function("reentrant_shared", |b| {
        b.iter(|| {
            assert!(client.re_enter_shared(&node, black_box(1)));
            client.release_shared(&node, &[1]).unwrap();
        });
    });
}

/// 批量加锁性能测试
fn bench_batch(c: &mut Criterion) {
    let batch_sizes = vec![1, 10, 100];
    let manager = create_manager();
    let client = manager.new_client().unwrap();
    let node = node();

    let mut group = c.benchmark_group("batch_exclusive");
    for batch_size in batch_sizes {
        let ids: Vec<u64> = (0..batch_size).collect();
        group.throughput(Throughput::Elements(batch_size));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &ids, |b, ids| {
            b.iter(|| {
                client.acquire_exclusive(&node, black_box(ids)).unwrap();
                client.release_exclusive(&node, ids).unwrap();
            });
        });
    }
    group.finish();
}

/// 多线程共享锁竞争（同一组资源）
fn bench_shared_contention(c: &mut Criterion) {
    let concurrency_levels = vec![1, 2, 4, 8];

    let mut group = c.benchmark_group("shared_contention");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(5));

    for concurrency in concurrency_levels {
        group.throughput(Throughput::Elements(1000 * concurrency as u64));

        group.bench_with_input(
            BenchmarkId::new("threads", concurrency),
            &concurrency,
            |b, &num_threads| {
                b.iter_custom(|iters| {
                    let manager = create_manager();
                    let mut total_duration = Duration::from_nanos(0);

                    for _ in 0..iters {
                        let barrier = Arc::new(Barrier::new(num_threads + 1));
                        let handles: Vec<_> = (0..num_threads)
                            .map(|thread_id| {
                                let manager = manager.clone();
                                let barrier = barrier.clone();
                                thread::spawn(move || {
                                    let client = manager.new_client().unwrap();
                                    let node = node();
                                    barrier.wait();
                                    for i in 0..1000u64 {
                                        let id = (thread_id as u64 + i) % 16;
                                        client.acquire_shared(&node, &[id]).unwrap();
                                        client.release_shared(&node, &[id]).unwrap();
                                    }
                                })
                            })
                            .collect();

                        barrier.wait();
                        let start = Instant::now();
                        for handle in handles {
                            handle.join().unwrap();
                        }
                        total_duration += start.elapsed();
                    }

                    total_duration
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_uncontended,
    bench_reentrant,
    bench_batch,
    bench_shared_contention
);

criterion_main!(benches);
