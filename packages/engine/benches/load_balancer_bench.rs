// packages/engine/benches/load_balancer_bench.rs
//! Cost of instance selection and session round trips

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use replica_engine::interpreter::{Library, LocalRuntime};
use replica_engine::runtime::LoadBalancer;
use replica_engine::InstancePool;

fn acquire_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_balancer");

    for instances in [1usize, 4, 16, 64] {
        let balancer = LoadBalancer::new(instances);
        group.bench_with_input(BenchmarkId::new("acquire_free", instances), &instances, |b, _| {
            b.iter(|| {
                let ordinal = balancer.acquire();
                balancer.free(black_box(ordinal));
            });
        });

        // every counter busy, so acquire has to scan for the minimum
        let saturated = LoadBalancer::new(instances);
        for _ in 0..instances {
            saturated.acquire();
        }
        group.bench_with_input(BenchmarkId::new("acquire_saturated", instances), &instances, |b, _| {
            b.iter(|| {
                let ordinal = saturated.acquire();
                saturated.free(black_box(ordinal));
            });
        });
    }

    group.finish();
}

fn session_round_trip(c: &mut Criterion) {
    let pool = InstancePool::new(4, &LocalRuntime::new(Library::new())).expect("pool");

    c.bench_function("acquire_one_drop", |b| {
        b.iter(|| {
            let session = pool.acquire_one().expect("session");
            black_box(session.ordinal());
        });
    });
}

criterion_group!(benches, acquire_free, session_round_trip);
criterion_main!(benches);
