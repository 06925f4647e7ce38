// Wrapper registry benchmarks
//
// These measure the cost of finding or creating the wrapper for a native
// handle, and of constructing custom instances.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use gobind::runtime::{Instance, Type};
use gobind::{Object, ObjectImpl, WrapperRegistry, init, wrap};
use std::hint::black_box;

/// Wrapping a handle that already has a wrapper is a registry lookup plus a
/// reference.
fn bench_rewrap_existing(c: &mut Criterion) {
    init();
    let object = Object::new().unwrap();
    let handle = object.base().as_ptr();

    c.bench_function("rewrap_existing", |b| {
        // SAFETY: `object` keeps the handle alive.
        b.iter(|| unsafe { wrap(black_box(handle), true) });
    });
}

/// Wrapping a fresh instance runs the factory and registers the shell.
fn bench_wrap_fresh(c: &mut Criterion) {
    init();
    c.bench_function("wrap_fresh", |b| {
        b.iter_batched(
            || Instance::new(Type::OBJECT).unwrap(),
            |instance| WrapperRegistry::global().wrap_instance(instance),
            criterion::BatchSize::SmallInput,
        );
    });
}

/// Lookup cost as the registry grows.
fn bench_lookup_by_size(c: &mut Criterion) {
    init();
    let mut group = c.benchmark_group("lookup");

    for size in [16usize, 256, 4096] {
        let registry = WrapperRegistry::new();
        let live: Vec<_> = (0..size)
            .map(|_| {
                let wrapper = std::sync::Arc::new(Object::uninit_in(&registry));
                gobind::ObjectBase::initialize(&wrapper, Instance::new(Type::OBJECT).unwrap());
                wrapper
            })
            .collect();
        let probe = live[size / 2].base().as_ptr();

        group.bench_with_input(BenchmarkId::from_parameter(size), &probe, |b, &probe| {
            b.iter(|| registry.lookup(black_box(probe)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_rewrap_existing, bench_wrap_fresh, bench_lookup_by_size);
criterion_main!(benches);
