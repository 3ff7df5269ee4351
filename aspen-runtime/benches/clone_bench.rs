//! Clone machinery benchmarks using criterion.
//!
//! Run with: cargo bench --bench clone_bench

use std::any::Any;
use std::sync::atomic::{AtomicI64, Ordering};

use aspen_runtime::{create, Clonable, CloneSession, Context, FreezeWalk, Lazy, Shared};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

struct Counter {
    value: AtomicI64,
}

impl Counter {
    fn new(value: i64) -> Self {
        Self {
            value: AtomicI64::new(value),
        }
    }

    fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Clonable for Counter {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_in(&self, _session: &mut CloneSession<'_>) -> Box<dyn Clonable> {
        Box::new(Counter::new(self.get()))
    }
}

struct Chain {
    value: AtomicI64,
    next: Lazy<Chain>,
}

impl Clonable for Chain {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_in(&self, session: &mut CloneSession<'_>) -> Box<dyn Clonable> {
        Box::new(Chain {
            value: AtomicI64::new(self.value.load(Ordering::Relaxed)),
            next: self.next.rebind(session),
        })
    }

    fn freeze_fields(&self, walk: &mut FreezeWalk) {
        walk.visit_lazy(&self.next);
    }
}

/// Build a linked chain of `len` nodes in a fresh context.
fn build_chain(len: usize) -> (Lazy<Chain>, Vec<Shared<Chain>>) {
    let ctx = Context::new_root();
    let mut handles = Vec::with_capacity(len);
    let mut next: Lazy<Chain> = Lazy::nil();
    for i in 0..len {
        let node = create(Chain {
            value: AtomicI64::new(i as i64),
            next,
        });
        next = Lazy::new(&node, &ctx);
        handles.push(node);
    }
    (next, handles)
}

fn bench_create(c: &mut Criterion) {
    let mut group = c.benchmark_group("create");

    group.bench_function("leaf", |b| {
        b.iter(|| {
            let p = create(Counter::new(1));
            black_box(p.get().get())
        });
    });

    group.bench_function("shared_handle_copy", |b| {
        let p = create(Counter::new(1));
        b.iter(|| black_box(p.clone()));
    });

    group.finish();
}

fn bench_deep_clone(c: &mut Criterion) {
    let mut group = c.benchmark_group("deep_clone");

    for len in [1usize, 16, 256] {
        group.bench_with_input(BenchmarkId::new("fork_chain", len), &len, |b, &len| {
            let (head, _handles) = build_chain(len);
            b.iter(|| black_box(head.deep_clone()));
        });
    }

    group.finish();
}

fn bench_access(c: &mut Criterion) {
    let mut group = c.benchmark_group("access");

    group.bench_function("get_unfrozen", |b| {
        let ctx = Context::new_root();
        let p = create(Counter::new(1));
        let mut lazy = Lazy::new(&p, &ctx);
        b.iter(|| black_box(lazy.get().get()));
    });

    group.bench_function("get_after_divergence", |b| {
        // First get pays for the clone; the benchmark measures the
        // cached steady state the mutation path actually sees.
        let (head, _handles) = build_chain(1);
        let mut fork = head.deep_clone();
        let _ = fork.get();
        b.iter(|| black_box(fork.get().value.load(Ordering::Relaxed)));
    });

    group.bench_function("pull_frozen", |b| {
        let (head, _handles) = build_chain(1);
        let mut fork = head.deep_clone();
        b.iter(|| black_box(fork.pull().value.load(Ordering::Relaxed)));
    });

    group.finish();
}

criterion_group!(benches, bench_create, bench_deep_clone, bench_access);
criterion_main!(benches);
