//! Strategy comparison benchmarks using criterion.
//!
//! Builds a complete binary tree and sums it under each reference-management
//! strategy: eager single-threaded, eager atomic, and the deferred core with
//! one and with two traversal threads.
//!
//! Run with: cargo bench --bench strategy_bench

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use lethe::eager::{AtomicCount, EagerCount, EagerManaged, EagerRef, SerialCount};
use lethe::{start, Field, Header, Local, Managed};

const TREE_DEPTH: i64 = 14;

// ============================================================================
// Eager harness
// ============================================================================

struct ENode<C: EagerCount> {
    count: C,
    left: EagerRef<ENode<C>>,
    right: EagerRef<ENode<C>>,
    data: i64,
}

impl<C: EagerCount> EagerManaged for ENode<C> {
    type Count = C;

    fn count(&self) -> &C {
        &self.count
    }
}

fn eager_build<C: EagerCount>(value: i64, depth: i64) -> EagerRef<ENode<C>> {
    let (left, right) = if depth >= TREE_DEPTH {
        (EagerRef::null(), EagerRef::null())
    } else {
        (
            eager_build(depth, depth + 1),
            eager_build(depth + 1, depth + 1),
        )
    };
    EagerRef::alloc(ENode {
        count: C::default(),
        left,
        right,
        data: value,
    })
}

fn eager_sum<C: EagerCount>(node: EagerRef<ENode<C>>) -> i64 {
    match node.get() {
        None => 0,
        Some(inner) => inner.data + eager_sum(inner.left.clone()) + eager_sum(inner.right.clone()),
    }
}

fn eager_case<C: EagerCount>() -> i64 {
    eager_sum(eager_build::<C>(0, 0))
}

// ============================================================================
// Deferred harness
// ============================================================================

struct DNode {
    header: Header,
    left: Field<DNode>,
    right: Field<DNode>,
    data: i64,
}

impl Managed for DNode {
    fn header(&self) -> &Header {
        &self.header
    }
}

fn deferred_node(data: i64) -> Local<DNode> {
    Local::alloc(DNode {
        header: Header::new(),
        left: Field::null(),
        right: Field::null(),
        data,
    })
}

fn deferred_fill(node: &Local<DNode>, depth: i64) {
    if depth >= TREE_DEPTH {
        return;
    }
    let inner = node.get().unwrap();
    let left = deferred_node(depth);
    inner.left.set(&left);
    deferred_fill(&left, depth + 1);
    let right = deferred_node(depth + 1);
    inner.right.set(&right);
    deferred_fill(&right, depth + 1);
}

fn deferred_sum(node: Local<DNode>) -> i64 {
    match node.get() {
        None => 0,
        Some(inner) => {
            inner.data + deferred_sum(inner.left.to_local()) + deferred_sum(inner.right.to_local())
        }
    }
}

fn deferred_case(two_threads: bool) -> i64 {
    let total = Arc::new(AtomicI64::new(0));
    start({
        let total = Arc::clone(&total);
        move |rt| {
            let root = deferred_node(0);
            deferred_fill(&root, 0);
            if two_threads {
                thread::scope(|scope| {
                    scope.spawn(|| {
                        let _guard = rt.guard();
                        black_box(deferred_sum(root.clone()));
                    });
                    total.store(deferred_sum(root.clone()), Ordering::SeqCst);
                });
            } else {
                total.store(deferred_sum(root.clone()), Ordering::SeqCst);
            }
        }
    });
    total.load(Ordering::SeqCst)
}

fn bench_tree_build_sum(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_build_sum");
    group.sample_size(10);

    group.bench_function("eager_serial", |b| {
        b.iter(|| black_box(eager_case::<SerialCount>()))
    });

    group.bench_function("eager_atomic", |b| {
        b.iter(|| black_box(eager_case::<AtomicCount>()))
    });

    group.bench_function("deferred", |b| b.iter(|| black_box(deferred_case(false))));

    group.bench_function("deferred_two_threads", |b| {
        b.iter(|| black_box(deferred_case(true)))
    });

    group.finish();
}

criterion_group!(benches, bench_tree_build_sum);
criterion_main!(benches);
