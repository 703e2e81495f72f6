//! Benchmark for load balancer naming and tag diffing
//!
//! Both run on every reconcile of every cluster.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use apiserver_lb_operator::naming::{base36_truncated_hash, generate_elb_name};
use apiserver_lb_operator::{TagDelta, Tags};

fn bench_naming(c: &mut Criterion) {
    let mut group = c.benchmark_group("naming");
    group.throughput(Throughput::Elements(1));

    group.bench_function("elb_name_literal", |b| {
        b.iter(|| generate_elb_name(black_box("ns-cluster")))
    });

    group.bench_function("elb_name_hashed", |b| {
        let base = "a-rather-long-namespace-a-rather-long-cluster-name";
        b.iter(|| generate_elb_name(black_box(base)))
    });

    group.bench_function("base36_hash_32", |b| {
        b.iter(|| base36_truncated_hash(black_box("namespace/cluster-name"), 32))
    });

    group.finish();
}

fn tags(count: usize, offset: usize) -> Tags {
    (0..count)
        .map(|i| (format!("key-{:03}", i + offset), format!("value-{}", i)))
        .collect()
}

fn bench_tag_delta(c: &mut Criterion) {
    let mut group = c.benchmark_group("tag_delta");

    for size in [5usize, 20, 50] {
        let current = tags(size, 0);
        let desired = tags(size, size / 2);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| TagDelta::compute(black_box(&current), black_box(&desired)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_naming, bench_tag_delta);
criterion_main!(benches);
