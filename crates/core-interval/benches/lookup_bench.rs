use core_interval::{FragFlags, IntervalVector, VectorPolicy, VmFlags};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn build(n: u64) -> IntervalVector<u64> {
    let mut v = IntervalVector::new(VectorPolicy::NEVER_MERGE_ADJACENT, "bench");
    for i in 0..n {
        v.add(
            i * 0x2000,
            i * 0x2000 + 0x1000,
            VmFlags::empty(),
            FragFlags::empty(),
            i,
        )
        .unwrap();
    }
    v
}

fn bench_lookup(c: &mut Criterion) {
    let v = build(4096);
    c.bench_function("lookup_hit_4096", |b| {
        b.iter(|| {
            for i in (0..4096u64).step_by(7) {
                black_box(v.lookup(black_box(i * 0x2000 + 0x800)));
            }
        })
    });
    c.bench_function("lookup_miss_4096", |b| {
        b.iter(|| {
            for i in (0..4096u64).step_by(7) {
                black_box(v.lookup(black_box(i * 0x2000 + 0x1800)));
            }
        })
    });
}

fn bench_add_remove(c: &mut Criterion) {
    c.bench_function("add_remove_512", |b| {
        b.iter(|| {
            let mut v = build(512);
            for i in 0..512u64 {
                v.remove(i * 0x2000, i * 0x2000 + 0x1000).unwrap();
            }
            black_box(v.len())
        })
    });
}

criterion_group!(benches, bench_lookup, bench_add_remove);
criterion_main!(benches);
