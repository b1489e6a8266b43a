use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use sharefix::{
    GatherStrategy, HitMap, HeapRegions, PerfCollector, Policy, ThreadSampler, TypeCollector,
    sim::{FieldKind, SimRuntime, SimSettings, TypeTable},
};

const EVENTS: &[u64] = &[0x10D3];

fn create_bench_runtime() -> SimRuntime {
    let mut types = TypeTable::new();
    let node = types.define(
        "Node",
        TypeTable::OBJECT,
        &[("value", FieldKind::Value), ("next", FieldKind::Reference)],
    );
    let mut rt = SimRuntime::new(&SimSettings::default(), types);
    while rt.alloc(node).is_some() {}
    rt
}

fn bench_hitmap_merge(c: &mut Criterion) {
    let mut left = HitMap::new();
    let mut right = HitMap::new();
    for i in 0..10_000usize {
        left.add(0x1000_0000 + i * 24, 1);
        right.add(0x1000_0000 + i * 40, 2);
    }

    c.bench_function("hitmap_merge_10k", |b| {
        b.iter_batched(
            || left.clone(),
            |mut map| {
                map.merge(black_box(&right));
                map
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_drain(c: &mut Criterion) {
    let rt = create_bench_runtime();
    let start = rt.reserved_region().start;

    c.bench_function("drain_replay_10k", |b| {
        b.iter_batched(
            || {
                let mut collector = PerfCollector::new(false);
                collector.update_bounds(&rt);
                let mut sampler = ThreadSampler::replay(EVENTS, false);
                let _ = sampler.open(true);
                for i in 0..10_000usize {
                    sampler.record(0, start + (i % 4096) * 8, 0);
                }
                (collector, sampler)
            },
            |(mut collector, mut sampler)| {
                collector.merge_thread(&mut sampler);
                collector
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_gather(c: &mut Criterion) {
    let rt = create_bench_runtime();
    let policy = Policy::default();
    let mut perf = PerfCollector::new(false);
    perf.update_bounds(&rt);
    perf.seed_synthetic_hits(50_000);

    for (name, strategy) in [
        ("gather_block_start_50k", GatherStrategy::BlockStart),
        ("gather_space_walk_50k", GatherStrategy::SpaceWalk),
    ] {
        c.bench_function(name, |b| {
            b.iter(|| {
                let mut types = TypeCollector::new(strategy);
                types.gather(black_box(&perf), &rt, &policy);
                types
            })
        });
    }
}

criterion_group!(benches, bench_hitmap_merge, bench_drain, bench_gather);
criterion_main!(benches);
