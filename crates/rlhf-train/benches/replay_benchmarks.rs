//! Replay and update benchmarks
//!
//! Hot paths:
//! 1. Buffer push - once per accepted feedback with a known prediction
//! 2. Buffer sample - once per training cycle
//! 3. Priority write-back - once per training cycle
//! 4. Strategy update - once per training cycle, on the blocking pool

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rlhf_core::FeedbackKey;
use rlhf_train::{
    apply_update, Action, Experience, ExperienceBuffer, PrioritizedExperienceBuffer, SoftmaxPolicy, State,
    UpdateParams, UpdateStrategy,
};

const FEATURES: usize = 16;
const ACTIONS: usize = 8;

fn experience(i: usize, rng: &mut StdRng) -> Experience {
    let features = (0..FEATURES).map(|_| rng.gen_range(-1.0..1.0)).collect();
    Experience::new(
        FeedbackKey::new(format!("case-{}", i / 4), format!("pred-{i}"), "officer"),
        State::new(features),
        Action(i % ACTIONS),
        rng.gen_range(-5.0..20.0),
    )
}

fn prioritized(size: usize) -> PrioritizedExperienceBuffer {
    let mut rng = StdRng::seed_from_u64(7);
    let mut buffer = PrioritizedExperienceBuffer::new(size, 0.6, 0.4, 0.0);
    for i in 0..size {
        buffer.push(experience(i, &mut rng));
    }
    buffer
}

// ============================================================================
// Buffer benchmarks
// ============================================================================

fn bench_buffer_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_push");
    group.throughput(Throughput::Elements(1000));

    for size in [1_000, 10_000] {
        let mut rng = StdRng::seed_from_u64(1);
        let items: Vec<_> = (0..1000).map(|i| experience(i, &mut rng)).collect();

        group.bench_with_input(BenchmarkId::new("uniform", size), &size, |b, &size| {
            b.iter(|| {
                let mut buffer = ExperienceBuffer::new(size);
                for item in &items {
                    buffer.push(item.clone());
                }
                black_box(buffer.len())
            });
        });

        group.bench_with_input(BenchmarkId::new("prioritized", size), &size, |b, &size| {
            b.iter(|| {
                let mut buffer = PrioritizedExperienceBuffer::new(size, 0.6, 0.4, 0.001);
                for item in &items {
                    buffer.push(item.clone());
                }
                black_box(buffer.len())
            });
        });
    }

    group.finish();
}

fn bench_prioritized_sample(c: &mut Criterion) {
    let mut group = c.benchmark_group("prioritized_sample");

    for batch_size in [32, 128] {
        let mut buffer = prioritized(10_000);
        let mut rng = StdRng::seed_from_u64(2);
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch_size, |b, &n| {
            b.iter(|| black_box(buffer.sample_with(n, &mut rng)));
        });
    }

    group.finish();
}

fn bench_priority_update(c: &mut Criterion) {
    let mut buffer = prioritized(10_000);
    let mut rng = StdRng::seed_from_u64(3);
    let Ok(batch) = buffer.sample_with(32, &mut rng) else {
        return;
    };
    let indices = batch.indices();
    let priorities: Vec<f64> = (0..indices.len()).map(|i| 0.5 + i as f64).collect();

    c.bench_function("priority_update_32", |b| {
        b.iter(|| black_box(buffer.update_priorities(&indices, &priorities)));
    });
}

// ============================================================================
// Update benchmarks
// ============================================================================

fn bench_strategy_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("strategy_update");
    let mut buffer = prioritized(1_000);
    let mut rng = StdRng::seed_from_u64(4);
    let Ok(batch) = buffer.sample_with(32, &mut rng) else {
        return;
    };
    let params = UpdateParams::default();

    for strategy in [UpdateStrategy::Reinforce, UpdateStrategy::Ppo, UpdateStrategy::ActorCritic] {
        group.bench_function(strategy.as_str(), |b| {
            let mut model = SoftmaxPolicy::new(FEATURES, ACTIONS);
            b.iter(|| black_box(apply_update(strategy, &mut model, &batch, &params)));
        });
    }

    group.finish();
}

criterion_group!(
    name = buffer_benchmarks;
    config = Criterion::default();
    targets =
        bench_buffer_push,
        bench_prioritized_sample,
        bench_priority_update,
);

criterion_group!(
    name = update_benchmarks;
    config = Criterion::default();
    targets = bench_strategy_update,
);

criterion_main!(buffer_benchmarks, update_benchmarks);
