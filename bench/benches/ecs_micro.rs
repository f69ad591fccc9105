//! ECS microbenchmarks using Criterion.
//!
//! Individual operations in isolation:
//! - entity spawn / despawn
//! - chunk iteration through queries
//! - component add/remove (archetype migration)
//! - deferred command recording and flush

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use quarry_bench::components::*;
use quarry_engine::ecs::{
    query::Query,
    world::{World, WorldConfig},
};

fn bench_spawn(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn");

    for count in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(
            BenchmarkId::new("single_component", count),
            &count,
            |b, &n| {
                b.iter(|| {
                    let mut world = World::new(WorldConfig::default());
                    for _ in 0..n {
                        black_box(world.spawn(Position::default()));
                    }
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("four_components", count),
            &count,
            |b, &n| {
                b.iter(|| {
                    let mut world = World::new(WorldConfig::default());
                    for _ in 0..n {
                        black_box(world.spawn((
                            Transform::default(),
                            Position::default(),
                            Rotation::default(),
                            Velocity::default(),
                        )));
                    }
                });
            },
        );

        // Batch spawn resolves the archetype once for the whole block.
        group.bench_with_input(BenchmarkId::new("batch_single", count), &count, |b, &n| {
            b.iter(|| {
                let mut world = World::new(WorldConfig::default());
                black_box(world.spawn_many((0..n).map(|_| Position::default())));
            });
        });

        group.bench_with_input(BenchmarkId::new("batch_four", count), &count, |b, &n| {
            b.iter(|| {
                let mut world = World::new(WorldConfig::default());
                black_box(world.spawn_many((0..n).map(|_| {
                    (
                        Transform::default(),
                        Position::default(),
                        Rotation::default(),
                        Velocity::default(),
                    )
                })));
            });
        });
    }

    group.finish();
}

fn bench_iteration(c: &mut Criterion) {
    let mut group = c.benchmark_group("iterate");

    for count in [1_000usize, 10_000, 100_000] {
        group.throughput(Throughput::Elements(count as u64));

        let mut world = World::new(WorldConfig::default());
        for i in 0..count {
            world.spawn((
                Position {
                    x: i as f32,
                    ..Position::default()
                },
                Velocity {
                    x: 1.0,
                    ..Velocity::default()
                },
            ));
        }

        group.bench_with_input(BenchmarkId::new("read_write", count), &count, |b, _| {
            let mut query = Query::<(&Velocity, &mut Position)>::new();
            b.iter(|| {
                query.for_each(&mut world, |_entity, (vel, pos)| {
                    pos.x += vel.x;
                    pos.y += vel.y;
                    pos.z += vel.z;
                });
            });
        });

        group.bench_with_input(BenchmarkId::new("read_only", count), &count, |b, _| {
            let mut query = Query::<&Position>::new();
            b.iter(|| {
                let mut sum = 0.0f32;
                query.for_each(&mut world, |_entity, pos| {
                    sum += pos.x;
                });
                black_box(sum);
            });
        });
    }

    group.finish();
}

fn bench_parallel_iteration(c: &mut Criterion) {
    let mut group = c.benchmark_group("par_iterate");

    for count in [10_000usize, 100_000] {
        group.throughput(Throughput::Elements(count as u64));

        let mut world = World::new(WorldConfig {
            worker_threads: 4,
            ..WorldConfig::default()
        });
        for _ in 0..count {
            world.spawn((Position::default(), Velocity { x: 1.0, y: 0.0, z: 0.0 }));
        }

        group.bench_with_input(BenchmarkId::new("read_write", count), &count, |b, _| {
            let mut query = Query::<(&Velocity, &mut Position)>::new();
            b.iter(|| {
                query.par_for_each(&mut world, |_entity, (vel, pos)| {
                    pos.x += vel.x;
                });
            });
        });
    }

    group.finish();
}

fn bench_migration(c: &mut Criterion) {
    let mut group = c.benchmark_group("migrate");

    for count in [100usize, 1_000] {
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(BenchmarkId::new("add_remove", count), &count, |b, &n| {
            let mut world = World::new(WorldConfig::default());
            let entities: Vec<_> = (0..n)
                .map(|_| world.spawn((Position::default(), Velocity::default())))
                .collect();

            b.iter(|| {
                for &entity in &entities {
                    world.add_components(entity, Health { current: 1.0, max: 1.0 });
                }
                for &entity in &entities {
                    world.remove_components::<Health>(entity);
                }
            });
        });
    }

    group.finish();
}

fn bench_commands(c: &mut Criterion) {
    let mut group = c.benchmark_group("commands");

    for count in [100usize, 1_000] {
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(
            BenchmarkId::new("record_and_flush_spawn", count),
            &count,
            |b, &n| {
                b.iter(|| {
                    let mut world = World::new(WorldConfig::default());
                    for _ in 0..n {
                        world
                            .commands()
                            .spawn(Position::default())
                            .add(Velocity::default());
                    }
                    world.flush().unwrap();
                    black_box(world.entity_count());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_spawn,
    bench_iteration,
    bench_parallel_iteration,
    bench_migration,
    bench_commands
);
criterion_main!(benches);
