//! Scenario benchmarks: realistic frame workloads through the scheduler.
//!
//! Each scenario builds a populated world with registered systems and
//! measures whole frames (begin → fixed → update → render → end), which
//! exercises the planner, the command buffer fences, and chunk iteration
//! together rather than in isolation.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use quarry_bench::components::*;
use quarry_engine::ecs::{
    query::Query,
    system::{Phase, System, SystemState},
    world::{World, WorldConfig},
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

struct Integrate {
    query: Query<(&'static Velocity, &'static mut Position)>,
}

impl System for Integrate {
    fn run(&mut self, state: &mut SystemState<'_>) {
        let dt = state.dt();
        state.for_each(&mut self.query, |_entity, (vel, pos)| {
            pos.x += vel.x * dt;
            pos.y += vel.y * dt;
            pos.z += vel.z * dt;
        });
    }
}

struct FadeParticles {
    query: Query<&'static mut Particle>,
}

impl System for FadeParticles {
    fn run(&mut self, state: &mut SystemState<'_>) {
        let dt = state.dt();
        let commands = state.commands();
        state.for_each(&mut self.query, |entity, particle| {
            particle.lifetime -= dt;
            particle.fade = (particle.lifetime / 2.0).clamp(0.0, 1.0);
            if particle.lifetime <= 0.0 {
                commands.despawn(entity);
            }
        });
    }
}

struct EmitParticles {
    per_frame: usize,
    rng: ChaCha8Rng,
}

impl System for EmitParticles {
    fn run(&mut self, state: &mut SystemState<'_>) {
        let commands = state.commands();
        for _ in 0..self.per_frame {
            commands.spawn((
                Position::default(),
                Velocity {
                    x: self.rng.gen_range(-1.0..1.0),
                    y: self.rng.gen_range(0.5..2.0),
                    z: 0.0,
                },
                Particle {
                    lifetime: self.rng.gen_range(0.5..2.0),
                    fade: 1.0,
                },
            ));
        }
    }
}

struct ExtractTransforms {
    query: Query<(&'static Position, &'static mut Transform)>,
}

impl System for ExtractTransforms {
    fn run(&mut self, state: &mut SystemState<'_>) {
        state.for_each(&mut self.query, |_entity, (pos, transform)| {
            transform.matrix[3][0] = pos.x;
            transform.matrix[3][1] = pos.y;
            transform.matrix[3][2] = pos.z;
        });
    }
}

fn particle_world(initial: usize, workers: usize) -> World {
    let mut world = World::new(WorldConfig {
        worker_threads: workers,
        ..WorldConfig::default()
    });
    let mut rng = ChaCha8Rng::seed_from_u64(7);

    for _ in 0..initial {
        world.spawn((
            Position::default(),
            Velocity {
                x: rng.gen_range(-1.0..1.0),
                y: rng.gen_range(0.5..2.0),
                z: 0.0,
            },
            Particle {
                lifetime: rng.gen_range(0.5..2.0),
                fade: 1.0,
            },
        ));
    }
    for i in 0..initial / 4 {
        world.spawn((
            Position {
                x: i as f32,
                ..Position::default()
            },
            Velocity::default(),
            Transform::default(),
            Team { id: (i % 4) as u32 },
        ));
    }

    world
        .system(Integrate {
            query: Query::new(),
        })
        .reads::<Velocity>()
        .writes::<Position>()
        .commit()
        .unwrap();
    world
        .system(FadeParticles {
            query: Query::new(),
        })
        .writes::<Particle>()
        .commit()
        .unwrap();
    world
        .system(EmitParticles {
            per_frame: 64,
            rng: ChaCha8Rng::seed_from_u64(11),
        })
        .after::<FadeParticles>()
        .commit()
        .unwrap();
    world
        .system(ExtractTransforms {
            query: Query::new(),
        })
        .in_phase(Phase::Render)
        .reads::<Position>()
        .writes::<Transform>()
        .commit()
        .unwrap();

    world
}

fn run_frame(world: &mut World) {
    const DT: f32 = 1.0 / 60.0;
    world.begin_frame(DT).unwrap();
    world.update(DT).unwrap();
    world.render(0.0).unwrap();
    world.end_frame().unwrap();
}

fn bench_particle_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("scenario_particles");

    for initial in [1_000usize, 10_000] {
        group.bench_with_input(BenchmarkId::new("serial", initial), &initial, |b, &n| {
            let mut world = particle_world(n, 0);
            b.iter(|| {
                run_frame(&mut world);
                black_box(world.entity_count());
            });
        });

        group.bench_with_input(BenchmarkId::new("workers_4", initial), &initial, |b, &n| {
            let mut world = particle_world(n, 4);
            b.iter(|| {
                run_frame(&mut world);
                black_box(world.entity_count());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_particle_frames);
criterion_main!(benches);
