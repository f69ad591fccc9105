//! Minimal end-to-end walkthrough: spawn entities, register systems, drive a
//! few frames, and let deferred edits reconcile at the frame fences.
//!
//! Run with `cargo run --example simple_world`.

use quarry_engine::ecs::{
    query::Query,
    system::{System, SystemState},
    world::{World, WorldConfig},
};
use quarry_macros::Component;

#[derive(Component, Debug, Clone, Copy, Default)]
struct Position {
    x: f32,
    y: f32,
}

#[derive(Component, Debug, Clone, Copy, Default)]
struct Velocity {
    dx: f32,
    dy: f32,
}

#[derive(Component, Debug, Clone, Copy)]
struct Expires {
    at_frame: u64,
}

/// Integrates positions from velocities.
struct Movement {
    query: Query<(&'static Velocity, &'static mut Position)>,
}

impl System for Movement {
    fn run(&mut self, state: &mut SystemState<'_>) {
        let dt = state.dt();
        state.for_each(&mut self.query, |_entity, (vel, pos)| {
            pos.x += vel.dx * dt;
            pos.y += vel.dy * dt;
        });
    }
}

/// Despawns entities whose lifetime ran out. Structural, so it records into
/// the command buffer; the despawns land at the end-of-frame flush.
struct Reaper {
    query: Query<&'static Expires>,
}

impl System for Reaper {
    fn run(&mut self, state: &mut SystemState<'_>) {
        let commands = state.commands();
        let frame = state.frame_number();
        state.for_each(&mut self.query, |entity, expires| {
            if expires.at_frame <= frame {
                commands.despawn(entity);
            }
        });
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut world = World::new(WorldConfig {
        worker_threads: 2,
        ..WorldConfig::default()
    });

    for i in 0..8 {
        world.spawn((
            Position::default(),
            Velocity {
                dx: 1.0 + i as f32 * 0.25,
                dy: 0.5,
            },
        ));
    }
    // One short-lived entity the reaper will collect on frame 3.
    world.spawn((
        Position::default(),
        Velocity::default(),
        Expires { at_frame: 3 },
    ));

    world
        .system(Movement {
            query: Query::new(),
        })
        .reads::<Velocity>()
        .writes::<Position>()
        .commit()?;
    world
        .system(Reaper {
            query: Query::new(),
        })
        .after::<Movement>()
        .reads::<Expires>()
        .commit()?;

    const DT: f32 = 1.0 / 60.0;
    for _ in 0..5 {
        world.begin_frame(DT)?;
        world.update(DT)?;
        world.render(0.0)?;
        world.end_frame()?;
    }

    let mut report = Query::<(&Position, &Velocity)>::new();
    report.for_each(&mut world, |entity, (pos, vel)| {
        println!(
            "{entity:?}: pos=({:.3}, {:.3}) vel=({:.2}, {:.2})",
            pos.x, pos.y, vel.dx, vel.dy
        );
    });
    println!(
        "{} entities alive after {} frames",
        world.entity_count(),
        world.frame_number()
    );
    Ok(())
}
