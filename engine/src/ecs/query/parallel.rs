//! Chunk-parallel query iteration.
//!
//! The parallel for-each snapshots the matching `(archetype, chunk)` pairs,
//! then dispatches one work item per chunk to the world's worker pool.
//! Distinct chunks address disjoint memory, so mutable component access
//! across work items never aliases; the storage stays read-locked for the
//! duration (structural edits belong in the command buffer).
//!
//! Without a worker pool, or when already running on a worker (a system
//! executing in a parallel layer), iteration degrades to serial in place:
//! nesting pool joins inside pool workers would risk starving the pool.
//!
//! Cancellation is cooperative: the frame's token is polled between chunks,
//! and in-flight work items finish their current chunk.

use crate::{
    ecs::{
        entity::Entity,
        query::{Query, QueryData},
        storage::{ArchetypeId, Storage},
        world::World,
    },
    tasks,
};

impl<D: QueryData> Query<D> {
    /// Visit every matching slot, chunk-parallel on the world's worker pool.
    ///
    /// Falls back to serial iteration when the world has no pool. The callback
    /// runs concurrently from worker threads and must therefore be `Send +
    /// Sync`; ordering between chunks is unspecified.
    pub fn par_for_each(
        &mut self,
        world: &mut World,
        f: impl for<'a> Fn(Entity, D::Item<'a>) + Send + Sync,
    ) {
        // SAFETY: the exclusive world borrow rules out conflicting access
        // from anything but our own work items, which are chunk-disjoint.
        unsafe { self.par_for_each_shared(world, &f) }
    }

    /// Chunk-parallel visit on a shared world reference.
    ///
    /// # Safety
    /// As [`Query::for_each_shared`]: no concurrent access to the components
    /// this query writes may exist outside the iteration itself. The
    /// scheduler guarantees this for systems via conflict analysis.
    pub(crate) unsafe fn par_for_each_shared(
        &mut self,
        world: &World,
        f: &(impl for<'a> Fn(Entity, D::Item<'a>) + Send + Sync),
    ) {
        self.revalidate(world.storage(), world.components());
        let storage = world.storage();
        let state_cached: Vec<ArchetypeId> = {
            // Snapshot the matching set; the structure cannot change while the
            // iteration guard is held.
            let state = self.state.as_ref().expect("state built by revalidate");
            state.cached.clone()
        };

        let _guard = storage.iteration_guard();

        let executor = match world.executor() {
            Some(executor) if !tasks::on_worker() => executor,
            _ => {
                // Serial fallback: no pool, or nested inside a worker.
                for id in &state_cached {
                    run_chunks_serial::<D>(storage, *id, f);
                }
                return;
            }
        };

        let cancel = world.cancel_token();
        executor.scope(|scope| {
            for id in state_cached {
                let archetype = storage.archetype(id);
                for chunk in 0..archetype.chunk_count() {
                    let cancel = cancel.clone();
                    scope.spawn(move || {
                        if cancel.is_cancelled() {
                            return;
                        }
                        // SAFETY: each (archetype, chunk) pair is dispatched
                        // exactly once, so mutable fetches are chunk-disjoint
                        // across work items; the iteration guard keeps the
                        // snapshot stable.
                        unsafe { run_chunk::<D>(storage, id, chunk, f) };
                    });
                }
            }
        });
    }
}

fn run_chunks_serial<D: QueryData>(
    storage: &Storage,
    id: ArchetypeId,
    f: &impl for<'a> Fn(Entity, D::Item<'a>),
) {
    let archetype = storage.archetype(id);
    for chunk in 0..archetype.chunk_count() {
        // SAFETY: serial execution visits each slot exactly once.
        unsafe { run_chunk::<D>(storage, id, chunk, f) };
    }
}

/// Iterate one chunk's live slots.
///
/// # Safety
/// The chunk must not be structurally mutated during the call, and no other
/// live access to the components `D` writes may cover this chunk.
unsafe fn run_chunk<D: QueryData>(
    storage: &Storage,
    id: ArchetypeId,
    chunk: u32,
    f: &impl for<'a> Fn(Entity, D::Item<'a>),
) {
    let archetype = storage.archetype(id);
    let count = archetype.chunk(chunk).count();
    let fetch = D::fetch_init(archetype, chunk);
    let identities = archetype.identities(chunk);
    for slot in 0..count {
        // SAFETY: slot < count is live; exclusivity per the function contract.
        let item = unsafe { D::fetch(&fetch, slot) };
        f(identities[slot as usize], item);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    use quarry_macros::Component;

    use crate::ecs::{
        query::Query,
        world::{World, WorldConfig},
    };

    #[derive(Component, Debug, Clone, Copy, PartialEq)]
    struct Value {
        n: i64,
    }

    #[derive(Component, Debug, Clone, Copy, PartialEq)]
    struct Doubled {
        n: i64,
    }

    fn parallel_world() -> World {
        World::new(WorldConfig {
            worker_threads: 4,
            ..WorldConfig::default()
        })
    }

    #[test]
    fn parallel_visits_every_entity_once() {
        // Given - enough entities to span several chunks
        let mut world = parallel_world();
        let total = 5_000i64;
        for i in 0..total {
            world.spawn(Value { n: i });
        }

        // When
        let visits = AtomicUsize::new(0);
        let sum = AtomicI64::new(0);
        let mut query = Query::<&Value>::new();
        query.par_for_each(&mut world, |_entity, value| {
            visits.fetch_add(1, Ordering::Relaxed);
            sum.fetch_add(value.n, Ordering::Relaxed);
        });

        // Then
        assert_eq!(visits.load(Ordering::Relaxed), total as usize);
        assert_eq!(sum.load(Ordering::Relaxed), total * (total - 1) / 2);
    }

    #[test]
    fn parallel_mutation_is_chunk_disjoint() {
        // Given
        let mut world = parallel_world();
        for i in 0..2_000 {
            world.spawn((Value { n: i }, Doubled { n: 0 }));
        }

        // When
        let mut query = Query::<(&Value, &mut Doubled)>::new();
        query.par_for_each(&mut world, |_entity, (value, doubled)| {
            doubled.n = value.n * 2;
        });

        // Then
        let mut check = Query::<(&Value, &Doubled)>::new();
        check.for_each(&mut world, |_entity, (value, doubled)| {
            assert_eq!(doubled.n, value.n * 2);
        });
    }

    #[test]
    fn serial_fallback_without_pool() {
        // Given - a world configured with no workers
        let mut world = World::new(WorldConfig {
            worker_threads: 0,
            ..WorldConfig::default()
        });
        for i in 0..100 {
            world.spawn(Value { n: i });
        }

        // When / Then - still visits everything
        let visits = AtomicUsize::new(0);
        let mut query = Query::<&Value>::new();
        query.par_for_each(&mut world, |_entity, _value| {
            visits.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(visits.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn cancellation_skips_pending_chunks() {
        // Given - a cancelled frame token
        let mut world = parallel_world();
        for i in 0..10_000 {
            world.spawn(Value { n: i });
        }
        world.cancel_token().cancel();

        // When - work items observe the token before starting their chunk
        let visits = AtomicUsize::new(0);
        let mut query = Query::<&Value>::new();
        query.par_for_each(&mut world, |_entity, _value| {
            visits.fetch_add(1, Ordering::Relaxed);
        });

        // Then - nothing ran; every work item saw the cancelled token
        assert_eq!(visits.load(Ordering::Relaxed), 0);
    }
}
