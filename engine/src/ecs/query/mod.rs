//! Typed queries over archetype storage.
//!
//! A [`Query`] is a value: a filter (`with-all` from its data plus any extra
//! [`with`](Query::with) constraints, `with-none` from
//! [`without`](Query::without)) together with a cached list of matching
//! archetypes. The cache records the structure version it was built against
//! and transparently rebuilds when the version has moved on, so a query may be
//! stored across frames and stays correct through archetype churn.
//!
//! Iteration walks matching archetypes → their chunks → live slots, handing
//! the callback the slot's identity and the requested component references.
//! Within a chunk the visit order is insertion order; across chunks it is
//! archetype-discovery order.

mod data;
mod parallel;

use std::marker::PhantomData;

pub use data::{Out, QueryData};

use crate::ecs::{
    component::{Component, Signature, TypeId, TypeRegistry},
    entity::Entity,
    storage::{ArchetypeId, Storage},
    world::{Access, World},
};

/// Resolver registering one component type and returning its id. Stored as a
/// plain fn pointer so filters can be built before any registry exists.
type IdResolver = fn(&TypeRegistry) -> TypeId;

fn resolve_id<C: Component>(registry: &TypeRegistry) -> TypeId {
    registry.register::<C>()
}

/// The resolved, per-registry part of a query: filter signatures, declared
/// access, and the archetype cache.
struct QueryState {
    with_all: Signature,
    with_none: Signature,
    access: Access,
    cached: Vec<ArchetypeId>,
    cached_version: Option<u64>,
}

/// A declarative filter plus per-component access modes, producing an
/// iterator over matching slots. See the module docs for caching behavior.
///
/// `D` is the [`QueryData`]: `&C` (read), `&mut C` (read/write), `Out<C>`
/// (write-only), or a tuple of those.
pub struct Query<D: QueryData> {
    extra_with: Vec<IdResolver>,
    extra_without: Vec<IdResolver>,
    state: Option<QueryState>,
    _marker: PhantomData<fn() -> D>,
}

impl<D: QueryData> Default for Query<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: QueryData> Query<D> {
    /// Create a query over `D` with no extra filters.
    pub fn new() -> Self {
        Self {
            extra_with: Vec::new(),
            extra_without: Vec::new(),
            state: None,
            _marker: PhantomData,
        }
    }

    /// Require matched entities to also carry `C`, without fetching it.
    pub fn with<C: Component>(mut self) -> Self {
        self.extra_with.push(resolve_id::<C>);
        self.state = None;
        self
    }

    /// Exclude entities carrying `C`.
    pub fn without<C: Component>(mut self) -> Self {
        self.extra_without.push(resolve_id::<C>);
        self.state = None;
        self
    }

    /// The query's declared component access, for scheduler registration.
    pub fn access(&mut self, registry: &TypeRegistry) -> Access {
        self.state(registry).access.clone()
    }

    /// Visit every matching slot, yielding the identity and the requested
    /// component references.
    ///
    /// Takes `&mut World`: with the world exclusively borrowed no other
    /// component access can alias the mutable references handed out. Systems
    /// use [`SystemState::for_each`](crate::ecs::system::SystemState::for_each),
    /// which runs on a shared world under the scheduler's conflict analysis.
    pub fn for_each(&mut self, world: &mut World, f: impl for<'a> FnMut(Entity, D::Item<'a>)) {
        // SAFETY: the exclusive world borrow rules out conflicting access.
        unsafe { self.for_each_shared(world, f) }
    }

    /// Visit every matching slot on a shared world reference.
    ///
    /// # Safety
    /// The caller must guarantee that no other code concurrently accesses, or
    /// reenters during the iteration to access, any component this query
    /// declares as written (and writes none it declares as read). The
    /// scheduler guarantees this for systems via conflict analysis.
    pub(crate) unsafe fn for_each_shared(
        &mut self,
        world: &World,
        mut f: impl for<'a> FnMut(Entity, D::Item<'a>),
    ) {
        self.revalidate(world.storage(), world.components());
        let storage = world.storage();
        let _guard = storage.iteration_guard();
        let state = self.state.as_ref().expect("state built by revalidate");
        for id in &state.cached {
            let archetype = storage.archetype(*id);
            for chunk in 0..archetype.chunk_count() {
                let count = archetype.chunk(chunk).count();
                let fetch = D::fetch_init(archetype, chunk);
                let identities = archetype.identities(chunk);
                for slot in 0..count {
                    // SAFETY: slot < count is live; per-slot exclusivity holds
                    // because each slot is visited exactly once and the caller
                    // upholds the cross-query contract.
                    let item = unsafe { D::fetch(&fetch, slot) };
                    f(identities[slot as usize], item);
                }
            }
        }
    }

    /// The number of matching entities. O(number of matching archetypes).
    pub fn count(&mut self, world: &World) -> usize {
        self.revalidate(world.storage(), world.components());
        let storage = world.storage();
        let state = self.state.as_ref().expect("state built by revalidate");
        state
            .cached
            .iter()
            .map(|id| storage.archetype(*id).len())
            .sum()
    }

    /// Whether no entity matches. O(number of matching archetypes).
    pub fn is_empty(&mut self, world: &World) -> bool {
        self.count(world) == 0
    }

    /// The archetypes the cache currently holds, for inspection in tests.
    #[cfg(test)]
    pub(crate) fn cached_archetypes(&self) -> &[ArchetypeId] {
        self.state.as_ref().map(|s| s.cached.as_slice()).unwrap_or(&[])
    }

    /// Rebuild the archetype cache if the structure version moved.
    pub(crate) fn revalidate(&mut self, storage: &Storage, registry: &TypeRegistry) {
        let state = self.state(registry);
        let version = storage.version();
        if state.cached_version != Some(version) {
            state.cached = storage.matching_ids(&state.with_all, &state.with_none);
            state.cached_version = Some(version);
        }
    }

    /// Resolve the filter and access against a registry, once.
    fn state(&mut self, registry: &TypeRegistry) -> &mut QueryState {
        if self.state.is_none() {
            let mut ids = Vec::new();
            D::collect_ids(registry, &mut ids);
            #[cfg(debug_assertions)]
            {
                let mut seen = ids.clone();
                seen.sort();
                seen.dedup();
                assert_eq!(
                    seen.len(),
                    ids.len(),
                    "a component type may appear at most once in a query's access list"
                );
            }

            let mut with_all_ids = ids;
            with_all_ids.extend(self.extra_with.iter().map(|resolve| resolve(registry)));
            let with_all = Signature::new(with_all_ids);
            let with_none = Signature::new(
                self.extra_without
                    .iter()
                    .map(|resolve| resolve(registry))
                    .collect::<Vec<_>>(),
            );
            debug_assert!(
                !with_all.contains_any(&with_none),
                "query excludes a component it also requires"
            );

            let mut access = Access::new();
            D::collect_access(registry, &mut access);

            self.state = Some(QueryState {
                with_all,
                with_none,
                access,
                cached: Vec::new(),
                cached_version: None,
            });
        }
        self.state.as_mut().expect("state just built")
    }
}

#[cfg(test)]
mod tests {
    use quarry_macros::Component;

    use super::*;
    use crate::ecs::world::WorldConfig;

    #[derive(Component, Debug, Clone, Copy, PartialEq)]
    struct A {
        x: i32,
    }

    #[derive(Component, Debug, Clone, Copy, PartialEq)]
    struct B {
        y: f32,
    }

    #[derive(Component, Debug, Clone, Copy, PartialEq)]
    struct C {
        z: u64,
    }

    fn world() -> World {
        World::new(WorldConfig::default())
    }

    #[test]
    fn filter_visits_with_all_minus_with_none() {
        // Given - S4 population
        let mut world = world();
        let e1 = world.spawn(A { x: 1 });
        let e2 = world.spawn((A { x: 2 }, B { y: 2.0 }));
        let _e3 = world.spawn((A { x: 3 }, B { y: 3.0 }, C { z: 3 }));
        let _e4 = world.spawn(B { y: 4.0 });

        // When
        let mut query = Query::<&A>::new().without::<C>();
        let mut visited = Vec::new();
        query.for_each(&mut world, |entity, _a| visited.push(entity));

        // Then - exactly {e1, e2}
        visited.sort();
        let mut expected = vec![e1, e2];
        expected.sort();
        assert_eq!(visited, expected);
    }

    #[test]
    fn mutation_through_query_sticks() {
        // Given
        let mut world = world();
        let entity = world.spawn((A { x: 1 }, B { y: 0.0 }));

        // When
        let mut query = Query::<(&A, &mut B)>::new();
        query.for_each(&mut world, |_entity, (a, b)| {
            b.y = a.x as f32 * 2.0;
        });

        // Then
        assert_eq!(world.get::<B>(entity), Some(&B { y: 2.0 }));
    }

    #[test]
    fn out_access_yields_mutable() {
        // Given
        let mut world = world();
        let entity = world.spawn(B { y: 1.0 });

        // When - write-only access overwrites without reading
        let mut query = Query::<Out<B>>::new();
        query.for_each(&mut world, |_entity, b| {
            *b = B { y: 9.0 };
        });

        // Then
        assert_eq!(world.get::<B>(entity), Some(&B { y: 9.0 }));
    }

    #[test]
    fn with_filter_constrains_without_fetching() {
        let mut world = world();
        let _plain = world.spawn(A { x: 1 });
        let tagged = world.spawn((A { x: 2 }, B { y: 0.0 }));

        let mut query = Query::<&A>::new().with::<B>();
        let mut visited = Vec::new();
        query.for_each(&mut world, |entity, _| visited.push(entity));

        assert_eq!(visited, vec![tagged]);
    }

    #[test]
    fn cache_revalidates_on_structure_change() {
        // Given
        let mut world = world();
        world.spawn(A { x: 1 });

        let mut query = Query::<&A>::new();
        assert_eq!(query.count(&world), 1);
        let cached_before = query.cached_archetypes().to_vec();

        // When - a new archetype that matches appears
        world.spawn((A { x: 2 }, B { y: 1.0 }));

        // Then - reuse would be stale; the cache rebuilds to the fresh set
        assert_eq!(query.count(&world), 2);
        let cached_after = query.cached_archetypes().to_vec();
        assert_eq!(cached_before.len(), 1);
        assert_eq!(cached_after.len(), 2);

        // And the cached list equals the freshly computed matching set
        let with_all =
            <A as crate::ecs::component::IntoSignature>::into_signature(world.components());
        let fresh = world.storage().matching_ids(&with_all, &Signature::EMPTY);
        assert_eq!(cached_after, fresh);
    }

    #[test]
    fn count_is_zero_for_unmatched() {
        let mut world = world();
        world.spawn(A { x: 1 });

        let mut query = Query::<(&A, &B)>::new();
        assert!(query.is_empty(&world));
        assert_eq!(query.count(&world), 0);
    }

    #[test]
    fn stored_query_survives_archetype_churn() {
        // Given - a long-lived query used across structural changes
        let mut world = world();
        let mut query = Query::<&A>::new();

        world.spawn(A { x: 1 });
        assert_eq!(query.count(&world), 1);

        let extra = world.spawn((A { x: 2 }, C { z: 1 }));
        assert_eq!(query.count(&world), 2);

        world.despawn(extra);
        assert_eq!(query.count(&world), 1);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "at most once")]
    fn duplicate_component_access_is_rejected() {
        let mut world = world();
        world.spawn(A { x: 1 });
        let mut query = Query::<(&A, &mut A)>::new();
        query.for_each(&mut world, |_e, _| {});
    }

    #[test]
    fn visit_order_within_chunk_is_insertion_order() {
        let mut world = world();
        let spawned: Vec<Entity> = (0..32).map(|i| world.spawn(A { x: i })).collect();

        let mut query = Query::<&A>::new();
        let mut visited = Vec::new();
        query.for_each(&mut world, |entity, a| visited.push((entity, a.x)));

        let expected: Vec<(Entity, i32)> =
            spawned.iter().copied().zip(0..32).collect();
        assert_eq!(visited, expected);
    }
}
