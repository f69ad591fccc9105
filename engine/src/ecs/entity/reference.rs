//! Stable component references that survive structural changes.
//!
//! Raw references into chunk memory are only valid within a single query
//! pass: any structural edit may move the entity to another slot, chunk, or
//! archetype. [`ComponentRef`] is the value to hold *across* frames instead:
//! it carries the entity handle, the last known location, and the structure
//! version that location was captured at, and transparently re-locates on
//! access when the cached location can no longer be trusted.
//!
//! Access is checked, never stale:
//! - the cached location is only used when the structure version still
//!   matches *and* the identity stored at the slot is still this entity
//!   (a swap-remove can move an entity without a version bump);
//! - otherwise the entity table is consulted and the cache refreshed;
//! - a destroyed entity, or one that lost the component, yields `None`.

use std::marker::PhantomData;

use crate::ecs::{
    component::Component,
    entity::Entity,
    storage::Location,
    world::World,
};

/// A re-locating reference to one entity's `C` component.
///
/// Plain value: copyable handle plus a private location cache. The cache is
/// refreshed on access, so a long-lived `ComponentRef` stays O(1) on the hot
/// path (identity compare) and falls back to the entity-table lookup only
/// after structural churn.
pub struct ComponentRef<C: Component> {
    entity: Entity,
    cached: Option<(Location, u64)>,
    _marker: PhantomData<fn() -> C>,
}

impl<C: Component> ComponentRef<C> {
    /// Create a reference to `entity`'s `C`. No lookup happens until the
    /// first access.
    pub fn new(entity: Entity) -> Self {
        Self {
            entity,
            cached: None,
            _marker: PhantomData,
        }
    }

    /// The referenced entity.
    #[inline]
    pub fn entity(&self) -> Entity {
        self.entity
    }

    /// Read the component, re-locating if the cached position went stale.
    ///
    /// `None` when the entity is dead or no longer carries `C`.
    pub fn get<'w>(&mut self, world: &'w World) -> Option<&'w C> {
        let location = self.locate(world)?;
        let id = world.components().get::<C>()?;
        let ptr = world.storage().component_ptr(location, id)?;
        // SAFETY: the location was validated against the live identity and
        // the column stores C; `&World` excludes structural moves.
        Some(unsafe { ptr.cast::<C>().as_ref() })
    }

    /// Mutable access to the component, re-locating as needed.
    pub fn get_mut<'w>(&mut self, world: &'w mut World) -> Option<&'w mut C> {
        let location = self.locate(world)?;
        let id = world.components().get::<C>()?;
        let ptr = world.storage().component_ptr(location, id)?;
        // SAFETY: as `get`, with exclusivity from `&mut World`.
        Some(unsafe { &mut *ptr.cast::<C>().as_ptr() })
    }

    /// Whether the reference currently resolves.
    pub fn is_valid(&mut self, world: &World) -> bool {
        match self.locate(world) {
            Some(location) => {
                let archetype = world.storage().archetype(location.archetype());
                world
                    .components()
                    .get::<C>()
                    .is_some_and(|id| archetype.has(id))
            }
            None => false,
        }
    }

    /// Validate the cached location or fall back to the entity table.
    fn locate(&mut self, world: &World) -> Option<Location> {
        let version = world.structure_version();
        if let Some((location, captured)) = self.cached
            && captured == version
        {
            // Same structure version; a swap-remove may still have moved the
            // entity within its archetype, so confirm the identity.
            let archetype = world.storage().archetype(location.archetype());
            if location.chunk() < archetype.chunk_count()
                && location.slot() < archetype.chunk(location.chunk()).count()
                && archetype.identity(location.chunk(), location.slot()) == self.entity
            {
                return Some(location);
            }
        }

        let location = world.locate(self.entity)?;
        self.cached = Some((location, version));
        Some(location)
    }
}

impl<C: Component> Clone for ComponentRef<C> {
    fn clone(&self) -> Self {
        Self {
            entity: self.entity,
            cached: self.cached,
            _marker: PhantomData,
        }
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

    #[test]
    fn resolves_and_caches() {
        let mut world = World::new(WorldConfig::default());
        let entity = world.spawn(A { x: 1 });

        let mut reference = ComponentRef::<A>::new(entity);
        assert_eq!(reference.get(&world), Some(&A { x: 1 }));

        // Cached access still agrees after value-only mutation.
        world.get_mut::<A>(entity).unwrap().x = 2;
        assert_eq!(reference.get(&world), Some(&A { x: 2 }));
    }

    #[test]
    fn survives_archetype_migration() {
        let mut world = World::new(WorldConfig::default());
        let entity = world.spawn(A { x: 7 });
        let mut reference = ComponentRef::<A>::new(entity);
        assert!(reference.get(&world).is_some());

        // The add moves the entity to {A, B}; the reference re-locates.
        world.add_components(entity, B { y: 1.0 });
        assert_eq!(reference.get(&world), Some(&A { x: 7 }));
    }

    #[test]
    fn survives_swap_remove_of_a_neighbor() {
        // Given - the referenced entity sits in the last slot
        let mut world = World::new(WorldConfig::default());
        let first = world.spawn(A { x: 0 });
        let _middle = world.spawn(A { x: 1 });
        let last = world.spawn(A { x: 2 });

        let mut reference = ComponentRef::<A>::new(last);
        assert!(reference.get(&world).is_some());

        // When - despawning the first entity swap-moves `last` into slot 0
        // without bumping the structure version
        world.despawn(first);

        // Then - the identity check catches the move and re-locates
        assert_eq!(reference.get(&world), Some(&A { x: 2 }));
    }

    #[test]
    fn dead_entity_yields_none_forever() {
        let mut world = World::new(WorldConfig::default());
        let entity = world.spawn(A { x: 1 });
        let mut reference = ComponentRef::<A>::new(entity);
        assert!(reference.is_valid(&world));

        world.despawn(entity);
        assert_eq!(reference.get(&world), None);
        assert!(!reference.is_valid(&world));

        // Index reuse must not resurrect the reference.
        let replacement = world.spawn(A { x: 9 });
        assert_eq!(replacement.id(), entity.id());
        assert_eq!(reference.get(&world), None);
    }

    #[test]
    fn removed_component_yields_none() {
        let mut world = World::new(WorldConfig::default());
        let entity = world.spawn((A { x: 1 }, B { y: 1.0 }));
        let mut reference = ComponentRef::<B>::new(entity);
        assert!(reference.get(&world).is_some());

        world.remove_components::<B>(entity);
        assert_eq!(reference.get(&world), None);
        assert!(!reference.is_valid(&world));
    }

    #[test]
    fn mutation_through_reference() {
        let mut world = World::new(WorldConfig::default());
        let entity = world.spawn(A { x: 1 });
        let mut reference = ComponentRef::<A>::new(entity);

        reference.get_mut(&mut world).unwrap().x = 42;
        assert_eq!(world.get::<A>(entity), Some(&A { x: 42 }));
    }
}
