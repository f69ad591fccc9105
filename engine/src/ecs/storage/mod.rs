//! Archetype storage: the world's component data engine.
//!
//! [`Storage`] interns one [`Archetype`] per distinct component signature and
//! routes every structural edit (spawn, despawn, add, remove) to the right
//! archetype, including the cross-archetype move that adding or removing a
//! component implies. It owns the [`ChunkPool`] the archetypes draw their
//! blocks from and the **structure version**: a monotonically increasing
//! counter bumped whenever the set of archetypes grows or an entity moves
//! between archetypes, which is exactly what invalidates a cached query's
//! archetype list.
//!
//! # Structural-change discipline
//!
//! Mutating component *values* in place is always safe inside a query.
//! Changing which archetype an entity belongs to, creating or destroying
//! entities, or allocating chunks is **structural** and forbidden while any
//! query iteration is running: such edits go through the deferred command
//! buffer and are played back at frame fences. In debug builds an iteration
//! counter catches violations; the safe public API makes them unreachable
//! because structural edits need `&mut World` while iteration borrows it
//! shared.

pub mod archetype;
pub mod chunk;
mod location;

use std::{
    collections::HashMap,
    error::Error,
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};

use log::{debug, warn};

pub use archetype::{Archetype, Id as ArchetypeId};
pub use chunk::{ChunkPool, DEFAULT_CHUNK_SIZE};
pub use location::Location;

use crate::ecs::{
    component::{BoxedBundle, Bundle, Signature, TypeId, TypeRegistry},
    entity::{Entities, Entity},
    storage::archetype::SlotTarget,
};

/// Failures the storage layer can surface to the frame driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// The chunk pool could not allocate a block. The failed operation was
    /// abandoned; storage remains consistent.
    OutOfMemory,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::OutOfMemory => write!(f, "chunk pool allocation failed"),
        }
    }
}

impl Error for StorageError {}

/// All archetypes of one world, hash-interned by signature.
pub struct Storage {
    /// The archetypes, indexed by [`ArchetypeId`].
    archetypes: Vec<Archetype>,

    /// Signature → archetype interning map.
    by_signature: HashMap<Signature, ArchetypeId>,

    /// The chunk pool all archetypes draw from.
    pool: ChunkPool,

    /// Monotonic counter of archetype-set changes; cached queries compare
    /// against it to detect invalidation.
    version: u64,

    /// Number of query iterations currently walking this storage. Debug guard
    /// against structural edits inside a query.
    iterating: AtomicU32,
}

impl Storage {
    /// Create an empty storage whose chunks are `chunk_size` bytes.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            archetypes: Vec::new(),
            by_signature: HashMap::new(),
            pool: ChunkPool::new(chunk_size),
            version: 0,
            iterating: AtomicU32::new(0),
        }
    }

    /// The current structure version.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The number of interned archetypes.
    #[inline]
    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    /// Get an archetype by id.
    ///
    /// # Panics
    /// Panics if the id is out of bounds; archetype ids are never retired, so
    /// a bad id is a caller bug.
    #[inline]
    pub fn archetype(&self, id: ArchetypeId) -> &Archetype {
        assert!(id.index() < self.archetypes.len(), "archetype id out of bounds");
        &self.archetypes[id.index()]
    }

    /// The chunk pool, for diagnostics.
    #[inline]
    pub fn pool(&self) -> &ChunkPool {
        &self.pool
    }

    /// Intern the archetype for a signature, creating it (and bumping the
    /// structure version) when it does not exist yet.
    ///
    /// # Panics
    /// Panics if a signature id has no registered info. Signatures are built
    /// through the registry, so this indicates id reuse across registries.
    pub fn get_or_create(&mut self, signature: Signature, registry: &TypeRegistry) -> ArchetypeId {
        if let Some(id) = self.by_signature.get(&signature) {
            return *id;
        }
        let infos = signature
            .ids()
            .iter()
            .map(|id| {
                registry
                    .info(*id)
                    .unwrap_or_else(|| panic!("signature id {id:?} missing from type registry"))
            })
            .collect::<Vec<_>>();
        let id = ArchetypeId::new(self.archetypes.len() as u32);
        debug!(
            "creating archetype {:?} for signature of {} component(s)",
            id,
            signature.len()
        );
        self.by_signature.insert(signature.clone(), id);
        self.archetypes
            .push(Archetype::new(id, signature, infos, self.pool.chunk_size()));
        self.version += 1;
        id
    }

    /// Look up an archetype by signature without creating it.
    #[inline]
    pub fn get_by_signature(&self, signature: &Signature) -> Option<&Archetype> {
        self.by_signature
            .get(signature)
            .map(|id| &self.archetypes[id.index()])
    }

    /// Visit every archetype satisfying a with-all / with-none filter.
    pub fn for_each_matching(
        &self,
        with_all: &Signature,
        with_none: &Signature,
        mut visit: impl FnMut(&Archetype),
    ) {
        for archetype in &self.archetypes {
            let signature = archetype.signature();
            if signature.contains_all(with_all) && !signature.contains_any(with_none) {
                visit(archetype);
            }
        }
    }

    /// Collect the ids of every archetype satisfying a filter, in discovery
    /// order.
    pub fn matching_ids(&self, with_all: &Signature, with_none: &Signature) -> Vec<ArchetypeId> {
        let mut ids = Vec::new();
        self.for_each_matching(with_all, with_none, |archetype| ids.push(archetype.id()));
        ids
    }

    /// Spawn an entity with a typed component bundle.
    pub(crate) fn spawn<B: Bundle>(
        &mut self,
        entities: &mut Entities,
        entity: Entity,
        bundle: B,
        registry: &TypeRegistry,
    ) -> Result<Location, StorageError> {
        self.assert_not_iterating();
        let signature = B::into_signature(registry);
        let id = self.get_or_create(signature, registry);

        let Storage {
            archetypes, pool, ..
        } = self;
        let archetype = &mut archetypes[id.index()];
        let (chunk, slot) = archetype.reserve(pool, entity)?;
        let mut target = SlotTarget::new(archetype, chunk, slot);
        bundle.write_into(registry, &mut target);

        let location = Location::new(id, chunk, slot);
        entities.update(entity, location);
        Ok(location)
    }

    /// Spawn a batch of entities sharing one bundle type. The archetype is
    /// resolved once; every entity reserves and writes in turn.
    pub(crate) fn spawn_many<B: Bundle>(
        &mut self,
        entities: &mut Entities,
        spawns: impl IntoIterator<Item = (Entity, B)>,
        registry: &TypeRegistry,
    ) -> Result<(), StorageError> {
        self.assert_not_iterating();
        let signature = B::into_signature(registry);
        let id = self.get_or_create(signature, registry);

        let Storage {
            archetypes, pool, ..
        } = self;
        let archetype = &mut archetypes[id.index()];
        for (entity, bundle) in spawns {
            let (chunk, slot) = archetype.reserve(pool, entity)?;
            let mut target = SlotTarget::new(archetype, chunk, slot);
            bundle.write_into(registry, &mut target);
            entities.update(entity, Location::new(id, chunk, slot));
        }
        Ok(())
    }

    /// Spawn an entity from an erased bundle (deferred playback, prefabs).
    pub(crate) fn spawn_boxed(
        &mut self,
        entities: &mut Entities,
        entity: Entity,
        bundle: &mut BoxedBundle,
        registry: &TypeRegistry,
    ) -> Result<Location, StorageError> {
        self.assert_not_iterating();
        let id = self.get_or_create(bundle.signature().clone(), registry);

        let Storage {
            archetypes, pool, ..
        } = self;
        let archetype = &mut archetypes[id.index()];
        let (chunk, slot) = archetype.reserve(pool, entity)?;
        for value in bundle.values_mut() {
            let column = archetype
                .column(value.id())
                .expect("bundle component missing from its own archetype");
            let size = column.info().layout().size();
            if size > 0 {
                let dst = archetype.component_ptr(column, chunk, slot);
                // SAFETY: source and destination are distinct allocations of
                // the same layout; the slot payload is uninitialized.
                unsafe {
                    std::ptr::copy_nonoverlapping(value.data().as_ptr(), dst.as_ptr(), size);
                }
            }
            // SAFETY: the payload now lives in the chunk.
            unsafe { value.disarm() };
        }

        let location = Location::new(id, chunk, slot);
        entities.update(entity, location);
        Ok(location)
    }

    /// Despawn an entity, dropping its components. Stale handles are a logged
    /// no-op.
    pub(crate) fn despawn(&mut self, entities: &mut Entities, entity: Entity) -> bool {
        self.assert_not_iterating();
        let Some(location) = entities.locate(entity) else {
            if entities.is_alive(entity) {
                // Live but never placed; just retire the handle.
                return entities.destroy(entity);
            }
            warn!("attempted to despawn a stale entity handle: {entity:?}");
            return false;
        };

        let Storage {
            archetypes, pool, ..
        } = self;
        let archetype = &mut archetypes[location.archetype().index()];
        let outcome = archetype.swap_remove(pool, location.chunk(), location.slot(), true);

        entities.destroy(entity);
        self.repair_rows(entities, location, &outcome);
        true
    }

    /// Add components from an erased bundle to an existing entity.
    ///
    /// Components the entity already has are overwritten in place (no move,
    /// no version bump); any genuinely new component migrates the entity to
    /// the merged archetype.
    pub(crate) fn add_boxed(
        &mut self,
        entities: &mut Entities,
        entity: Entity,
        bundle: &mut BoxedBundle,
        registry: &TypeRegistry,
    ) -> Result<bool, StorageError> {
        self.assert_not_iterating();
        let Some(location) = entities.locate(entity) else {
            warn!("attempted to add components to a stale entity handle: {entity:?}");
            return Ok(false);
        };
        if bundle.is_empty() {
            return Ok(true);
        }

        let src_signature = self.archetypes[location.archetype().index()]
            .signature()
            .clone();

        if src_signature.contains_all(bundle.signature()) {
            // Every component already present: overwrite the existing slots in
            // place. The structure version is untouched.
            let archetype = &self.archetypes[location.archetype().index()];
            for value in bundle.values_mut() {
                let column = archetype
                    .column(value.id())
                    .expect("signature containment guarantees the column");
                let dst = archetype.component_ptr(column, location.chunk(), location.slot());
                let size = column.info().layout().size();
                // SAFETY: the slot holds a live value of this type; drop it,
                // then move the replacement payload in.
                unsafe {
                    column.info().drop_in_place(dst);
                    if size > 0 {
                        std::ptr::copy_nonoverlapping(value.data().as_ptr(), dst.as_ptr(), size);
                    }
                    value.disarm();
                }
            }
            return Ok(true);
        }

        let dst_signature = src_signature.merge(bundle.signature());
        let dst_id = self.get_or_create(dst_signature, registry);
        self.migrate(entities, entity, location, dst_id, Some(bundle))?;
        Ok(true)
    }

    /// Remove a set of components from an entity.
    ///
    /// Removing components the entity does not have is a no-op with no
    /// structure-version bump; if nothing overlaps, nothing happens at all.
    pub(crate) fn remove(
        &mut self,
        entities: &mut Entities,
        entity: Entity,
        remove: &Signature,
        registry: &TypeRegistry,
    ) -> Result<bool, StorageError> {
        self.assert_not_iterating();
        let Some(location) = entities.locate(entity) else {
            warn!("attempted to remove components from a stale entity handle: {entity:?}");
            return Ok(false);
        };

        let src_signature = self.archetypes[location.archetype().index()]
            .signature()
            .clone();
        if !src_signature.contains_any(remove) {
            return Ok(false);
        }

        let dst_signature = src_signature.difference(remove);
        let dst_id = self.get_or_create(dst_signature, registry);
        self.migrate(entities, entity, location, dst_id, None)?;
        Ok(true)
    }

    /// The raw payload pointer for one component of a located entity.
    pub(crate) fn component_ptr(&self, location: Location, id: TypeId) -> Option<NonNull<u8>> {
        let archetype = &self.archetypes[location.archetype().index()];
        let column = archetype.column(id)?;
        Some(archetype.component_ptr(column, location.chunk(), location.slot()))
    }

    /// Move an entity from its current archetype to `dst_id`.
    ///
    /// Components present in both signatures are byte-moved; components only
    /// in the source are dropped; components only in the destination are
    /// filled from `new_values`. When `new_values` also covers a shared
    /// component, the provided value wins and the source payload is dropped.
    /// Bumps the structure version.
    fn migrate(
        &mut self,
        entities: &mut Entities,
        entity: Entity,
        src_location: Location,
        dst_id: ArchetypeId,
        mut new_values: Option<&mut BoxedBundle>,
    ) -> Result<Location, StorageError> {
        let src_id = src_location.archetype();
        debug_assert_ne!(src_id, dst_id, "migration within one archetype");

        // Reserve the destination slot first so an allocation failure leaves
        // the source slot untouched.
        let (dst_chunk, dst_slot) = {
            let Storage {
                archetypes, pool, ..
            } = self;
            archetypes[dst_id.index()].reserve(pool, entity)?
        };

        let (src_chunk, src_slot) = (src_location.chunk(), src_location.slot());
        {
            let (src_arch, dst_arch) =
                two_archetypes_mut(&mut self.archetypes, src_id.index(), dst_id.index());

            for dst_index in 0..dst_arch.columns().len() {
                let dst_column = &dst_arch.columns()[dst_index];
                let id = dst_column.id();
                let size = dst_column.info().layout().size();
                let dst_ptr = dst_arch.component_ptr(dst_column, dst_chunk, dst_slot);

                let provided = new_values
                    .as_deref_mut()
                    .and_then(|bundle| bundle.values_mut().iter_mut().find(|v| v.id() == id));
                if let Some(value) = provided {
                    // Caller-supplied value wins; a stale source payload of the
                    // same type is destroyed rather than moved.
                    // SAFETY: destination payload is uninitialized; source
                    // payload (if any) is live.
                    unsafe {
                        if let Some(src_column) = src_arch.column(id) {
                            let src_ptr =
                                src_arch.component_ptr(src_column, src_chunk, src_slot);
                            src_column.info().drop_in_place(src_ptr);
                        }
                        if size > 0 {
                            std::ptr::copy_nonoverlapping(
                                value.data().as_ptr(),
                                dst_ptr.as_ptr(),
                                size,
                            );
                        }
                        value.disarm();
                    }
                } else {
                    let src_column = src_arch
                        .column(id)
                        .expect("destination component neither provided nor present in source");
                    // SAFETY: distinct chunks, same layout; moving the payload
                    // transfers ownership to the destination slot.
                    if size > 0 {
                        let src_ptr = src_arch.component_ptr(src_column, src_chunk, src_slot);
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                src_ptr.as_ptr(),
                                dst_ptr.as_ptr(),
                                size,
                            );
                        }
                    }
                }
            }

            // Components only the source has are going away: drop them.
            for src_column in src_arch.columns() {
                if dst_arch.has(src_column.id()) {
                    continue;
                }
                let src_ptr = src_arch.component_ptr(src_column, src_chunk, src_slot);
                // SAFETY: the payload is live and is not moving anywhere.
                unsafe { src_column.info().drop_in_place(src_ptr) };
            }
        }

        // Every payload has been moved or dropped; vacate the source slot
        // without running drops again.
        let outcome = {
            let Storage {
                archetypes, pool, ..
            } = self;
            archetypes[src_id.index()].swap_remove(pool, src_chunk, src_slot, false)
        };

        let dst_location = Location::new(dst_id, dst_chunk, dst_slot);
        entities.update(entity, dst_location);
        self.repair_rows(entities, src_location, &outcome);
        self.version += 1;
        Ok(dst_location)
    }

    /// Repair entity-table rows after a swap-remove: the entity moved into the
    /// vacated slot, and a whole chunk's occupants when the emptied chunk was
    /// released and another took its index.
    fn repair_rows(
        &self,
        entities: &mut Entities,
        vacated: Location,
        outcome: &archetype::RemoveOutcome,
    ) {
        if let Some(moved) = outcome.moved {
            entities.update(moved, vacated);
        }
        if outcome.chunk_relocated {
            let archetype = &self.archetypes[vacated.archetype().index()];
            let chunk = vacated.chunk();
            for (slot, occupant) in archetype.identities(chunk).iter().enumerate() {
                entities.update(
                    *occupant,
                    Location::new(vacated.archetype(), chunk, slot as u16),
                );
            }
        }
    }

    /// RAII guard marking a query iteration in flight.
    pub(crate) fn iteration_guard(&self) -> IterationGuard<'_> {
        self.iterating.fetch_add(1, Ordering::Relaxed);
        IterationGuard(&self.iterating)
    }

    /// Debug assertion that no query iteration is running. Structural edits
    /// during iteration invalidate chunk pointers; release builds document
    /// this as the caller's responsibility.
    #[inline]
    fn assert_not_iterating(&self) {
        debug_assert_eq!(
            self.iterating.load(Ordering::Relaxed),
            0,
            "structural edit while a query iteration is running; use the command buffer"
        );
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        let Storage {
            archetypes, pool, ..
        } = self;
        for archetype in archetypes.iter_mut() {
            archetype.clear(pool);
        }
    }
}

/// Guard for one in-flight query iteration.
pub(crate) struct IterationGuard<'a>(&'a AtomicU32);

impl Drop for IterationGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Split two distinct archetypes out of the list mutably.
fn two_archetypes_mut(
    archetypes: &mut [Archetype],
    a: usize,
    b: usize,
) -> (&mut Archetype, &mut Archetype) {
    debug_assert_ne!(a, b);
    if a < b {
        let (left, right) = archetypes.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = archetypes.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use quarry_macros::Component;

    use super::*;
    use crate::ecs::component::IntoSignature;

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

    struct Fixture {
        entities: Entities,
        registry: TypeRegistry,
        storage: Storage,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
        }

        fn with_chunk_size(chunk_size: usize) -> Self {
            Self {
                entities: Entities::new(),
                registry: TypeRegistry::new(),
                storage: Storage::new(chunk_size),
            }
        }

        fn spawn<Bn: Bundle>(&mut self, bundle: Bn) -> Entity {
            let entity = self.entities.create();
            self.storage
                .spawn(&mut self.entities, entity, bundle, &self.registry)
                .unwrap();
            entity
        }

        fn get<Cm: crate::ecs::component::Component + Copy>(&self, entity: Entity) -> Option<Cm> {
            let location = self.entities.locate(entity)?;
            let id = self.registry.get::<Cm>()?;
            let ptr = self.storage.component_ptr(location, id)?;
            Some(unsafe { ptr.cast::<Cm>().read() })
        }

        fn signature_of(&self, entity: Entity) -> &Signature {
            let location = self.entities.locate(entity).unwrap();
            self.storage.archetype(location.archetype()).signature()
        }

        fn add<Bn: Bundle>(&mut self, entity: Entity, bundle: Bn) -> bool {
            let mut boxed = BoxedBundle::new(bundle, &self.registry);
            self.storage
                .add_boxed(&mut self.entities, entity, &mut boxed, &self.registry)
                .unwrap()
        }

        fn remove<S: IntoSignature>(&mut self, entity: Entity) -> bool {
            let signature = S::into_signature(&self.registry);
            self.storage
                .remove(&mut self.entities, entity, &signature, &self.registry)
                .unwrap()
        }
    }

    #[test]
    fn spawn_places_entity_and_data() {
        // Given
        let mut fx = Fixture::new();

        // When
        let entity = fx.spawn((A { x: 7 }, B { y: 1.5 }));

        // Then
        let location = fx.entities.locate(entity).unwrap();
        let archetype = fx.storage.archetype(location.archetype());
        assert_eq!(archetype.identity(location.chunk(), location.slot()), entity);
        assert_eq!(fx.get::<A>(entity), Some(A { x: 7 }));
        assert_eq!(fx.get::<B>(entity), Some(B { y: 1.5 }));
    }

    #[test]
    fn despawn_then_get_is_absent() {
        let mut fx = Fixture::new();
        let entity = fx.spawn(A { x: 1 });

        assert!(fx.storage.despawn(&mut fx.entities, entity));
        assert_eq!(fx.entities.locate(entity), None);
        assert_eq!(fx.get::<A>(entity), None);

        // A second despawn of the stale handle is a no-op.
        assert!(!fx.storage.despawn(&mut fx.entities, entity));
    }

    #[test]
    fn add_then_remove_migrates_archetypes() {
        // Given - S2: an entity with A { x: 7 }
        let mut fx = Fixture::new();
        let entity = fx.spawn(A { x: 7 });

        // When - add B { y: 1.5 }
        assert!(fx.add(entity, B { y: 1.5 }));

        // Then - signature is {A, B} and both values survive
        assert_eq!(
            fx.signature_of(entity),
            &<(A, B)>::into_signature(&fx.registry)
        );
        assert_eq!(fx.get::<A>(entity), Some(A { x: 7 }));
        assert_eq!(fx.get::<B>(entity), Some(B { y: 1.5 }));

        // When - remove A
        assert!(fx.remove::<A>(entity));

        // Then - signature is {B}, A is absent, B survives
        assert_eq!(fx.signature_of(entity), &<B>::into_signature(&fx.registry));
        assert_eq!(fx.get::<A>(entity), None);
        assert_eq!(fx.get::<B>(entity), Some(B { y: 1.5 }));
    }

    #[test]
    fn add_remove_round_trip_preserves_other_bytes() {
        // Given
        let mut fx = Fixture::new();
        let entity = fx.spawn((A { x: 42 }, C { z: 0xDEAD_BEEF }));
        let original = fx.signature_of(entity).clone();

        // When - add then remove B
        fx.add(entity, B { y: 9.0 });
        fx.remove::<B>(entity);

        // Then - back in the original archetype, other values byte-equal
        assert_eq!(fx.signature_of(entity), &original);
        assert_eq!(fx.get::<A>(entity), Some(A { x: 42 }));
        assert_eq!(fx.get::<C>(entity), Some(C { z: 0xDEAD_BEEF }));
    }

    #[test]
    fn remove_absent_component_is_noop_without_version_bump() {
        // Given
        let mut fx = Fixture::new();
        let entity = fx.spawn(A { x: 1 });
        let version = fx.storage.version();

        // When - B was never on the entity
        let changed = fx.remove::<B>(entity);

        // Then
        assert!(!changed);
        assert_eq!(fx.storage.version(), version);
        assert_eq!(fx.get::<A>(entity), Some(A { x: 1 }));
    }

    #[test]
    fn add_existing_component_overwrites_in_place() {
        // Given
        let mut fx = Fixture::new();
        let entity = fx.spawn(A { x: 1 });
        let location = fx.entities.locate(entity).unwrap();
        let version = fx.storage.version();

        // When
        assert!(fx.add(entity, A { x: 2 }));

        // Then - same slot, new value, no version bump
        assert_eq!(fx.entities.locate(entity), Some(location));
        assert_eq!(fx.get::<A>(entity), Some(A { x: 2 }));
        assert_eq!(fx.storage.version(), version);
    }

    #[test]
    fn add_existing_component_drops_old_value() {
        #[derive(Component)]
        struct Tracked(Arc<AtomicUsize>);

        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut fx = Fixture::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let entity = fx.spawn(Tracked(Arc::clone(&counter)));

        fx.add(entity, Tracked(Arc::clone(&counter)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        fx.storage.despawn(&mut fx.entities, entity);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn structure_version_is_monotonic() {
        let mut fx = Fixture::new();
        let mut last = fx.storage.version();

        let entity = fx.spawn(A { x: 1 });
        assert!(fx.storage.version() >= last);
        last = fx.storage.version();

        fx.add(entity, B { y: 2.0 });
        assert!(fx.storage.version() > last, "migration must bump the version");
        last = fx.storage.version();

        fx.remove::<B>(entity);
        assert!(fx.storage.version() > last);
    }

    #[test]
    fn migration_to_known_archetype_still_bumps_version() {
        // Given - both archetypes already exist
        let mut fx = Fixture::new();
        let _anchor_a = fx.spawn(A { x: 0 });
        let _anchor_ab = fx.spawn((A { x: 0 }, B { y: 0.0 }));
        let entity = fx.spawn(A { x: 5 });
        let version = fx.storage.version();

        // When - the move creates no archetype
        fx.add(entity, B { y: 1.0 });

        // Then - the move itself still invalidates caches
        assert_eq!(fx.storage.version(), version + 1);
    }

    #[test]
    fn empty_signature_archetype_is_legal() {
        // Given
        let mut fx = Fixture::new();

        // When - an entity with no components at all
        let entity = fx.spawn(());

        // Then
        let location = fx.entities.locate(entity).unwrap();
        let archetype = fx.storage.archetype(location.archetype());
        assert!(archetype.signature().is_empty());
        assert_eq!(archetype.identity(location.chunk(), location.slot()), entity);
    }

    #[test]
    fn swap_remove_updates_moved_entity_row() {
        // Given - S3: ten entities with A.x = 0..9 in one chunk
        let mut fx = Fixture::new();
        let spawned: Vec<Entity> = (0..10).map(|i| fx.spawn(A { x: i })).collect();
        let locations: Vec<Location> = spawned
            .iter()
            .map(|e| fx.entities.locate(*e).unwrap())
            .collect();

        // When - destroy the 3rd
        fx.storage.despawn(&mut fx.entities, spawned[2]);

        // Then - the former slot 9 occupant now sits at slot 2
        let moved = fx.entities.locate(spawned[9]).unwrap();
        assert_eq!(moved.slot(), 2);
        assert_eq!(fx.get::<A>(spawned[9]), Some(A { x: 9 }));

        // No other row changed
        for i in [0, 1, 3, 4, 5, 6, 7, 8] {
            assert_eq!(fx.entities.locate(spawned[i]), Some(locations[i]));
        }

        let archetype = fx.storage.archetype(moved.archetype());
        assert_eq!(archetype.chunk(0).count(), 9);
    }

    #[test]
    fn emptying_first_chunk_relocates_rows_of_the_last() {
        // Given - a small chunk size so two chunks fill quickly
        let mut fx = Fixture::with_chunk_size(1024);
        let first = fx.spawn(A { x: 0 });
        let capacity = {
            let location = fx.entities.locate(first).unwrap();
            fx.storage.archetype(location.archetype()).capacity()
        };
        let mut chunk0 = vec![first];
        for i in 1..capacity {
            chunk0.push(fx.spawn(A { x: i as i32 }));
        }
        let spill = fx.spawn(A { x: -1 });
        assert_eq!(fx.entities.locate(spill).unwrap().chunk(), 1);

        // When - empty chunk 0 entirely
        for entity in chunk0 {
            fx.storage.despawn(&mut fx.entities, entity);
        }

        // Then - the spill entity's chunk moved to index 0 and its row agrees
        let relocated = fx.entities.locate(spill).unwrap();
        assert_eq!(relocated.chunk(), 0);
        assert_eq!(fx.get::<A>(spill), Some(A { x: -1 }));
        let archetype = fx.storage.archetype(relocated.archetype());
        assert_eq!(archetype.chunk_count(), 1);
    }

    #[test]
    fn matching_filters_by_with_all_and_with_none() {
        // Given - S4 population
        let mut fx = Fixture::new();
        let _e1 = fx.spawn(A { x: 1 });
        let _e2 = fx.spawn((A { x: 2 }, B { y: 2.0 }));
        let _e3 = fx.spawn((A { x: 3 }, B { y: 3.0 }, C { z: 3 }));
        let _e4 = fx.spawn(B { y: 4.0 });

        let with_all = <A>::into_signature(&fx.registry);
        let with_none = <C>::into_signature(&fx.registry);

        // When
        let ids = fx.storage.matching_ids(&with_all, &with_none);

        // Then - {A} and {A, B} match; {A, B, C} and {B} do not
        let total: usize = ids
            .iter()
            .map(|id| fx.storage.archetype(*id).len())
            .sum();
        assert_eq!(ids.len(), 2);
        assert_eq!(total, 2);
    }

    /// Small deterministic generator so the churn test needs no dependencies.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            self.0 >> 33
        }
    }

    #[test]
    fn random_churn_preserves_core_invariants() {
        // Given - a small chunk size so chunk allocation, release and
        // relocation all happen constantly
        let mut fx = Fixture::with_chunk_size(2048);
        let mut rng = Lcg(0x243F_6A88_85A3_08D3);
        let mut live: Vec<Entity> = Vec::new();
        let mut last_version = fx.storage.version();

        let verify = |fx: &Fixture, live: &[Entity]| {
            for entity in live {
                let location = fx.entities.locate(*entity).expect("live entity locates");
                let archetype = fx.storage.archetype(location.archetype());
                // The identity at the slot matches the handle pointing at it.
                assert_eq!(
                    archetype.identity(location.chunk(), location.slot()),
                    *entity
                );
                // The slot is inside the live range of its chunk.
                assert!(location.slot() < archetype.chunk(location.chunk()).count());
                assert!(archetype.chunk(location.chunk()).count() <= archetype.capacity());
            }
        };

        // When - a few thousand random structural edits
        for step in 0..2_000u64 {
            match rng.next() % 4 {
                0 => live.push(fx.spawn(A { x: step as i32 })),
                1 if !live.is_empty() => {
                    let victim = live.swap_remove(rng.next() as usize % live.len());
                    assert!(fx.storage.despawn(&mut fx.entities, victim));
                }
                2 if !live.is_empty() => {
                    let target = live[rng.next() as usize % live.len()];
                    fx.add(target, B { y: step as f32 });
                }
                3 if !live.is_empty() => {
                    let target = live[rng.next() as usize % live.len()];
                    fx.remove::<B>(target);
                }
                _ => {}
            }

            // The structure version never decreases.
            assert!(fx.storage.version() >= last_version);
            last_version = fx.storage.version();

            if step % 64 == 0 {
                verify(&fx, &live);
            }
        }

        // Then - the full invariant sweep holds at the end
        verify(&fx, &live);
        assert_eq!(fx.entities.live_count(), live.len());
    }

    #[test]
    fn migration_drops_removed_components_exactly_once() {
        #[derive(Component)]
        struct Tracked(Arc<AtomicUsize>);

        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        // Given
        let mut fx = Fixture::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let entity = fx.spawn((A { x: 1 }, Tracked(Arc::clone(&counter))));

        // When - removing Tracked migrates the entity to {A}
        assert!(fx.remove::<Tracked>(entity));

        // Then - the payload was dropped exactly once, A survived the move
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(fx.get::<A>(entity), Some(A { x: 1 }));

        fx.storage.despawn(&mut fx.entities, entity);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
