//! Entity identity and the live-entity table.
//!
//! An [`Entity`] is a 64-bit generational handle: a 32-bit index identifying a
//! table row, and a 32-bit generation tracking how many times that row has been
//! reused. Handles are plain values; copying one transfers nothing, and a handle
//! may outlive its entity. Once the entity is destroyed the row's generation is
//! incremented, so every surviving copy of the old handle is permanently stale
//! and detectable with a single integer compare.
//!
//! The [`Entities`] table is the authoritative map from live handles to storage
//! locations. For every spawned entity it holds the current generation and the
//! `(archetype, chunk, slot)` triple the archetype side keeps coherent as slots
//! move. Destroyed rows are free-listed and reused by later creates with the
//! bumped generation.

mod reference;

pub use reference::ComponentRef;

use log::warn;

use crate::ecs::storage::Location;

/// The generation of an entity row. Starts at `FIRST` and is incremented each
/// time the row's entity is destroyed, invalidating outstanding handles.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u32);

impl Generation {
    /// The first generation of a fresh entity row.
    pub const FIRST: Self = Self(0);

    /// Sentinel generation carried by deferred-spawn placeholder handles and by
    /// [`Entity::INVALID`]. No live entity ever has this generation.
    pub(crate) const PLACEHOLDER: Self = Self(u32::MAX);

    /// Get the next generation from the current.
    #[inline]
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Get the raw generation value.
    #[inline]
    pub fn value(&self) -> u32 {
        self.0
    }
}

/// An entity index. Identifies a row in the entity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u32);

impl From<u32> for Id {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Id {
    /// Get the index of this id as usable in indexable storage (e.g. Vec).
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// A handle to an entity in the ECS.
///
/// Equality and hashing compare the full 64-bit value, so two handles with the
/// same index but different generations are distinct and never alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Entity {
    /// The row index of the entity.
    id: Id,

    /// The generation the row had when this handle was issued.
    generation: Generation,
}

impl Entity {
    /// The reserved invalid entity. Never issued by any table.
    pub const INVALID: Self = Self {
        id: Id(u32::MAX),
        generation: Generation::PLACEHOLDER,
    };

    /// Construct an entity with just an index at the first generation.
    ///
    /// This is primarily used for testing.
    #[inline]
    #[allow(dead_code)]
    pub(crate) fn new(id: impl Into<Id>) -> Self {
        Self::new_with_generation(id.into(), Generation::FIRST)
    }

    /// Construct an entity from an index and a known generation.
    #[inline]
    pub(crate) const fn new_with_generation(id: Id, generation: Generation) -> Self {
        Self { id, generation }
    }

    /// Construct a deferred-spawn placeholder handle. Placeholders carry the
    /// reserved generation and are resolved to real handles at command playback.
    #[inline]
    pub(crate) const fn placeholder(index: u32) -> Self {
        Self {
            id: Id(index),
            generation: Generation::PLACEHOLDER,
        }
    }

    /// Get the row index of this entity.
    #[inline]
    pub fn id(&self) -> Id {
        self.id
    }

    /// Get the generation of this entity.
    #[inline]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Get the index of this entity as usable in indexable storage (e.g. Vec).
    #[inline]
    pub fn index(&self) -> usize {
        self.id.0 as usize
    }

    /// Pack this handle into its 64-bit wire value (index in the high half).
    #[inline]
    pub fn to_bits(self) -> u64 {
        ((self.id.0 as u64) << 32) | self.generation.0 as u64
    }

    /// Unpack a handle from its 64-bit wire value.
    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        Self {
            id: Id((bits >> 32) as u32),
            generation: Generation(bits as u32),
        }
    }

    /// Whether this is the reserved invalid handle.
    #[inline]
    pub fn is_invalid(&self) -> bool {
        *self == Self::INVALID
    }

    /// Whether this handle is a deferred-spawn placeholder.
    #[inline]
    pub fn is_placeholder(&self) -> bool {
        self.generation == Generation::PLACEHOLDER && self.id.0 != u32::MAX
    }
}

/// Implement ordering for Entity based on id and generation.
impl PartialOrd for Entity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Implement ordering for Entity based on id and generation.
impl Ord for Entity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.id.cmp(&other.id) {
            std::cmp::Ordering::Equal => self.generation.cmp(&other.generation),
            ord => ord,
        }
    }
}

/// One row of the entity table: the row's current generation, and where the
/// entity lives in archetype storage while spawned.
#[derive(Debug, Default, Clone, Copy)]
struct Row {
    generation: Generation,
    location: Option<Location>,
}

/// The table of all entities in a world.
///
/// Issues handles, recycles destroyed rows through a free list, and maps each
/// live handle to its `(archetype, chunk, slot)` location.
///
/// # Invariant
/// For every live handle `h`, the identity stored at the chunk slot its row
/// points at equals `h`. Archetype operations call [`Entities::update`] to keep
/// this coherent whenever a slot moves.
#[derive(Debug, Default)]
pub struct Entities {
    /// One row per ever-issued index.
    rows: Vec<Row>,

    /// Indexes of destroyed rows available for reuse.
    free: Vec<Id>,
}

impl Entities {
    /// Construct an empty entity table.
    #[inline]
    pub const fn new() -> Self {
        Self {
            rows: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Create a new entity, reusing a free row when one exists.
    ///
    /// The row's location is left unset until the archetype inserts the entity.
    pub fn create(&mut self) -> Entity {
        if let Some(id) = self.free.pop() {
            let row = &mut self.rows[id.index()];
            row.location = None;
            return Entity::new_with_generation(id, row.generation);
        }
        let id = Id(self.rows.len() as u32);
        assert!(id.0 != u32::MAX, "entity index space exhausted");
        self.rows.push(Row::default());
        Entity::new_with_generation(id, Generation::FIRST)
    }

    /// Create many entities at once, draining the free list first and then
    /// growing the table in one block. More efficient than calling
    /// [`create`](Self::create) in a loop.
    pub fn create_many(&mut self, count: usize) -> Vec<Entity> {
        let mut created = Vec::with_capacity(count);

        let from_free = count.min(self.free.len());
        for _ in 0..from_free {
            let id = self.free.pop().expect("count bounded by free list length");
            let row = &mut self.rows[id.index()];
            row.location = None;
            created.push(Entity::new_with_generation(id, row.generation));
        }

        let remaining = count - created.len();
        if remaining > 0 {
            let start = self.rows.len();
            assert!(
                start + remaining < u32::MAX as usize,
                "entity index space exhausted"
            );
            self.rows.resize(start + remaining, Row::default());
            created.extend(
                (start..start + remaining)
                    .map(|id| Entity::new_with_generation(Id(id as u32), Generation::FIRST)),
            );
        }

        created
    }

    /// Destroy an entity.
    ///
    /// The row's generation is incremented and the index is free-listed for
    /// reuse. Component data is not touched here; archetype-side removal owns
    /// that. Stale handles are a logged no-op.
    pub fn destroy(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            warn!("attempted to destroy a stale entity handle: {entity:?}");
            return false;
        }
        let row = &mut self.rows[entity.index()];
        row.generation = row.generation.next();
        row.location = None;
        self.free.push(entity.id());
        true
    }

    /// Look up the storage location for a handle.
    ///
    /// Returns `None` when the handle is stale or the entity has not been
    /// placed into an archetype yet. Stale detection is an O(1) generation
    /// compare.
    #[inline]
    pub fn locate(&self, entity: Entity) -> Option<Location> {
        self.row(entity).and_then(|row| row.location)
    }

    /// Whether the handle refers to a live row (generation matches).
    #[inline]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.row(entity).is_some()
    }

    /// Set the storage location for a live entity. Called by archetype
    /// operations to keep the row coherent as slots move.
    ///
    /// # Panics
    /// Panics if the handle is stale; storage never relocates dead entities.
    pub fn update(&mut self, entity: Entity, location: Location) {
        let index = entity.index();
        match self.rows.get_mut(index) {
            Some(row) if row.generation == entity.generation() => {
                row.location = Some(location);
            }
            _ => panic!("attempted to relocate a stale entity handle: {entity:?}"),
        }
    }

    /// The number of live entities.
    pub fn live_count(&self) -> usize {
        self.rows.len() - self.free.len()
    }

    /// Get the row for a handle when the generation still matches.
    #[inline]
    fn row(&self, entity: Entity) -> Option<&Row> {
        self.rows
            .get(entity.index())
            .filter(|row| row.generation == entity.generation())
    }
}
