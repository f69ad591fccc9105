use crate::ecs::storage::archetype;

/// The location an entity occupies in storage: which archetype, which chunk
/// within that archetype, and which slot within that chunk. This gives
/// constant-time lookups from a handle to its component data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    /// The archetype the entity belongs to.
    archetype: archetype::Id,

    /// The chunk index within the archetype.
    chunk: u32,

    /// The slot index within the chunk, `[0, count)`.
    slot: u16,
}

impl Location {
    /// Create a new location from its parts.
    #[inline]
    pub const fn new(archetype: archetype::Id, chunk: u32, slot: u16) -> Self {
        Self {
            archetype,
            chunk,
            slot,
        }
    }

    /// Get the archetype id for this location.
    #[inline]
    pub fn archetype(&self) -> archetype::Id {
        self.archetype
    }

    /// Get the chunk index for this location.
    #[inline]
    pub fn chunk(&self) -> u32 {
        self.chunk
    }

    /// Get the slot index for this location.
    #[inline]
    pub fn slot(&self) -> u16 {
        self.slot
    }
}
