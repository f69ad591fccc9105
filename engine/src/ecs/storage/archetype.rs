//! Archetypes: one component-set's chunked SoA storage.
//!
//! An archetype owns every entity whose component set equals its signature.
//! Entities live in fixed-size chunks; inside a chunk the identity array sits
//! at offset zero followed by one contiguous array per component type, each at
//! a byte offset published in the archetype's column table. Iteration over a
//! component is therefore a walk of `base + slot * size_of::<C>()`.
//!
//! ```text
//! chunk (16 KiB)
//! ┌─────────────────────┬──────────────────┬──────────────────┬───┐
//! │ identities [Entity] │ component A [A]  │ component B [B]  │pad│
//! │ capacity entries    │ capacity entries │ capacity entries │   │
//! └─────────────────────┴──────────────────┴──────────────────┴───┘
//! ```
//!
//! # Invariants
//! - `count <= capacity` for every chunk.
//! - Slots `[0, count)` hold live, constructed components; `[count, capacity)`
//!   are uninitialized payload bytes.
//! - The identity at slot `s` matches the entity-table row pointing at
//!   `(archetype, chunk, s)`.
//! - A chunk is never shared across archetypes.

use std::{any::TypeId as StdTypeId, ptr::NonNull};

use crate::ecs::{
    component::{Component, Signature, TypeId, TypeInfo},
    entity::Entity,
    storage::{
        StorageError,
        chunk::{CHUNK_ALIGN, ChunkBlock, ChunkPool},
    },
};

/// A unique identifier for an archetype within one storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(u32);

impl Id {
    /// Create a new Id with the given unique identifier.
    #[inline]
    pub const fn new(id: u32) -> Self {
        Id(id)
    }

    /// Get the index of the Id as a usize to be used in collections.
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// One component's placement inside every chunk of an archetype: the type
/// metadata plus the byte offset of its array from the chunk base. The stride
/// is the component size (SoA).
#[derive(Debug, Clone, Copy)]
pub(crate) struct Column {
    info: TypeInfo,
    offset: usize,
}

impl Column {
    /// The stable component type id stored in this column.
    #[inline]
    pub fn id(&self) -> TypeId {
        self.info.id()
    }

    /// The component type metadata.
    #[inline]
    pub fn info(&self) -> &TypeInfo {
        &self.info
    }

    /// The byte offset of this column's array from the chunk base.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// One chunk of an archetype: the owned block plus metadata kept alongside
/// the pointer rather than inside it.
pub struct Chunk {
    /// The backing allocation.
    block: ChunkBlock,

    /// Live slots, `[0, capacity]`.
    count: u16,

    /// Change hint, bumped on every mutation of this chunk's occupancy.
    /// Reserved for change-detection; nothing consumes it yet.
    change_hint: u64,
}

impl Chunk {
    /// The number of live slots.
    #[inline]
    pub fn count(&self) -> u16 {
        self.count
    }

    /// The chunk's change hint.
    #[inline]
    pub fn change_hint(&self) -> u64 {
        self.change_hint
    }

    /// The base pointer of the backing block.
    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.block.as_ptr()
    }
}

/// The result of a swap-remove, telling the caller which entity-table rows it
/// must repair.
pub(crate) struct RemoveOutcome {
    /// The entity moved down into the vacated slot, if any.
    pub moved: Option<Entity>,

    /// True when the emptied chunk was released and another chunk now occupies
    /// its index; every entity in that chunk needs its row's chunk index
    /// rewritten.
    pub chunk_relocated: bool,
}

/// One component-set's storage: the signature, the per-chunk column layout,
/// and the chunks themselves.
pub struct Archetype {
    /// The archetype's unique identifier.
    id: Id,

    /// The canonical component set stored here.
    signature: Signature,

    /// Column placements, sorted by component type id (signature order).
    columns: Vec<Column>,

    /// How many entities fit in one chunk.
    capacity: u16,

    /// The owned chunks.
    chunks: Vec<Chunk>,

    /// Total live entities across all chunks.
    len: usize,
}

impl Archetype {
    /// Build an archetype for the given component infos.
    ///
    /// `infos` must correspond one-to-one with `signature` (any order). The
    /// capacity is computed from the chunk size minus the identity-array
    /// footprint, divided across the component sizes with alignment.
    ///
    /// # Panics
    /// Panics if a component's alignment exceeds the chunk block alignment or
    /// if a single entity's components cannot fit in one chunk.
    pub(crate) fn new(id: Id, signature: Signature, mut infos: Vec<TypeInfo>, chunk_size: usize) -> Self {
        debug_assert_eq!(infos.len(), signature.len());
        infos.sort_by_key(|info| info.id());
        for info in &infos {
            assert!(
                info.layout().align() <= CHUNK_ALIGN,
                "component {} alignment {} exceeds chunk alignment {}",
                info.name(),
                info.layout().align(),
                CHUNK_ALIGN
            );
        }
        let (columns, capacity) = Self::layout_columns(chunk_size, &infos);
        Self {
            id,
            signature,
            columns,
            capacity,
            chunks: Vec::new(),
            len: 0,
        }
    }

    /// Compute column offsets and the exact per-chunk capacity.
    fn layout_columns(chunk_size: usize, infos: &[TypeInfo]) -> (Vec<Column>, u16) {
        let per_entity: usize = std::mem::size_of::<Entity>()
            + infos.iter().map(|info| info.layout().size()).sum::<usize>();
        // Upper bound ignoring alignment padding, then step down until the
        // padded layout fits. Capacity is exact, never over-estimated.
        let mut capacity = (chunk_size / per_entity).min(u16::MAX as usize);
        loop {
            assert!(capacity > 0, "component set does not fit in a single chunk");
            let (columns, total) = Self::place_columns(capacity, infos);
            if total <= chunk_size {
                return (columns, capacity as u16);
            }
            capacity -= 1;
        }
    }

    /// Place each column at its aligned offset for a given capacity, returning
    /// the columns and the total bytes consumed.
    fn place_columns(capacity: usize, infos: &[TypeInfo]) -> (Vec<Column>, usize) {
        let mut offset = capacity * std::mem::size_of::<Entity>();
        let mut columns = Vec::with_capacity(infos.len());
        for info in infos {
            let align = info.layout().align().max(1);
            offset = (offset + align - 1) & !(align - 1);
            columns.push(Column {
                info: *info,
                offset,
            });
            offset += capacity * info.layout().size();
        }
        (columns, offset)
    }

    /// Get the Id of this archetype.
    #[inline]
    pub fn id(&self) -> Id {
        self.id
    }

    /// Get the component signature of this archetype.
    #[inline]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// How many entities fit in one chunk.
    #[inline]
    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Total live entities across all chunks.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the archetype holds no entities.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The number of chunks currently owned.
    #[inline]
    pub fn chunk_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Get a chunk by index.
    ///
    /// # Panics
    /// Panics if the index is out of bounds.
    #[inline]
    pub fn chunk(&self, index: u32) -> &Chunk {
        &self.chunks[index as usize]
    }

    /// Find the column storing the given component id.
    #[inline]
    pub(crate) fn column(&self, id: TypeId) -> Option<&Column> {
        self.columns
            .binary_search_by_key(&id, |column| column.id())
            .ok()
            .map(|index| &self.columns[index])
    }

    /// Find the column storing the given Rust type. Used by typed query fetch
    /// where the numeric id is not at hand; columns per archetype are few, so
    /// the scan is cheap.
    #[inline]
    pub(crate) fn column_by_std(&self, type_id: StdTypeId) -> Option<&Column> {
        self.columns
            .iter()
            .find(|column| column.info.type_id() == type_id)
    }

    /// The columns in signature order.
    #[inline]
    pub(crate) fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Whether this archetype stores the given component.
    #[inline]
    pub fn has(&self, id: TypeId) -> bool {
        self.column(id).is_some()
    }

    /// The live identities of a chunk, in slot order.
    #[inline]
    pub fn identities(&self, chunk: u32) -> &[Entity] {
        let chunk = &self.chunks[chunk as usize];
        // SAFETY: the identity array occupies the chunk base with `count`
        // initialized entries; the block outlives the borrow.
        unsafe {
            std::slice::from_raw_parts(
                chunk.base().as_ptr() as *const Entity,
                chunk.count as usize,
            )
        }
    }

    /// The identity stored at a slot.
    #[inline]
    pub fn identity(&self, chunk: u32, slot: u16) -> Entity {
        self.identities(chunk)[slot as usize]
    }

    /// Reserve the next free slot, allocating a chunk from the pool when all
    /// existing chunks are full, and stamp the identity. The component payload
    /// at the slot is uninitialized until the caller writes it.
    pub(crate) fn reserve(
        &mut self,
        pool: &mut ChunkPool,
        entity: Entity,
    ) -> Result<(u32, u16), StorageError> {
        let chunk_index = match self
            .chunks
            .iter()
            .position(|chunk| chunk.count < self.capacity)
        {
            Some(index) => index,
            None => {
                let block = pool.acquire()?;
                self.chunks.push(Chunk {
                    block,
                    count: 0,
                    change_hint: 0,
                });
                self.chunks.len() - 1
            }
        };

        let chunk = &mut self.chunks[chunk_index];
        let slot = chunk.count;
        // SAFETY: slot < capacity, so the identity entry is inside the block.
        unsafe {
            (chunk.base().as_ptr() as *mut Entity)
                .add(slot as usize)
                .write(entity);
        }
        chunk.count += 1;
        chunk.change_hint += 1;
        self.len += 1;
        Ok((chunk_index as u32, slot))
    }

    /// The base pointer of a column's array within a chunk.
    #[inline]
    pub(crate) fn column_base(&self, column: &Column, chunk: u32) -> NonNull<u8> {
        let base = self.chunks[chunk as usize].base();
        // SAFETY: the column offset is inside the block by construction.
        unsafe { NonNull::new_unchecked(base.as_ptr().add(column.offset)) }
    }

    /// The pointer to one component payload slot.
    #[inline]
    pub(crate) fn component_ptr(&self, column: &Column, chunk: u32, slot: u16) -> NonNull<u8> {
        let base = self.column_base(column, chunk);
        // SAFETY: slot < capacity keeps the element inside the column array.
        unsafe {
            NonNull::new_unchecked(
                base.as_ptr().add(slot as usize * column.info.layout().size()),
            )
        }
    }

    /// Write a typed component value into a slot, without dropping any prior
    /// payload there.
    ///
    /// # Safety
    /// The slot must be reserved in this archetype, `C` must match the
    /// column's stored type, and any previously live value at the slot must
    /// already be dropped or moved out.
    pub(crate) unsafe fn write_component<C: Component>(
        &mut self,
        column_index: usize,
        chunk: u32,
        slot: u16,
        value: C,
    ) {
        let column = &self.columns[column_index];
        debug_assert_eq!(
            column.info.type_id(),
            StdTypeId::of::<C>(),
            "component write type mismatch: column stores {}",
            column.info.name()
        );
        let ptr = self.component_ptr(column, chunk, slot);
        unsafe { ptr.cast::<C>().write(value) };
    }

    /// Remove the entity at `(chunk, slot)` by swap-remove.
    ///
    /// When `run_drops` is set, every component payload at the slot is dropped
    /// first; migration passes `false` because it has already moved or dropped
    /// each payload itself. If the slot is not the last, the last slot's
    /// identity and payloads are byte-copied down and the moved identity is
    /// reported. An emptied chunk is released back to the pool.
    pub(crate) fn swap_remove(
        &mut self,
        pool: &mut ChunkPool,
        chunk_index: u32,
        slot: u16,
        run_drops: bool,
    ) -> RemoveOutcome {
        let (base, count) = {
            let chunk = &self.chunks[chunk_index as usize];
            (chunk.base(), chunk.count)
        };
        debug_assert!(slot < count, "slot out of bounds in swap_remove");
        let last = count - 1;

        if run_drops {
            for column in &self.columns {
                if column.info.drop_fn().is_some() {
                    let ptr = Self::slot_ptr(base, column, slot);
                    // SAFETY: slot < count, so the payload is live.
                    unsafe { column.info.drop_in_place(ptr) };
                }
            }
        }

        let mut moved = None;
        if slot != last {
            // Copy the last slot's identity and payloads down into the hole.
            // SAFETY: both slots are inside the block and distinct.
            unsafe {
                let identities = base.as_ptr() as *mut Entity;
                let moved_entity = identities.add(last as usize).read();
                identities.add(slot as usize).write(moved_entity);
                for column in &self.columns {
                    let size = column.info.layout().size();
                    if size == 0 {
                        continue;
                    }
                    let src = Self::slot_ptr(base, column, last);
                    let dst = Self::slot_ptr(base, column, slot);
                    std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), size);
                }
                moved = Some(moved_entity);
            }
        }

        let chunk = &mut self.chunks[chunk_index as usize];
        chunk.count -= 1;
        chunk.change_hint += 1;
        self.len -= 1;

        let mut chunk_relocated = false;
        if chunk.count == 0 {
            let emptied = self.chunks.swap_remove(chunk_index as usize);
            pool.release(emptied.block);
            chunk_relocated = (chunk_index as usize) < self.chunks.len();
        }

        #[cfg(debug_assertions)]
        self.verify_invariants();

        RemoveOutcome {
            moved,
            chunk_relocated,
        }
    }

    /// Drop every live component payload in every chunk and release the
    /// blocks. Called on storage teardown.
    pub(crate) fn clear(&mut self, pool: &mut ChunkPool) {
        for chunk in self.chunks.drain(..) {
            for column in &self.columns {
                if column.info.drop_fn().is_none() {
                    continue;
                }
                for slot in 0..chunk.count {
                    let ptr = Self::slot_ptr(chunk.base(), column, slot);
                    // SAFETY: slots [0, count) hold live payloads.
                    unsafe { column.info.drop_in_place(ptr) };
                }
            }
            pool.release(chunk.block);
        }
        self.len = 0;
    }

    #[inline]
    fn slot_ptr(base: NonNull<u8>, column: &Column, slot: u16) -> NonNull<u8> {
        // SAFETY: offset and slot are inside the block by construction.
        unsafe {
            NonNull::new_unchecked(
                base.as_ptr()
                    .add(column.offset + slot as usize * column.info.layout().size()),
            )
        }
    }

    /// Verify the per-chunk count invariant. Debug/test aid.
    #[cfg(debug_assertions)]
    pub(crate) fn verify_invariants(&self) {
        let mut total = 0usize;
        for chunk in &self.chunks {
            assert!(chunk.count <= self.capacity, "chunk count exceeds capacity");
            total += chunk.count as usize;
        }
        assert_eq!(total, self.len, "archetype len out of sync with chunks");
    }
}

/// A [`crate::ecs::component::BundleTarget`] that writes values straight into
/// one reserved slot of an archetype.
pub(crate) struct SlotTarget<'a> {
    archetype: &'a mut Archetype,
    chunk: u32,
    slot: u16,
}

impl<'a> SlotTarget<'a> {
    pub(crate) fn new(archetype: &'a mut Archetype, chunk: u32, slot: u16) -> Self {
        Self {
            archetype,
            chunk,
            slot,
        }
    }
}

impl crate::ecs::component::BundleTarget for SlotTarget<'_> {
    fn write<C: Component>(&mut self, id: TypeId, value: C) {
        let index = self
            .archetype
            .columns
            .binary_search_by_key(&id, |column| column.id())
            .unwrap_or_else(|_| {
                panic!(
                    "component {} is not part of archetype signature",
                    std::any::type_name::<C>()
                )
            });
        // SAFETY: the slot was reserved for this spawn and holds no live value
        // for this column yet; the column index was resolved by id.
        unsafe {
            self.archetype
                .write_component::<C>(index, self.chunk, self.slot, value)
        };
    }
}
