//! Typed query data: the tuple of component accesses a query yields.
//!
//! `D` in [`Query<D>`](crate::ecs::query::Query) is a [`QueryData`]: a
//! component reference, an [`Out`] marker, or a tuple of those. Each element
//! declares one access mode:
//!
//! - `&C` is `In`: read-only access, yields `&C`
//! - `&mut C` is `InOut`: read and write, yields `&mut C`
//! - `Out<C>` is `Out`: write-only (the prior value is not meaningfully
//!   readable), yields `&mut C`
//!
//! At iteration time each element resolves to the base pointer of its
//! component array in the current chunk; a slot fetch is then a single
//! `base + slot * size_of::<C>()` access, which keeps the inner loop tight.

use std::{any::TypeId as StdTypeId, marker::PhantomData, ptr::NonNull};

use crate::{
    all_tuples,
    ecs::{
        component::{Component, TypeId, TypeRegistry},
        storage::Archetype,
        world::Access,
    },
};

/// Marker for write-only access to `C`. The query yields `&mut C`; reading
/// the prior value is permitted by the type but its meaning is undefined by
/// the access contract.
pub struct Out<C>(PhantomData<C>);

/// A type that can be fetched per-slot from matching chunks.
///
/// # Safety
///
/// Implementations hand out references derived from raw chunk pointers. An
/// implementation must only yield references to the component arrays named by
/// [`QueryData::collect_access`], with mutability no greater than declared;
/// the scheduler's conflict analysis relies on those declarations to keep
/// concurrent fetches disjoint.
pub unsafe trait QueryData {
    /// What one slot yields to the callback.
    type Item<'a>;

    /// Per-chunk resolved state: base pointers into the chunk.
    type Fetch: Copy;

    /// Append the component ids this data touches, registering the types.
    /// Order and multiplicity are preserved so duplicates can be detected.
    fn collect_ids(registry: &TypeRegistry, ids: &mut Vec<TypeId>);

    /// Merge this data's access modes into `access`.
    fn collect_access(registry: &TypeRegistry, access: &mut Access);

    /// Resolve base pointers for one chunk of a matching archetype.
    ///
    /// # Panics
    /// Panics if the archetype does not store a required component; matching
    /// guarantees it does.
    fn fetch_init(archetype: &Archetype, chunk: u32) -> Self::Fetch;

    /// Fetch one slot.
    ///
    /// # Safety
    /// `slot` must be a live slot of the chunk `fetch` was resolved for, the
    /// chunk must not be structurally mutated while any returned reference
    /// lives, and the caller must uphold the declared access modes (no two
    /// live mutable references to one slot).
    unsafe fn fetch<'a>(fetch: &Self::Fetch, slot: u16) -> Self::Item<'a>;
}

#[inline]
fn column_base<C: Component>(archetype: &Archetype, chunk: u32) -> NonNull<u8> {
    let column = archetype
        .column_by_std(StdTypeId::of::<C>())
        .unwrap_or_else(|| {
            panic!(
                "query data component {} not stored by matched archetype",
                std::any::type_name::<C>()
            )
        });
    archetype.column_base(column, chunk)
}

// SAFETY: yields shared references only, to the component declared as read.
unsafe impl<'c, C: Component> QueryData for &'c C {
    type Item<'a> = &'a C;
    type Fetch = NonNull<u8>;

    fn collect_ids(registry: &TypeRegistry, ids: &mut Vec<TypeId>) {
        ids.push(registry.register::<C>());
    }

    fn collect_access(registry: &TypeRegistry, access: &mut Access) {
        access.add_read(registry.register::<C>());
    }

    fn fetch_init(archetype: &Archetype, chunk: u32) -> Self::Fetch {
        column_base::<C>(archetype, chunk)
    }

    unsafe fn fetch<'a>(fetch: &Self::Fetch, slot: u16) -> Self::Item<'a> {
        // SAFETY: slot is live, so the element is initialized; shared access
        // is guaranteed by the declared read mode.
        unsafe { &*fetch.cast::<C>().as_ptr().add(slot as usize) }
    }
}

// SAFETY: yields a mutable reference to the component declared as written.
unsafe impl<'c, C: Component> QueryData for &'c mut C {
    type Item<'a> = &'a mut C;
    type Fetch = NonNull<u8>;

    fn collect_ids(registry: &TypeRegistry, ids: &mut Vec<TypeId>) {
        ids.push(registry.register::<C>());
    }

    fn collect_access(registry: &TypeRegistry, access: &mut Access) {
        access.add_write(registry.register::<C>());
    }

    fn fetch_init(archetype: &Archetype, chunk: u32) -> Self::Fetch {
        column_base::<C>(archetype, chunk)
    }

    unsafe fn fetch<'a>(fetch: &Self::Fetch, slot: u16) -> Self::Item<'a> {
        // SAFETY: slot is live; exclusivity is guaranteed by the declared
        // write mode plus slot-unique iteration.
        unsafe { &mut *fetch.cast::<C>().as_ptr().add(slot as usize) }
    }
}

// SAFETY: identical to `&mut C` at the fetch level; the distinct marker only
// changes what the contract promises about the prior value.
unsafe impl<C: Component> QueryData for Out<C> {
    type Item<'a> = &'a mut C;
    type Fetch = NonNull<u8>;

    fn collect_ids(registry: &TypeRegistry, ids: &mut Vec<TypeId>) {
        ids.push(registry.register::<C>());
    }

    fn collect_access(registry: &TypeRegistry, access: &mut Access) {
        access.add_write(registry.register::<C>());
    }

    fn fetch_init(archetype: &Archetype, chunk: u32) -> Self::Fetch {
        column_base::<C>(archetype, chunk)
    }

    unsafe fn fetch<'a>(fetch: &Self::Fetch, slot: u16) -> Self::Item<'a> {
        // SAFETY: as for `&mut C`.
        unsafe { &mut *fetch.cast::<C>().as_ptr().add(slot as usize) }
    }
}

/// Implement QueryData for tuples of query data.
macro_rules! tuple_query_data {
    ($($name: ident),*) => {
        // SAFETY: each element upholds its own contract; the tuple adds no
        // access beyond its elements.
        unsafe impl<$($name: QueryData),*> QueryData for ($($name,)*) {
            type Item<'a> = ($($name::Item<'a>,)*);
            type Fetch = ($($name::Fetch,)*);

            fn collect_ids(registry: &TypeRegistry, ids: &mut Vec<TypeId>) {
                $($name::collect_ids(registry, ids);)*
            }

            fn collect_access(registry: &TypeRegistry, access: &mut Access) {
                $($name::collect_access(registry, access);)*
            }

            fn fetch_init(archetype: &Archetype, chunk: u32) -> Self::Fetch {
                ($($name::fetch_init(archetype, chunk),)*)
            }

            unsafe fn fetch<'a>(fetch: &Self::Fetch, slot: u16) -> Self::Item<'a> {
                #[allow(non_snake_case)]
                let ($($name,)*) = fetch;
                ($(
                    // SAFETY: forwarded caller contract.
                    unsafe { $name::fetch($name, slot) },
                )*)
            }
        }
    }
}

all_tuples!(tuple_query_data);
