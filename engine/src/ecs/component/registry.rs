//! The component type registry.
//!
//! Each component type used by a world is interned exactly once and identified
//! by a stable numeric [`TypeId`]. The registry records the metadata the
//! type-erased storage layer needs: memory layout and an optional drop
//! function. Rust values are trivially relocatable, so moves are plain byte
//! copies and no move hook is stored.
//!
//! # Thread Safety
//!
//! Lookups are lock-free via `DashMap`; the info table takes a short write
//! lock only when a new type is first registered. Registration is idempotent.

use std::{
    alloc::Layout,
    any::TypeId as StdTypeId,
    ptr::NonNull,
    sync::{
        RwLock,
        atomic::{AtomicU32, Ordering},
    },
};

use dashmap::DashMap;

use crate::ecs::component::Component;

/// A stable identifier for a registered component type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(u32);

impl TypeId {
    /// Construct a new Id from a raw u32 value.
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the index of this ID for use in indexable storage (e.g., Vec, bitset).
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for TypeId {
    #[inline]
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

/// Metadata about a registered component type.
///
/// Contains what type-erased storage needs to lay out, relocate and destroy
/// values: the memory layout and the drop function (absent for trivially
/// destructible types).
#[derive(Debug, Clone, Copy)]
pub struct TypeInfo {
    /// The stable component type id.
    id: TypeId,

    /// The Rust TypeId, for runtime type checking in debug builds.
    type_id: StdTypeId,

    /// The type name, for diagnostics only.
    name: &'static str,

    /// The memory layout of the type.
    layout: Layout,

    /// The drop function, or `None` when the type needs no drop.
    drop_fn: Option<unsafe fn(NonNull<u8>)>,
}

impl TypeInfo {
    /// Build the info for a component already registered under `id`.
    /// The metadata is derivable from the type alone, so no registry read is
    /// needed; the id must be the one the registry assigned.
    #[inline]
    pub(crate) fn for_component<C: 'static>(id: TypeId) -> Self {
        Self::new::<C>(id)
    }

    /// Construct TypeInfo for type `T`.
    fn new<T: 'static>(id: TypeId) -> Self {
        let drop_fn: Option<unsafe fn(NonNull<u8>)> = if std::mem::needs_drop::<T>() {
            Some(Self::drop_impl::<T>)
        } else {
            None
        };
        Self {
            id,
            type_id: StdTypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            layout: Layout::new::<T>(),
            drop_fn,
        }
    }

    /// Get the stable component type id.
    #[inline]
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Get the Rust TypeId.
    #[inline]
    pub fn type_id(&self) -> StdTypeId {
        self.type_id
    }

    /// Get the type name. Diagnostics only; not a stable identifier.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the memory layout.
    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Check if this is a zero-sized type.
    #[inline]
    pub fn is_zero_sized(&self) -> bool {
        self.layout.size() == 0
    }

    /// Get the drop function, if the type needs one.
    #[inline]
    pub fn drop_fn(&self) -> Option<unsafe fn(NonNull<u8>)> {
        self.drop_fn
    }

    /// Drop the value at `ptr` in place, if the type needs dropping.
    ///
    /// # Safety
    /// `ptr` must point at a live, properly aligned value of this type.
    #[inline]
    pub unsafe fn drop_in_place(&self, ptr: NonNull<u8>) {
        if let Some(drop_fn) = self.drop_fn {
            unsafe { drop_fn(ptr) };
        }
    }

    /// Drop implementation for types that need drop.
    unsafe fn drop_impl<T>(ptr: NonNull<u8>) {
        unsafe {
            std::ptr::drop_in_place(ptr.as_ptr() as *mut T);
        }
    }
}

/// A thread-safe registry of component types.
///
/// Maps each Rust type to one [`TypeId`] and its [`TypeInfo`]. Multiple
/// lookups of the same type always yield the same id for the lifetime of the
/// registry (and therefore the world that owns it).
pub struct TypeRegistry {
    /// Map from Rust TypeId to our id. Lock-free reads via sharded concurrent hashmap.
    type_map: DashMap<StdTypeId, TypeId>,

    /// Registered type entries. Protected by RwLock for rare writes.
    infos: RwLock<Vec<TypeInfo>>,

    /// Next available type identifier.
    next_id: AtomicU32,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Create a new, empty type registry.
    #[inline]
    pub fn new() -> Self {
        Self {
            type_map: DashMap::new(),
            infos: RwLock::new(Vec::new()),
            next_id: AtomicU32::new(0),
        }
    }

    /// Register a component type, returning its stable id.
    ///
    /// Idempotent: re-registering returns the existing id.
    pub fn register<C: Component>(&self) -> TypeId {
        let std_type_id = StdTypeId::of::<C>();

        // Fast path: already registered (lock-free read).
        if let Some(existing) = self.type_map.get(&std_type_id) {
            return *existing;
        }

        // Slow path: the entry API arbitrates racing registrations.
        match self.type_map.entry(std_type_id) {
            dashmap::Entry::Occupied(occupied) => *occupied.get(),
            dashmap::Entry::Vacant(vacant) => {
                let id = TypeId(self.next_id.fetch_add(1, Ordering::Relaxed));
                let mut infos = self.infos.write().unwrap();
                let index = id.index();
                if index >= infos.len() {
                    // Ids are dense but assignment order can race ahead of the
                    // table writes, so pad with placeholder entries.
                    infos.resize(index + 1, TypeInfo::new::<Unregistered>(TypeId(u32::MAX)));
                }
                infos[index] = TypeInfo::new::<C>(id);
                vacant.insert(id);
                id
            }
        }
    }

    /// Get the id for a type, if registered.
    ///
    /// Querying with an unregistered type is loud in debug builds; callers in
    /// release treat the `None` as an empty result.
    #[inline]
    pub fn get<C: Component>(&self) -> Option<TypeId> {
        self.type_map
            .get(&StdTypeId::of::<C>())
            .map(|entry| *entry.value())
    }

    /// Get type info by id.
    #[inline]
    pub fn info(&self, id: TypeId) -> Option<TypeInfo> {
        let infos = self.infos.read().unwrap();
        infos
            .get(id.index())
            .filter(|info| info.id == id)
            .copied()
    }

    /// Get type info for a type, if registered.
    #[inline]
    pub fn info_of<C: Component>(&self) -> Option<TypeInfo> {
        let id = self.get::<C>()?;
        self.info(id)
    }

    /// Get the number of registered types.
    #[inline]
    pub fn len(&self) -> usize {
        self.next_id.load(Ordering::Relaxed) as usize
    }

    /// Check if the registry is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Placeholder type used to pad the info table while a racing registration is
/// still writing its entry. Never observable through the public API because
/// `info()` checks the stored id.
struct Unregistered;

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_macros::Component;
    use std::sync::Arc;
    use std::thread;

    #[derive(Component)]
    struct Position {
        #[allow(dead_code)]
        x: f32,
        #[allow(dead_code)]
        y: f32,
    }

    #[derive(Component)]
    struct Velocity {
        #[allow(dead_code)]
        dx: f32,
        #[allow(dead_code)]
        dy: f32,
    }

    #[test]
    fn register_returns_stable_id() {
        // Given
        let registry = TypeRegistry::new();

        // When
        let id1 = registry.register::<Position>();
        let id2 = registry.register::<Position>();

        // Then
        assert_eq!(id1, id2);
        assert_eq!(registry.get::<Position>(), Some(id1));
    }

    #[test]
    fn different_types_get_different_ids() {
        let registry = TypeRegistry::new();

        let pos_id = registry.register::<Position>();
        let vel_id = registry.register::<Velocity>();

        assert_ne!(pos_id, vel_id);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unregistered_type_is_absent() {
        let registry = TypeRegistry::new();
        registry.register::<Position>();

        assert!(registry.get::<Velocity>().is_none());
        assert!(registry.info_of::<Velocity>().is_none());
    }

    #[test]
    fn info_carries_layout_and_drop() {
        // Given
        let registry = TypeRegistry::new();
        let id = registry.register::<Position>();

        // When
        let info = registry.info(id).unwrap();

        // Then
        assert_eq!(info.id(), id);
        assert_eq!(info.type_id(), StdTypeId::of::<Position>());
        assert_eq!(info.layout(), Layout::new::<Position>());
        // Plain-old-data needs no drop.
        assert!(info.drop_fn().is_none());
    }

    #[test]
    fn drop_function_is_called() {
        // Given
        use std::sync::atomic::{AtomicBool, Ordering};

        static DROP_CALLED: AtomicBool = AtomicBool::new(false);

        #[derive(Component)]
        struct DropTracker;

        impl Drop for DropTracker {
            fn drop(&mut self) {
                DROP_CALLED.store(true, Ordering::Relaxed);
            }
        }

        let registry = TypeRegistry::new();
        let id = registry.register::<DropTracker>();
        let info = registry.info(id).unwrap();
        assert!(info.drop_fn().is_some());

        let layout = Layout::new::<DropTracker>();
        let mut value = std::mem::ManuallyDrop::new(DropTracker);
        let ptr = NonNull::new(&mut *value as *mut DropTracker as *mut u8).unwrap();
        assert_eq!(layout.size(), 0);

        // When
        unsafe { info.drop_in_place(ptr) };

        // Then
        assert!(DROP_CALLED.load(Ordering::Relaxed));
    }

    #[test]
    fn concurrent_registration_same_type() {
        // Given
        let registry = Arc::new(TypeRegistry::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.register::<Position>())
            })
            .collect();

        // When
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Then
        assert!(ids.iter().all(|&id| id == ids[0]));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn zero_sized_components_register() {
        #[derive(Component)]
        struct Tag;

        let registry = TypeRegistry::new();
        let info = registry.info(registry.register::<Tag>()).unwrap();
        assert!(info.is_zero_sized());
    }
}
