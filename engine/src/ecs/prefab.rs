//! Prefabs: frozen entity templates.
//!
//! A [`Prefab`] is a signature plus one default value per component, erased
//! behind clone hooks. Instantiating it copy-constructs the values into the
//! matching archetype, immediately through
//! [`World::instantiate`](crate::ecs::world::World::instantiate), or deferred
//! through [`Commands::instantiate`](crate::ecs::command::Commands::instantiate).
//! The template itself is immutable once built and can be instantiated any
//! number of times.

use std::{alloc, ptr::NonNull};

use crate::ecs::component::{
    BoxedBundle, Component, ErasedValue, Signature, TypeInfo, TypeRegistry,
};

/// One template value: an owned payload plus the clone hook instantiation
/// uses to copy-construct it.
struct PrefabValue {
    info: TypeInfo,
    data: NonNull<u8>,
    clone_fn: unsafe fn(NonNull<u8>, NonNull<u8>),
}

impl PrefabValue {
    /// Clone the payload into a fresh erased value for one instantiation.
    fn clone_erased(&self) -> ErasedValue {
        let layout = self.info.layout();
        let dst = if layout.size() == 0 {
            NonNull::<u8>::dangling()
        } else {
            // SAFETY: layout has non-zero size.
            let raw = unsafe { alloc::alloc(layout) };
            let Some(ptr) = NonNull::new(raw) else {
                alloc::handle_alloc_error(layout);
            };
            ptr
        };
        // SAFETY: src holds a live value of the described type; dst is a
        // fresh allocation of the same layout.
        unsafe {
            (self.clone_fn)(self.data, dst);
            ErasedValue::from_raw(self.info, dst)
        }
    }
}

impl Drop for PrefabValue {
    fn drop(&mut self) {
        // SAFETY: the payload is live and owned by the template.
        unsafe { self.info.drop_in_place(self.data) };
        let layout = self.info.layout();
        if layout.size() > 0 {
            // SAFETY: allocated with this layout by the builder.
            unsafe { alloc::dealloc(self.data.as_ptr(), layout) };
        }
    }
}

// SAFETY: payloads are component values (`Send + Sync`) behind uniquely-owned
// pointers; the clone hook is a plain fn.
unsafe impl Send for PrefabValue {}
unsafe impl Sync for PrefabValue {}

/// A frozen entity template: a signature plus default component values.
pub struct Prefab {
    values: Vec<PrefabValue>,
    signature: Signature,
}

impl Prefab {
    /// Start building a template.
    pub fn builder() -> PrefabBuilder {
        PrefabBuilder {
            entries: Vec::new(),
        }
    }

    /// The component set an instantiated entity will carry.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Clone the template values into a bundle for one instantiation.
    pub(crate) fn to_bundle(&self) -> BoxedBundle {
        let mut bundle = BoxedBundle::default();
        for value in &self.values {
            bundle.push_raw(value.clone_erased());
        }
        bundle
    }
}

/// One pending builder entry; the component id is resolved when the builder
/// meets a registry at [`PrefabBuilder::build`].
struct PendingValue {
    data: NonNull<u8>,
    layout: alloc::Layout,
    drop_fn: unsafe fn(NonNull<u8>),
    clone_fn: unsafe fn(NonNull<u8>, NonNull<u8>),
    info_fn: fn(&TypeRegistry) -> TypeInfo,
}

impl Drop for PendingValue {
    fn drop(&mut self) {
        // Only reached when the builder is abandoned before `build`.
        unsafe {
            (self.drop_fn)(self.data);
            if self.layout.size() > 0 {
                alloc::dealloc(self.data.as_ptr(), self.layout);
            }
        }
    }
}

// SAFETY: as for PrefabValue.
unsafe impl Send for PendingValue {}
unsafe impl Sync for PendingValue {}

/// Builder collecting default values before the registry is known.
pub struct PrefabBuilder {
    entries: Vec<PendingValue>,
}

impl PrefabBuilder {
    /// Add a default component value. A later `with` of the same component
    /// type replaces the earlier value at build time.
    pub fn with<C: Component + Clone>(mut self, value: C) -> Self {
        let layout = alloc::Layout::new::<C>();
        let data = if layout.size() == 0 {
            NonNull::<C>::dangling().cast::<u8>()
        } else {
            // SAFETY: layout has non-zero size.
            let raw = unsafe { alloc::alloc(layout) };
            let Some(ptr) = NonNull::new(raw) else {
                alloc::handle_alloc_error(layout);
            };
            ptr
        };
        // SAFETY: fresh, properly aligned allocation.
        unsafe { data.cast::<C>().write(value) };

        self.entries.push(PendingValue {
            data,
            layout,
            drop_fn: drop_value::<C>,
            clone_fn: clone_value::<C>,
            info_fn: info_of::<C>,
        });
        self
    }

    /// Freeze the template, resolving component ids against the registry.
    pub fn build(self, registry: &TypeRegistry) -> Prefab {
        let mut values: Vec<PrefabValue> = Vec::with_capacity(self.entries.len());
        for entry in self.entries {
            let info = (entry.info_fn)(registry);
            let value = PrefabValue {
                info,
                data: entry.data,
                clone_fn: entry.clone_fn,
            };
            // Ownership of the payload moved into `value`.
            std::mem::forget(entry);
            if let Some(existing) = values.iter_mut().find(|v| v.info.id() == info.id()) {
                *existing = value;
            } else {
                values.push(value);
            }
        }
        let signature = Signature::new(
            values
                .iter()
                .map(|value| value.info.id())
                .collect::<Vec<_>>(),
        );
        Prefab { values, signature }
    }
}

fn info_of<C: Component>(registry: &TypeRegistry) -> TypeInfo {
    let id = registry.register::<C>();
    TypeInfo::for_component::<C>(id)
}

unsafe fn drop_value<C>(ptr: NonNull<u8>) {
    unsafe { std::ptr::drop_in_place(ptr.cast::<C>().as_ptr()) };
}

unsafe fn clone_value<C: Clone>(src: NonNull<u8>, dst: NonNull<u8>) {
    // SAFETY: src holds a live C; dst is an uninitialized C-sized slot.
    unsafe {
        let cloned = src.cast::<C>().as_ref().clone();
        dst.cast::<C>().write(cloned);
    }
}
