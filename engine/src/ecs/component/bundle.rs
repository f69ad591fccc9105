//! Component value sets, typed and type-erased.
//!
//! A [`Bundle`] is a typed set of component values (a single component, or a
//! tuple of bundles) that can be written slot-wise into storage through a
//! [`BundleTarget`].
//!
//! A [`BoxedBundle`] is the erased form used by the deferred command log and
//! by prefabs: each enqueued value is an [`ErasedValue`] owning a heap payload
//! together with its drop hook. Moving a value into an archetype is a byte
//! copy followed by disarming the hook; a value still armed when the bundle is
//! dropped (a cancelled command) runs its drop. This keeps the log
//! inspectable and its cleanup deterministic.

use std::{alloc, ptr::NonNull};

use crate::{
    all_tuples,
    ecs::component::{Component, IntoSignature, Signature, TypeId, TypeInfo, TypeRegistry},
};

/// A destination that component values can be written into, one at a time.
pub trait BundleTarget {
    /// Accept ownership of one component value for the given type id.
    fn write<C: Component>(&mut self, id: TypeId, value: C);
}

/// A typed set of component values owned by an entity-to-be.
///
/// Implemented for single components, the empty tuple, and tuples of bundles.
pub trait Bundle: IntoSignature + Send + Sync + 'static {
    /// Apply the component values in this bundle to the given target.
    /// Takes ownership of self.
    fn write_into(self, registry: &TypeRegistry, target: &mut impl BundleTarget);
}

/// Implement Bundle for single component types.
impl<C: Component> Bundle for C {
    fn write_into(self, registry: &TypeRegistry, target: &mut impl BundleTarget) {
        target.write::<C>(registry.register::<C>(), self);
    }
}

impl Bundle for () {
    fn write_into(self, _registry: &TypeRegistry, _target: &mut impl BundleTarget) {
        // No components to apply.
    }
}

/// Implement Bundle for tuples of bundles.
macro_rules! tuple_bundle {
    ($($name: ident),*) => {
        impl<$($name: Bundle),*> Bundle for ($($name,)*) {
            fn write_into(self, registry: &TypeRegistry, target: &mut impl BundleTarget) {
                #[allow(non_snake_case)]
                let ( $($name,)* ) = self;
                $(<$name as Bundle>::write_into($name, registry, target);)*
            }
        }
    }
}

all_tuples!(tuple_bundle);

/// One erased component value: an owned payload plus the hooks needed to move
/// it into a chunk slot or destroy it if the operation is abandoned.
pub struct ErasedValue {
    /// Type metadata; carries the layout and the drop hook.
    info: TypeInfo,

    /// The owned payload. Dangling (never dereferenced for reads/writes of
    /// size > 0) when the component is zero-sized.
    data: NonNull<u8>,

    /// Whether this value still owns its payload. Disarmed once the payload
    /// has been moved into storage.
    armed: bool,
}

impl ErasedValue {
    /// Box a component value into its erased form.
    pub fn new<C: Component>(info: TypeInfo, value: C) -> Self {
        debug_assert_eq!(
            info.type_id(),
            std::any::TypeId::of::<C>(),
            "erased value constructed with mismatched type info"
        );
        let layout = info.layout();
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
        // SAFETY: freshly allocated (or dangling for a ZST), properly aligned.
        unsafe { data.cast::<C>().write(value) };
        Self {
            info,
            data,
            armed: true,
        }
    }

    /// Construct an erased value from an already-initialized payload.
    ///
    /// # Safety
    /// `data` must be an allocation of `info.layout()` (or dangling for a
    /// zero-sized layout) holding a live value of the described type, and
    /// ownership of both passes to the returned value.
    pub(crate) unsafe fn from_raw(info: TypeInfo, data: NonNull<u8>) -> Self {
        Self {
            info,
            data,
            armed: true,
        }
    }

    /// The stable component type id of the payload.
    #[inline]
    pub fn id(&self) -> TypeId {
        self.info.id()
    }

    /// The payload's type metadata.
    #[inline]
    pub fn info(&self) -> &TypeInfo {
        &self.info
    }

    /// The payload pointer.
    #[inline]
    pub fn data(&self) -> NonNull<u8> {
        self.data
    }

    /// Release ownership of the payload after it has been byte-copied into
    /// storage. The drop hook will no longer run for it.
    ///
    /// # Safety
    /// The caller must have moved the payload out (or otherwise taken
    /// responsibility for dropping it).
    #[inline]
    pub(crate) unsafe fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ErasedValue {
    fn drop(&mut self) {
        if self.armed {
            // Cancelled before playback consumed it: destroy the payload.
            // SAFETY: armed means the payload is still live and owned here.
            unsafe { self.info.drop_in_place(self.data) };
        }
        let layout = self.info.layout();
        if layout.size() > 0 {
            // SAFETY: allocated with this layout in `new`/`from_raw`.
            unsafe { alloc::dealloc(self.data.as_ptr(), layout) };
        }
    }
}

// SAFETY: the payload is a component value and `Component: Send + Sync`; the
// raw pointer is uniquely owned by this value.
unsafe impl Send for ErasedValue {}
unsafe impl Sync for ErasedValue {}

/// A type-erased bundle: the component values for one structural operation,
/// each carried as an [`ErasedValue`].
#[derive(Default)]
pub struct BoxedBundle {
    values: Vec<ErasedValue>,
    signature: Signature,
}

impl BoxedBundle {
    /// Erase a typed bundle against the given registry.
    pub fn new<B: Bundle>(bundle: B, registry: &TypeRegistry) -> Self {
        let mut boxed = Self {
            values: Vec::new(),
            signature: Signature::EMPTY,
        };
        bundle.write_into(registry, &mut boxed);
        boxed.signature = Signature::new(
            boxed
                .values
                .iter()
                .map(|value| value.id())
                .collect::<Vec<_>>(),
        );
        boxed
    }

    /// The canonical signature of the carried components.
    #[inline]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Whether the bundle carries no values.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The carried values, in recorded order. The log stays inspectable.
    #[inline]
    pub fn values(&self) -> &[ErasedValue] {
        &self.values
    }

    /// Mutable access to the carried values, for playback.
    #[inline]
    pub(crate) fn values_mut(&mut self) -> &mut [ErasedValue] {
        &mut self.values
    }

    /// Append an already-erased value, replacing (and dropping) any previous
    /// value of the same component type. Used by prefab instantiation.
    pub(crate) fn push_raw(&mut self, value: ErasedValue) {
        self.replace(value);
        self.signature = Signature::new(
            self.values
                .iter()
                .map(|value| value.id())
                .collect::<Vec<_>>(),
        );
    }

    fn replace(&mut self, value: ErasedValue) {
        if let Some(existing) = self.values.iter_mut().find(|v| v.id() == value.id()) {
            // Last write wins; the earlier payload is destroyed.
            *existing = value;
        } else {
            self.values.push(value);
        }
    }
}

impl BundleTarget for BoxedBundle {
    fn write<C: Component>(&mut self, id: TypeId, value: C) {
        // The info for a known-registered component is derivable from the type
        // alone, which keeps the registry off the bundle hot path.
        let info = TypeInfo::for_component::<C>(id);
        self.replace(ErasedValue::new::<C>(info, value));
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

    #[derive(Component, Debug, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Component, Debug, PartialEq)]
    struct Health {
        value: i32,
    }

    #[derive(Component)]
    struct DropTracker(Arc<AtomicUsize>);

    impl Drop for DropTracker {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn boxed_bundle_collects_signature() {
        // Given
        let registry = TypeRegistry::new();

        // When
        let bundle = BoxedBundle::new(
            (Position { x: 1.0, y: 2.0 }, Health { value: 10 }),
            &registry,
        );

        // Then
        let expected = <(Position, Health)>::into_signature(&registry);
        assert_eq!(bundle.signature(), &expected);
        assert_eq!(bundle.values().len(), 2);
    }

    #[test]
    fn cancelled_bundle_drops_payloads() {
        // Given
        let registry = TypeRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        // When - the bundle is dropped without ever being played back
        {
            let _bundle = BoxedBundle::new(DropTracker(Arc::clone(&counter)), &registry);
            assert_eq!(counter.load(Ordering::SeqCst), 0);
        }

        // Then - the cancelled payload was destroyed exactly once
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disarmed_value_skips_drop() {
        // Given
        let registry = TypeRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut bundle = BoxedBundle::new(DropTracker(Arc::clone(&counter)), &registry);

        // When - simulate playback: move the payload out, then disarm
        {
            let value = &mut bundle.values_mut()[0];
            // SAFETY: reading the payload out transfers ownership to `moved`.
            let moved = unsafe { value.data().cast::<DropTracker>().read() };
            unsafe { value.disarm() };
            drop(moved);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Then - dropping the bundle must not double-drop
        drop(bundle);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_component_last_write_wins() {
        // Given
        let registry = TypeRegistry::new();

        // When
        let bundle = BoxedBundle::new(
            (Health { value: 1 }, Health { value: 2 }),
            &registry,
        );

        // Then
        assert_eq!(bundle.values().len(), 1);
        let stored = unsafe { bundle.values()[0].data().cast::<Health>().as_ref() };
        assert_eq!(stored, &Health { value: 2 });
    }

    #[test]
    fn zero_sized_components_carry_no_allocation() {
        #[derive(Component)]
        struct Tag;

        let registry = TypeRegistry::new();
        let bundle = BoxedBundle::new(Tag, &registry);
        assert!(bundle.values()[0].info().is_zero_sized());
    }
}
