//! Canonical component-set signatures.
//!
//! A [`Signature`] is the sorted, deduplicated set of component type ids that
//! identifies an archetype and drives query filtering. Two signatures are
//! equal iff the sets are equal; the canonical order makes them usable as
//! hash-map keys.

use crate::{
    all_tuples,
    ecs::component::{Component, TypeId, TypeRegistry},
};

/// A canonical set of component type ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    ids: Vec<TypeId>,
}

impl Signature {
    /// The empty signature. Legal: it names the singleton archetype whose
    /// chunks carry only the identity array.
    pub const EMPTY: Self = Signature { ids: Vec::new() };

    /// Construct a new signature from the given component ids.
    /// Ids are sorted and deduplicated into canonical form.
    #[inline]
    pub fn new(ids: impl Into<Vec<TypeId>>) -> Self {
        let mut ids = ids.into();
        ids.sort();
        ids.dedup();
        ids.shrink_to_fit();
        Self { ids }
    }

    /// Get the component ids in canonical order.
    #[inline]
    pub fn ids(&self) -> &[TypeId] {
        &self.ids
    }

    /// The number of component types in this signature.
    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether this signature has no components.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Determine if this signature contains the given component id.
    #[inline]
    pub fn contains(&self, id: TypeId) -> bool {
        // Binary search since the ids are sorted.
        self.ids.binary_search(&id).is_ok()
    }

    /// Determine if this signature contains every id in `other`.
    #[inline]
    pub fn contains_all(&self, other: &Signature) -> bool {
        other.ids.iter().all(|id| self.contains(*id))
    }

    /// Determine if this signature contains any id in `other`.
    #[inline]
    pub fn contains_any(&self, other: &Signature) -> bool {
        other.ids.iter().any(|id| self.contains(*id))
    }

    /// The union of this signature and another.
    #[inline]
    pub fn merge(&self, other: &Signature) -> Self {
        let mut ids = Vec::with_capacity(self.ids.len() + other.ids.len());
        ids.extend_from_slice(&self.ids);
        ids.extend_from_slice(&other.ids);
        Self::new(ids)
    }

    /// The ids present in this signature but not in `other`.
    #[inline]
    pub fn difference(&self, other: &Signature) -> Self {
        Self {
            ids: self
                .ids
                .iter()
                .copied()
                .filter(|id| !other.contains(*id))
                .collect(),
        }
    }

    /// The ids present in both signatures.
    #[inline]
    pub fn intersection(&self, other: &Signature) -> Self {
        Self {
            ids: self
                .ids
                .iter()
                .copied()
                .filter(|id| other.contains(*id))
                .collect(),
        }
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl From<Vec<TypeId>> for Signature {
    #[inline]
    fn from(value: Vec<TypeId>) -> Self {
        Signature::new(value)
    }
}

/// Trait for resolving a type (a component or a tuple of components) into a
/// [`Signature`] against a registry. Resolution registers the types.
pub trait IntoSignature<Marker = ()> {
    /// Resolve into a canonical signature using the given registry.
    fn into_signature(registry: &TypeRegistry) -> Signature;
}

/// [`IntoSignature`] implementation for the empty tuple.
impl IntoSignature for () {
    fn into_signature(_registry: &TypeRegistry) -> Signature {
        Signature::EMPTY
    }
}

/// [`IntoSignature`] implementation for single component types.
impl<C: Component> IntoSignature for C {
    fn into_signature(registry: &TypeRegistry) -> Signature {
        Signature::new([registry.register::<C>()])
    }
}

/// [`IntoSignature`] implementation for tuples of other [`IntoSignature`] types.
macro_rules! tuple_signature {
    ($($name: ident),*) => {
        impl<$($name: IntoSignature),*> IntoSignature for ($($name,)*) {
            fn into_signature(registry: &TypeRegistry) -> Signature {
                let mut ids = Vec::new();
                $(
                    ids.extend(<$name>::into_signature(registry).ids());
                )*
                Signature::new(ids)
            }
        }
    }
}

all_tuples!(tuple_signature);
