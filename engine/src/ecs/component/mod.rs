//! Component types and their runtime metadata.
//!
//! Components are plain data values attached to entities. The core never
//! encodes component identity in its internal type system; each type is
//! interned once into the [`TypeRegistry`] and identified by a stable numeric
//! [`TypeId`], with the typed API living at the call-site boundary.
//!
//! - [`Component`]: the trait all component types implement (usually derived)
//! - [`TypeRegistry`] / [`TypeInfo`]: per-type size, alignment and drop hook
//! - [`Signature`]: a canonical sorted set of component type ids
//! - [`Bundle`] / [`BoxedBundle`]: typed and type-erased component value sets

mod bundle;
mod registry;
mod signature;

pub use bundle::{BoxedBundle, Bundle, BundleTarget, ErasedValue};
pub use registry::{TypeId, TypeInfo, TypeRegistry};
pub use signature::{IntoSignature, Signature};

/// A trait representing a component in the ECS.
///
/// At present this only sets the required trait bounds for a type to be used
/// as a component. Derive it with `#[derive(Component)]`.
pub trait Component: 'static + Sized + Send + Sync {}
