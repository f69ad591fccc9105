//! Fluent façade over the command buffer.
//!
//! [`Commands`] is what systems see: a thin handle pairing the world's
//! command buffer with its type registry so typed bundles can be erased at
//! record time. [`EntityCommands`] scopes recording to one entity so user
//! code reads `cmd.create().add(a).add(b)`. Neither owns any state beyond
//! the two references.

use crate::ecs::{
    command::CommandBuffer,
    component::{BoxedBundle, Bundle, IntoSignature, TypeRegistry},
    entity::Entity,
    prefab::Prefab,
};

/// The deferred-edit handle handed to systems.
#[derive(Clone, Copy)]
pub struct Commands<'a> {
    buffer: &'a CommandBuffer,
    registry: &'a TypeRegistry,
}

impl<'a> Commands<'a> {
    pub(crate) fn new(buffer: &'a CommandBuffer, registry: &'a TypeRegistry) -> Self {
        Self { buffer, registry }
    }

    /// Record an empty entity spawn. Components can be attached fluently.
    pub fn create(&self) -> EntityCommands<'a> {
        self.spawn(())
    }

    /// Record an entity spawn with a component bundle. The returned handle
    /// wraps a placeholder resolved at playback.
    pub fn spawn<B: Bundle>(&self, bundle: B) -> EntityCommands<'a> {
        let entity = self.buffer.spawn(BoxedBundle::new(bundle, self.registry));
        EntityCommands {
            entity,
            commands: *self,
        }
    }

    /// Record edits against an existing entity.
    pub fn entity(&self, entity: Entity) -> EntityCommands<'a> {
        EntityCommands {
            entity,
            commands: *self,
        }
    }

    /// Record an entity destroy. Stale handles are skipped at playback.
    pub fn despawn(&self, entity: Entity) {
        self.buffer.despawn(entity);
    }

    /// Record a component add for an existing entity.
    pub fn add<B: Bundle>(&self, entity: Entity, bundle: B) {
        self.buffer.add(entity, BoxedBundle::new(bundle, self.registry));
    }

    /// Record a component remove for an existing entity.
    pub fn remove<S: IntoSignature>(&self, entity: Entity) {
        self.buffer
            .remove(entity, S::into_signature(self.registry));
    }

    /// Record a prefab instantiation: the template's component values are
    /// cloned into the log now and copy-constructed into the matching
    /// archetype at playback.
    pub fn instantiate(&self, prefab: &Prefab) -> EntityCommands<'a> {
        let entity = self.buffer.spawn(prefab.to_bundle());
        EntityCommands {
            entity,
            commands: *self,
        }
    }
}

/// Fluent recording scoped to one entity (real or placeholder).
#[derive(Clone, Copy)]
pub struct EntityCommands<'a> {
    entity: Entity,
    commands: Commands<'a>,
}

impl<'a> EntityCommands<'a> {
    /// The entity these edits target. For deferred spawns this is the
    /// placeholder handle; it never becomes a live handle itself.
    pub fn id(&self) -> Entity {
        self.entity
    }

    /// Record a component add.
    pub fn add<B: Bundle>(self, bundle: B) -> Self {
        self.commands.add(self.entity, bundle);
        self
    }

    /// Record a component remove.
    pub fn remove<S: IntoSignature>(self) -> Self {
        self.commands.remove::<S>(self.entity);
        self
    }

    /// Record the entity's destruction.
    pub fn despawn(self) {
        self.commands.despawn(self.entity);
    }
}
