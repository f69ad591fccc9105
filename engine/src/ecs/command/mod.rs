//! Deferred command buffer for structural edits.
//!
//! Systems may not change which archetype an entity belongs to while queries
//! are running. Instead they record the edit here; the buffer is an
//! append-only, lock-free log that the frame driver plays back single-threaded
//! at frame fences (begin-frame, after each fixed tick, end-frame).
//!
//! # Ordering contract
//!
//! Commands are applied in the linearization order of `push` calls on the
//! shared queue: FIFO for any single producer, stable within a frame for a
//! given interleaving. Playback is deterministic given the recorded order.
//!
//! # Placeholders
//!
//! [`CommandBuffer::spawn`] returns immediately with a *placeholder* handle
//! (a reserved generation plus a per-buffer provisional index). Later commands
//! may target the placeholder; playback allocates the real entity and rewrites
//! targets through a placeholder → real map. A placeholder from a previous
//! frame that was never spawned resolves to nothing and its command is
//! dropped with a warning.
//!
//! # Cancellation
//!
//! Component payloads ride in the log as erased values with explicit drop
//! hooks. A command consumed by playback disarms its payloads (ownership
//! moved into the archetype); commands discarded without playback (a cleared
//! buffer, or the remainder after a fatal error) run the drops.

mod fluent;

use crossbeam::queue::SegQueue;
use log::{debug, warn};
use std::{collections::HashMap, sync::atomic::{AtomicU32, Ordering}};

pub use fluent::{Commands, EntityCommands};

use crate::ecs::{
    component::{BoxedBundle, Signature},
    entity::Entity,
    storage::StorageError,
    world::World,
};

/// A deferred structural edit.
pub enum Command {
    /// Create an entity carrying the bundled components. `entity` is a
    /// placeholder resolved to a real handle at playback.
    Spawn {
        /// The placeholder handle handed back to the recorder.
        entity: Entity,
        /// Type-erased component values to attach.
        components: BoxedBundle,
    },

    /// Destroy an entity and all its components. Stale targets are silently
    /// skipped at playback.
    Despawn {
        /// The entity (or placeholder) to destroy.
        entity: Entity,
    },

    /// Add components to an existing entity. Components the entity already
    /// has are overwritten in place; new ones migrate it to the merged
    /// archetype.
    AddComponents {
        /// The target entity (or placeholder).
        entity: Entity,
        /// Type-erased component values to add.
        components: BoxedBundle,
    },

    /// Remove components from an existing entity by type. Components not
    /// present are ignored.
    RemoveComponents {
        /// The target entity (or placeholder).
        entity: Entity,
        /// Which component types to remove.
        components: Signature,
    },
}

/// Thread-safe append-only log of deferred structural edits.
///
/// `push` is lock-free and callable from any number of producers; playback
/// ([`apply`](CommandBuffer::apply)) runs on the frame driver thread while no
/// queries are running.
#[derive(Default)]
pub struct CommandBuffer {
    commands: SegQueue<Command>,

    /// Provisional index source for placeholder handles. Never reset: a
    /// placeholder must stay unambiguous across frames so a late command
    /// targeting last frame's placeholder cannot alias a fresh one.
    placeholders: AtomicU32,
}

impl CommandBuffer {
    /// Create a new empty command buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no commands are queued.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// The number of queued commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Record an entity spawn, returning the placeholder handle.
    pub fn spawn(&self, components: BoxedBundle) -> Entity {
        let placeholder = Entity::placeholder(self.placeholders.fetch_add(1, Ordering::Relaxed));
        self.push(Command::Spawn {
            entity: placeholder,
            components,
        });
        placeholder
    }

    /// Record an entity destroy.
    pub fn despawn(&self, entity: Entity) {
        self.push(Command::Despawn { entity });
    }

    /// Record a component add.
    pub fn add(&self, entity: Entity, components: BoxedBundle) {
        self.push(Command::AddComponents { entity, components });
    }

    /// Record a component remove.
    pub fn remove(&self, entity: Entity, components: Signature) {
        self.push(Command::RemoveComponents { entity, components });
    }

    /// Push a raw command.
    pub fn push(&self, command: Command) {
        self.commands.push(command);
    }

    /// Drain all queued commands in applied order.
    fn drain(&self) -> Vec<Command> {
        let mut commands = Vec::with_capacity(self.commands.len());
        while let Some(command) = self.commands.pop() {
            commands.push(command);
        }
        commands
    }

    /// Discard all queued commands. Their payload drops run.
    pub fn clear(&self) {
        while self.commands.pop().is_some() {}
    }

    /// Play the queued commands back into the world, in recorded order.
    ///
    /// Called at frame fences with no queries running. On a storage failure
    /// the failed command and every remaining one are discarded (their
    /// payload drops run) and the error propagates; everything already
    /// applied stays applied, leaving the world consistent.
    pub(crate) fn apply(&self, world: &mut World) -> Result<(), StorageError> {
        if self.is_empty() {
            return Ok(());
        }

        let commands = self.drain();
        debug!("playing back {} deferred command(s)", commands.len());

        // Placeholder index → real handle, filled as spawns apply.
        let mut spawned: HashMap<u32, Entity> = HashMap::new();
        let resolve = |entity: Entity, spawned: &HashMap<u32, Entity>| -> Option<Entity> {
            if entity.is_placeholder() {
                let real = spawned.get(&(entity.index() as u32)).copied();
                if real.is_none() {
                    warn!("command targets an unresolved placeholder: {entity:?}");
                }
                real
            } else {
                Some(entity)
            }
        };

        for command in commands {
            match command {
                Command::Spawn {
                    entity: placeholder,
                    mut components,
                } => {
                    let (entities, storage, registry) = world.split_mut();
                    let real = entities.create();
                    if let Err(error) =
                        storage.spawn_boxed(entities, real, &mut components, registry)
                    {
                        // Dropping the remaining drained commands runs their
                        // payload drops; the world keeps what already applied.
                        entities.destroy(real);
                        return Err(error);
                    }
                    spawned.insert(placeholder.index() as u32, real);
                }
                Command::Despawn { entity } => {
                    let Some(target) = resolve(entity, &spawned) else {
                        continue;
                    };
                    let (entities, storage, _) = world.split_mut();
                    // Stale handles fail silently inside despawn.
                    storage.despawn(entities, target);
                }
                Command::AddComponents {
                    entity,
                    mut components,
                } => {
                    let Some(target) = resolve(entity, &spawned) else {
                        continue;
                    };
                    let (entities, storage, registry) = world.split_mut();
                    if let Err(error) =
                        storage.add_boxed(entities, target, &mut components, registry)
                    {
                        return Err(error);
                    }
                }
                Command::RemoveComponents { entity, components } => {
                    let Some(target) = resolve(entity, &spawned) else {
                        continue;
                    };
                    let (entities, storage, registry) = world.split_mut();
                    storage.remove(entities, target, &components, registry)?;
                }
            }
        }
        Ok(())
    }
}
