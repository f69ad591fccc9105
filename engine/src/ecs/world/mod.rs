//! The World: the central container for entities, components, and systems.
//!
//! A `World` owns the entity table, the component type registry, the
//! archetype storage, the deferred command buffer, the system schedule, and
//! (optionally) a worker pool. Worlds are independent; entity handles never
//! cross worlds.
//!
//! # Frame driver
//!
//! The host drives a frame through the hooks, in order:
//!
//! ```ignore
//! world.begin_frame(dt)?;          // flush, reset cancellation
//! while accumulator >= STEP {
//!     world.fixed_update(STEP)?;   // Fixed systems, then flush
//!     accumulator -= STEP;
//! }
//! world.update(dt)?;               // Simulation systems
//! world.render(alpha)?;            // Render systems
//! world.end_frame()?;              // flush
//! ```
//!
//! `fixed_update` may run zero or more times per frame; the accumulator
//! policy belongs to the caller. The command buffer is flushed at
//! `begin_frame`, after each fixed tick, and at `end_frame`. Storage is
//! consistent at every one of those fences, and mid-frame at every layer
//! boundary. A fatal error from a hook aborts the frame and leaves the world
//! in its last consistent state.
//!
//! # Structural edits
//!
//! The immediate API (`spawn`, `despawn`, `add_components`, ...) requires
//! `&mut World` and is meant for setup and for playback at the fences.
//! Inside systems the world is shared; structural edits go through
//! [`Commands`].

mod access;

use std::{
    error::Error,
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

use log::{info, warn};

pub use access::Access;

use crate::{
    ecs::{
        command::{CommandBuffer, Commands},
        component::{Component, Bundle, IntoSignature, Signature, TypeId, TypeRegistry},
        entity::{Entities, Entity},
        prefab::Prefab,
        query::{Query, QueryData},
        schedule::{Schedule, ScheduleError, SystemEntry},
        storage::{DEFAULT_CHUNK_SIZE, Storage, StorageError},
        system::{Phase, System, SystemBuilder, SystemId},
    },
    tasks::{CancelToken, Executor},
};

/// A world identifier, unique within the process. Diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u32);

impl Id {
    /// Get the raw identifier value.
    #[inline]
    pub const fn id(&self) -> u32 {
        self.0
    }
}

/// Host-supplied configuration for a new world.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Worker threads for parallel system and chunk execution. Zero means no
    /// pool: everything the scheduler could parallelize runs serially.
    pub worker_threads: usize,

    /// Chunk size in bytes. Leave at the default unless profiling says
    /// otherwise.
    pub chunk_size: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// A fatal failure escaping a frame hook. The frame is aborted; the world
/// stays in its last consistent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Storage could not complete a structural operation.
    Storage(StorageError),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Storage(error) => write!(f, "frame aborted: {error}"),
        }
    }
}

impl Error for FrameError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FrameError::Storage(error) => Some(error),
        }
    }
}

impl From<StorageError> for FrameError {
    fn from(error: StorageError) -> Self {
        FrameError::Storage(error)
    }
}

static NEXT_WORLD_ID: AtomicU32 = AtomicU32::new(0);

/// The central container. See the module docs.
pub struct World {
    /// The world's unique identifier.
    id: Id,

    /// The entity table.
    entities: Entities,

    /// The component type registry.
    components: TypeRegistry,

    /// Archetype storage.
    storage: Storage,

    /// The deferred command buffer, flushed at frame fences.
    commands: CommandBuffer,

    /// The system schedule.
    schedule: Schedule,

    /// The worker pool, when the host asked for one.
    executor: Option<Executor>,

    /// The frame-scoped cancellation token.
    cancel: CancelToken,

    /// The current frame number. Zero until the first `begin_frame`.
    frame_number: u64,

    /// Accumulated frame time in seconds.
    time: f64,
}

impl World {
    /// Create a new world from the given configuration.
    pub fn new(config: WorldConfig) -> Self {
        let id = Id(NEXT_WORLD_ID.fetch_add(1, Ordering::Relaxed));
        let executor = if config.worker_threads > 0 {
            Some(Executor::new(config.worker_threads))
        } else {
            None
        };
        info!(
            "world {} created ({} worker(s), {} byte chunks)",
            id.0, config.worker_threads, config.chunk_size
        );
        Self {
            id,
            entities: Entities::new(),
            components: TypeRegistry::new(),
            storage: Storage::new(config.chunk_size),
            commands: CommandBuffer::new(),
            schedule: Schedule::new(),
            executor,
            cancel: CancelToken::new(),
            frame_number: 0,
            time: 0.0,
        }
    }

    /// The world's identifier.
    #[inline]
    pub fn id(&self) -> Id {
        self.id
    }

    /// The component type registry.
    #[inline]
    pub fn components(&self) -> &TypeRegistry {
        &self.components
    }

    /// Register a component type, returning its stable id.
    pub fn register_component<C: Component>(&self) -> TypeId {
        self.components.register::<C>()
    }

    /// The archetype storage.
    #[inline]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// The current structure version.
    #[inline]
    pub fn structure_version(&self) -> u64 {
        self.storage.version()
    }

    /// The number of live entities.
    #[inline]
    pub fn entity_count(&self) -> usize {
        self.entities.live_count()
    }

    /// The worker pool, if configured.
    #[inline]
    pub fn executor(&self) -> Option<&Executor> {
        self.executor.as_ref()
    }

    /// The system schedule.
    #[inline]
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// The current frame number.
    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Accumulated frame time in seconds.
    #[inline]
    pub fn time(&self) -> f64 {
        self.time
    }

    /// A clone of the frame's cancellation token.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Whether frame cancellation was requested.
    #[inline]
    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Request cancellation of the current frame. Systems and parallel
    /// iterations observe it cooperatively.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    // ---- immediate structural API ------------------------------------------

    /// Spawn an entity with a component bundle.
    ///
    /// # Panics
    /// Panics if the chunk pool cannot allocate, like ordinary collection
    /// growth. The deferred path reports the failure through the frame hooks
    /// instead.
    pub fn spawn<B: Bundle>(&mut self, bundle: B) -> Entity {
        let entity = self.entities.create();
        let World {
            entities,
            storage,
            components,
            ..
        } = self;
        match storage.spawn(entities, entity, bundle, components) {
            Ok(_) => entity,
            Err(error) => {
                entities.destroy(entity);
                panic!("failed to spawn entity: {error}");
            }
        }
    }

    /// Spawn many entities sharing one bundle type. The archetype is resolved
    /// once and entity ids are allocated in one block, which is noticeably
    /// cheaper than a [`spawn`](Self::spawn) loop for large batches.
    ///
    /// # Panics
    /// As [`spawn`](Self::spawn) on allocation failure.
    pub fn spawn_many<B: Bundle>(&mut self, bundles: impl IntoIterator<Item = B>) -> Vec<Entity> {
        let bundles: Vec<B> = bundles.into_iter().collect();
        let spawned = self.entities.create_many(bundles.len());
        let World {
            entities,
            storage,
            components,
            ..
        } = self;
        match storage.spawn_many(
            entities,
            spawned.iter().copied().zip(bundles),
            components,
        ) {
            Ok(()) => spawned,
            Err(error) => panic!("failed to spawn entity batch: {error}"),
        }
    }

    /// Destroy an entity and its components. Stale handles are a no-op.
    pub fn despawn(&mut self, entity: Entity) -> bool {
        let World {
            entities, storage, ..
        } = self;
        storage.despawn(entities, entity)
    }

    /// Add components to an entity immediately. Present components are
    /// overwritten in place; new ones migrate the entity.
    ///
    /// Returns `false` for a stale handle.
    ///
    /// # Panics
    /// As [`spawn`](Self::spawn) on allocation failure.
    pub fn add_components<B: Bundle>(&mut self, entity: Entity, bundle: B) -> bool {
        let mut boxed = crate::ecs::component::BoxedBundle::new(bundle, &self.components);
        let World {
            entities,
            storage,
            components,
            ..
        } = self;
        match storage.add_boxed(entities, entity, &mut boxed, components) {
            Ok(changed) => changed,
            Err(error) => panic!("failed to add components: {error}"),
        }
    }

    /// Remove components from an entity immediately. Absent components are a
    /// no-op.
    ///
    /// # Panics
    /// As [`spawn`](Self::spawn) on allocation failure.
    pub fn remove_components<S: IntoSignature>(&mut self, entity: Entity) -> bool {
        let signature = S::into_signature(&self.components);
        let World {
            entities,
            storage,
            components,
            ..
        } = self;
        match storage.remove(entities, entity, &signature, components) {
            Ok(changed) => changed,
            Err(error) => panic!("failed to remove components: {error}"),
        }
    }

    /// Instantiate a prefab immediately, copy-constructing its values into
    /// the matching archetype.
    pub fn instantiate(&mut self, prefab: &Prefab) -> Entity {
        let entity = self.entities.create();
        let mut bundle = prefab.to_bundle();
        let World {
            entities,
            storage,
            components,
            ..
        } = self;
        match storage.spawn_boxed(entities, entity, &mut bundle, components) {
            Ok(_) => entity,
            Err(error) => {
                entities.destroy(entity);
                panic!("failed to instantiate prefab: {error}");
            }
        }
    }

    // ---- component access --------------------------------------------------

    /// Read a component of one entity. Absence (a stale handle, or a
    /// component the entity does not carry) is `None`, not an error.
    pub fn get<C: Component>(&self, entity: Entity) -> Option<&C> {
        let location = self.entities.locate(entity)?;
        let id = self.component_id::<C>()?;
        let ptr = self.storage.component_ptr(location, id)?;
        // SAFETY: the slot is live and stores a C; structural moves need
        // `&mut World`, which this shared borrow excludes.
        Some(unsafe { ptr.cast::<C>().as_ref() })
    }

    /// Mutable access to a component of one entity.
    pub fn get_mut<C: Component>(&mut self, entity: Entity) -> Option<&mut C> {
        let location = self.entities.locate(entity)?;
        let id = self.component_id::<C>()?;
        let ptr = self.storage.component_ptr(location, id)?;
        // SAFETY: as `get`, with exclusivity from `&mut self`.
        Some(unsafe { &mut *ptr.cast::<C>().as_ptr() })
    }

    /// Whether the entity is live and carries `C`.
    pub fn has<C: Component>(&self, entity: Entity) -> bool {
        self.get::<C>(entity).is_some()
    }

    /// Whether the entity handle is live.
    #[inline]
    pub fn contains(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    /// The storage location of a live entity, or `None` for a stale handle.
    #[inline]
    pub fn locate(&self, entity: Entity) -> Option<crate::ecs::storage::Location> {
        self.entities.locate(entity)
    }

    /// The component signature of a live entity.
    pub fn signature_of(&self, entity: Entity) -> Option<&Signature> {
        let location = self.entities.locate(entity)?;
        Some(self.storage.archetype(location.archetype()).signature())
    }

    /// Construct a query value over `D`. Sugar for `Query::new()`; the query
    /// may outlive any particular frame.
    pub fn query<D: QueryData>(&self) -> Query<D> {
        Query::new()
    }

    /// Resolve a component id, loud in debug when the type was never
    /// registered, an empty result in release.
    fn component_id<C: Component>(&self) -> Option<TypeId> {
        let id = self.components.get::<C>();
        debug_assert!(
            id.is_some(),
            "component type {} was never registered with this world",
            std::any::type_name::<C>()
        );
        id
    }

    // ---- deferred commands -------------------------------------------------

    /// The fluent deferred-edit handle.
    pub fn commands(&self) -> Commands<'_> {
        Commands::new(&self.commands, &self.components)
    }

    /// The raw command buffer.
    pub fn command_buffer(&self) -> &CommandBuffer {
        &self.commands
    }

    /// Play back all deferred commands now. Normally called through the frame
    /// fences; exposed for setup code and tests.
    pub fn flush(&mut self) -> Result<(), FrameError> {
        let buffer = std::mem::take(&mut self.commands);
        let result = buffer.apply(self);
        self.commands = buffer;
        result.map_err(FrameError::from)
    }

    // ---- systems -----------------------------------------------------------

    /// Start registering a system. Finish with
    /// [`commit`](crate::ecs::system::SystemBuilder::commit).
    pub fn system<S: System>(&mut self, system: S) -> SystemBuilder<'_> {
        SystemBuilder::new(self, system)
    }

    pub(crate) fn install_system(&mut self, entry: SystemEntry) -> Result<SystemId, ScheduleError> {
        self.schedule.install(entry)
    }

    // ---- frame driver ------------------------------------------------------

    /// Begin a frame: advance the clock, reset cancellation, and reconcile
    /// edits deferred since the last fence.
    pub fn begin_frame(&mut self, dt: f32) -> Result<(), FrameError> {
        self.frame_number += 1;
        self.time += dt as f64;
        self.cancel.reset();
        self.flush()
    }

    /// Run one fixed-timestep tick, then reconcile deferred edits.
    pub fn fixed_update(&mut self, dt: f32) -> Result<(), FrameError> {
        self.run_phase(Phase::Fixed, dt);
        self.flush()
    }

    /// Run the variable-timestep simulation systems. Deferred edits recorded
    /// here land at the next fence.
    pub fn update(&mut self, dt: f32) -> Result<(), FrameError> {
        self.run_phase(Phase::Simulation, dt);
        Ok(())
    }

    /// Run the render systems with the interpolation alpha.
    pub fn render(&mut self, alpha: f32) -> Result<(), FrameError> {
        self.run_phase(Phase::Render, alpha);
        Ok(())
    }

    /// End the frame: reconcile all remaining deferred edits.
    pub fn end_frame(&mut self) -> Result<(), FrameError> {
        self.flush()
    }

    fn run_phase(&mut self, phase: Phase, dt: f32) {
        if self.cancel.is_cancelled() {
            warn!("skipping {phase:?} systems: frame cancelled");
            return;
        }
        // The schedule steps out of the world for the duration so systems can
        // share the world immutably while their own state is mutable.
        let mut schedule = std::mem::take(&mut self.schedule);
        schedule.run_phase(phase, self, dt, self.frame_number);
        self.schedule = schedule;
    }

    /// Split borrows for command playback.
    pub(crate) fn split_mut(&mut self) -> (&mut Entities, &mut Storage, &TypeRegistry) {
        let World {
            entities,
            storage,
            components,
            ..
        } = self;
        (entities, storage, components)
    }
}
