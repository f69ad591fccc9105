//! Systems: user logic run by the scheduler.
//!
//! A system is registered once with a stable id (derived from its type), an
//! integer priority (lower runs first), optional run-after / run-before links
//! to other systems, a [`Phase`], and a declared component [`Access`]. The
//! declaration is what the scheduler's conflict analysis sees; queries run
//! through [`SystemState`] are checked against it in debug builds.
//!
//! The callback receives a [`SystemState`]: frame timing, a shared world view
//! for queries and reads, the deferred [`Commands`] handle for structural
//! edits, and the frame's cancellation token.
//!
//! ```ignore
//! struct Movement {
//!     query: Query<(&'static Velocity, &'static mut Position)>,
//! }
//!
//! impl System for Movement {
//!     fn run(&mut self, state: &mut SystemState<'_>) {
//!         let dt = state.dt();
//!         state.for_each(&mut self.query, |_entity, (vel, pos)| {
//!             pos.x += vel.dx * dt;
//!             pos.y += vel.dy * dt;
//!         });
//!     }
//! }
//!
//! world
//!     .system(Movement { query: Query::new() })
//!     .in_phase(Phase::Simulation)
//!     .writes::<Position>()
//!     .reads::<Velocity>()
//!     .commit()?;
//! ```

use std::any::TypeId as StdTypeId;

use crate::ecs::{
    command::Commands,
    component::Component,
    entity::Entity,
    query::{Query, QueryData},
    schedule::{ScheduleError, SystemEntry},
    world::{Access, World},
};

/// A stable system identifier, derived from the system's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemId(StdTypeId);

impl SystemId {
    /// The id for system type `S`.
    #[inline]
    pub fn of<S: 'static>() -> Self {
        Self(StdTypeId::of::<S>())
    }
}

/// Which stage of the frame a system runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Fixed-timestep simulation; may run zero or more times per frame.
    Fixed,
    /// Variable-timestep simulation.
    Simulation,
    /// Render-side extraction and submission.
    Render,
}

/// A user-defined procedure run once per scheduler tick.
///
/// `Send + Sync` because the scheduler may dispatch systems of one batch to
/// worker threads while the world that holds them is shared.
pub trait System: Send + Sync + 'static {
    /// Execute against the current frame.
    fn run(&mut self, state: &mut SystemState<'_>);
}

/// Closures with the right shape are systems.
impl<F> System for F
where
    F: FnMut(&mut SystemState<'_>) + Send + Sync + 'static,
{
    fn run(&mut self, state: &mut SystemState<'_>) {
        self(state);
    }
}

/// The per-run context handed to a system.
pub struct SystemState<'w> {
    dt: f32,
    frame_number: u64,
    world: &'w World,
    access: &'w Access,
}

impl<'w> SystemState<'w> {
    pub(crate) fn new(world: &'w World, access: &'w Access, dt: f32, frame_number: u64) -> Self {
        Self {
            dt,
            frame_number,
            world,
            access,
        }
    }

    /// The timestep for this run: the fixed step in [`Phase::Fixed`], the
    /// frame delta in [`Phase::Simulation`], the interpolation alpha in
    /// [`Phase::Render`].
    #[inline]
    pub fn dt(&self) -> f32 {
        self.dt
    }

    /// The current frame number.
    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// The world, shared. Structural edits are not reachable through this
    /// view; use [`commands`](Self::commands).
    #[inline]
    pub fn world(&self) -> &'w World {
        self.world
    }

    /// The deferred command handle for structural edits.
    #[inline]
    pub fn commands(&self) -> Commands<'w> {
        self.world.commands()
    }

    /// Whether frame cancellation was requested. Long-running systems should
    /// poll this and return early.
    #[inline]
    pub fn cancel_requested(&self) -> bool {
        self.world.cancel_requested()
    }

    /// Run a query. The query's access must stay within the system's declared
    /// access, checked in debug builds; undeclared access in release breaks
    /// the conflict analysis the parallel scheduler relies on.
    ///
    /// Inside the callback, do not reach back through this state for
    /// components the query writes.
    pub fn for_each<D: QueryData>(
        &self,
        query: &mut Query<D>,
        f: impl for<'a> FnMut(Entity, D::Item<'a>),
    ) {
        self.check_granted(query);
        // SAFETY: the scheduler runs conflicting systems sequentially, so no
        // concurrent access to this query's writes exists while we iterate.
        unsafe { query.for_each_shared(self.world, f) };
    }

    /// Run a query chunk-parallel on the world's worker pool. Access rules
    /// are the same as [`for_each`](Self::for_each).
    pub fn par_for_each<D: QueryData>(
        &self,
        query: &mut Query<D>,
        f: impl for<'a> Fn(Entity, D::Item<'a>) + Send + Sync,
    ) {
        self.check_granted(query);
        // SAFETY: as for_each; work items are chunk-disjoint.
        unsafe { query.par_for_each_shared(self.world, &f) };
    }

    /// Read a component of one entity. Requires declared read access in debug
    /// builds.
    pub fn get<C: Component>(&self, entity: Entity) -> Option<&'w C> {
        #[cfg(debug_assertions)]
        {
            if let Some(id) = self.world.components().get::<C>() {
                debug_assert!(
                    self.access.reads(id),
                    "system reads {} without declaring it",
                    std::any::type_name::<C>()
                );
            }
        }
        self.world.get::<C>(entity)
    }

    /// Whether the entity is live.
    pub fn contains(&self, entity: Entity) -> bool {
        self.world.contains(entity)
    }

    #[cfg_attr(not(debug_assertions), allow(unused_variables))]
    fn check_granted<D: QueryData>(&self, query: &mut Query<D>) {
        #[cfg(debug_assertions)]
        {
            let requested = query.access(self.world.components());
            debug_assert!(
                self.access.grants(&requested),
                "query access ({requested}) exceeds the system's declaration ({})",
                self.access
            );
        }
    }
}

/// Builder for registering a system. Commit is atomic: on any error the
/// schedule is left exactly as it was.
pub struct SystemBuilder<'w> {
    world: &'w mut World,
    entry: SystemEntry,
}

impl<'w> SystemBuilder<'w> {
    pub(crate) fn new<S: System>(world: &'w mut World, system: S) -> Self {
        let entry = SystemEntry::new(
            SystemId::of::<S>(),
            std::any::type_name::<S>().to_string(),
            Box::new(system),
        );
        Self { world, entry }
    }

    /// Override the diagnostic name (defaults to the type name).
    pub fn named(mut self, name: &str) -> Self {
        self.entry.name = name.to_string();
        self
    }

    /// Set the priority; lower runs first. Defaults to 0.
    pub fn priority(mut self, priority: i32) -> Self {
        self.entry.priority = priority;
        self
    }

    /// Set the phase. Defaults to [`Phase::Simulation`].
    pub fn in_phase(mut self, phase: Phase) -> Self {
        self.entry.phase = phase;
        self
    }

    /// Order this system after `S` (same phase). `S` must already be
    /// registered when this builder commits.
    pub fn after<S: 'static>(mut self) -> Self {
        self.entry.run_after.push(SystemId::of::<S>());
        self
    }

    /// Order this system before `S` (same phase). `S` must already be
    /// registered when this builder commits.
    pub fn before<S: 'static>(mut self) -> Self {
        self.entry.run_before.push(SystemId::of::<S>());
        self
    }

    /// Declare read access to a component.
    pub fn reads<C: Component>(mut self) -> Self {
        let id = self.world.components().register::<C>();
        self.entry.access.add_read(id);
        self
    }

    /// Declare write access to a component.
    pub fn writes<C: Component>(mut self) -> Self {
        let id = self.world.components().register::<C>();
        self.entry.access.add_write(id);
        self
    }

    /// Declare everything a query data type touches, with its access modes.
    pub fn declares<D: QueryData>(mut self) -> Self {
        D::collect_access(self.world.components(), &mut self.entry.access);
        self
    }

    /// Register the system. Fails on a duplicate id, an unknown run-after /
    /// run-before reference, or a dependency cycle; the schedule is untouched
    /// on failure.
    pub fn commit(self) -> Result<SystemId, ScheduleError> {
        self.world.install_system(self.entry)
    }
}
