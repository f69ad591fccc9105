//! Quarry: a chunked archetype ECS core.
//!
//! Entities are grouped by component composition into archetypes whose data
//! lives in fixed-size structure-of-arrays chunks. Typed queries with
//! declared access modes iterate the matching chunks; structural edits defer
//! through a command buffer reconciled at frame fences; and a dependency-
//! ordered scheduler runs independent systems in parallel on a worker pool.
//!
//! Start at [`ecs::world::World`].

// Allow the derive macros to refer to `::quarry_engine` from within this crate.
extern crate self as quarry_engine;

pub mod ecs;
pub mod tasks;
