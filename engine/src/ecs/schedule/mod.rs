//! The system scheduler.
//!
//! Systems register into per-[`Phase`] dependency graphs. At commit the
//! phase's plan is rebuilt: topological layers from the explicit and implicit
//! (priority) edges, then each layer partitioned into **batches** by declared
//! access: two systems share a batch only when every component both touch is
//! only read by both. Batches inside a layer run in parallel on the worker
//! pool; conflicting systems fall into later batches and run sequentially in
//! priority order. Across layers execution is always sequential.
//!
//! Structural edits during a system's run go to the command buffer; the frame
//! driver flushes it at the frame fences, never mid-phase, so storage is
//! consistent at every layer boundary.

mod graph;

pub use graph::ScheduleError;

use log::debug;

use crate::ecs::{
    schedule::graph::GraphNode,
    system::{Phase, System, SystemId, SystemState},
    world::{Access, World},
};

/// One registered system with its scheduling metadata.
pub(crate) struct SystemEntry {
    pub(crate) id: SystemId,
    pub(crate) name: String,
    pub(crate) priority: i32,
    pub(crate) run_after: Vec<SystemId>,
    pub(crate) run_before: Vec<SystemId>,
    pub(crate) phase: Phase,
    pub(crate) access: Access,
    pub(crate) system: Box<dyn System>,
}

impl SystemEntry {
    pub(crate) fn new(id: SystemId, name: String, system: Box<dyn System>) -> Self {
        Self {
            id,
            name,
            priority: 0,
            run_after: Vec::new(),
            run_before: Vec::new(),
            phase: Phase::Simulation,
            access: Access::new(),
            system,
        }
    }
}

/// A phase's compiled execution plan: layers of conflict-free batches holding
/// indices into the schedule's entry list.
#[derive(Debug, Default, Clone)]
struct Plan {
    layers: Vec<Vec<Vec<usize>>>,
}

fn phase_index(phase: Phase) -> usize {
    match phase {
        Phase::Fixed => 0,
        Phase::Simulation => 1,
        Phase::Render => 2,
    }
}

/// The registered systems and their per-phase plans.
#[derive(Default)]
pub struct Schedule {
    entries: Vec<SystemEntry>,
    plans: [Plan; 3],
}

impl Schedule {
    /// Create an empty schedule.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of registered systems across all phases.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no systems are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a system id is registered.
    pub fn contains(&self, id: SystemId) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    /// Register a system entry, rebuilding its phase's plan.
    ///
    /// Atomic: on any error the entry is discarded and the existing plans are
    /// untouched.
    pub(crate) fn install(&mut self, entry: SystemEntry) -> Result<SystemId, ScheduleError> {
        if self.contains(entry.id) {
            return Err(ScheduleError::DuplicateSystem {
                name: entry.name.clone(),
            });
        }

        // Validate and build the new plan against a candidate entry list
        // before mutating anything.
        let phase = entry.phase;
        let candidate_index = self.entries.len();
        let plan = {
            let mut members: Vec<(usize, &SystemEntry)> = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.phase == phase)
                .collect();
            members.push((candidate_index, &entry));
            build_plan(&members)?
        };

        let id = entry.id;
        debug!(
            "registered system '{}' in {:?} ({} total)",
            entry.name,
            phase,
            self.entries.len() + 1
        );
        self.entries.push(entry);
        self.plans[phase_index(phase)] = plan;
        Ok(id)
    }

    /// Run one phase's systems against the world.
    ///
    /// The world reference is shared: systems reach component data through
    /// queries whose isolation the batching already proved, and structural
    /// edits go to the command buffer.
    pub(crate) fn run_phase(&mut self, phase: Phase, world: &World, dt: f32, frame_number: u64) {
        let plan = self.plans[phase_index(phase)].clone();
        for layer in &plan.layers {
            for batch in layer {
                match world.executor() {
                    Some(executor) if batch.len() > 1 => {
                        // Entries in one batch are access-disjoint, so the
                        // systems may run concurrently. Raw pointers give the
                        // workers zero-copy access to distinct entries.
                        let base = self.entries.as_mut_ptr();
                        executor.scope(|scope| {
                            for &index in batch {
                                // SAFETY: batch indices are unique, so each
                                // worker gets exclusive access to its entry;
                                // the scope joins before `entries` moves.
                                let slot = SystemPtr(unsafe { base.add(index) });
                                scope.spawn(move || {
                                    let slot = slot;
                                    let entry = unsafe { &mut *slot.0 };
                                    let SystemEntry { access, system, .. } = entry;
                                    let mut state =
                                        SystemState::new(world, access, dt, frame_number);
                                    system.run(&mut state);
                                });
                            }
                        });
                    }
                    _ => {
                        for &index in batch {
                            let entry = &mut self.entries[index];
                            let SystemEntry { access, system, .. } = entry;
                            let mut state = SystemState::new(world, access, dt, frame_number);
                            system.run(&mut state);
                        }
                    }
                }
            }
        }
    }
}

/// Build a phase plan from `(global index, entry)` pairs.
fn build_plan(members: &[(usize, &SystemEntry)]) -> Result<Plan, ScheduleError> {
    let nodes: Vec<GraphNode<'_>> = members
        .iter()
        .map(|(_, entry)| GraphNode {
            id: entry.id,
            name: &entry.name,
            priority: entry.priority,
            run_after: &entry.run_after,
            run_before: &entry.run_before,
        })
        .collect();
    let layers = graph::build_layers(&nodes)?;

    let plan_layers = layers
        .into_iter()
        .map(|layer| batch_layer(&layer, members))
        .collect();
    Ok(Plan {
        layers: plan_layers,
    })
}

/// Partition one layer (local indices, priority-ordered) into conflict-free
/// batches of global entry indices.
///
/// Greedy: each system joins the first batch it conflicts with nobody in,
/// otherwise opens a new batch. Scanning in priority order means conflicting
/// systems end up in batch order matching their priorities.
fn batch_layer(layer: &[usize], members: &[(usize, &SystemEntry)]) -> Vec<Vec<usize>> {
    let mut batches: Vec<(Vec<usize>, Access)> = Vec::new();
    for &local in layer {
        let (global, entry) = members[local];
        match batches
            .iter_mut()
            .find(|(_, merged)| !merged.conflicts_with(&entry.access))
        {
            Some((batch, merged)) => {
                batch.push(global);
                merged.merge(&entry.access);
            }
            None => batches.push((vec![global], entry.access.clone())),
        }
    }
    batches.into_iter().map(|(batch, _)| batch).collect()
}

/// A Send-safe wrapper around a system entry pointer for parallel dispatch.
///
/// Sound because the scheduler guarantees each batch index is dispatched to
/// exactly one worker and the scope joins before the entries vector is
/// touched again.
struct SystemPtr(*mut SystemEntry);

// SAFETY: see the type docs; exclusive per-entry access is scheduler-enforced.
unsafe impl Send for SystemPtr {}
