//! Dependency graph construction and layering for one phase's systems.
//!
//! Registration-time pipeline:
//!
//! 1. Build explicit edges from every run-after predecessor and run-before
//!    successor. A reference to a system not registered in the phase, or a
//!    cycle among the explicit edges, aborts registration.
//! 2. Add implicit priority edges: for each pair with no explicit relation in
//!    either direction, the lower-priority system is ordered before the
//!    higher-priority one, so priority breaks ties between otherwise
//!    unrelated systems. Pairs are visited in priority order and an edge is
//!    skipped when a path in the other direction already exists, which keeps
//!    the combined graph acyclic.
//! 3. Compute layers: level `k` holds the systems all of whose predecessors
//!    sit in levels `< k`. Layers execute sequentially; what may run in
//!    parallel inside a layer is decided later by access-conflict batching.

use std::{error::Error, fmt};

use fixedbitset::FixedBitSet;

use crate::ecs::system::SystemId;

/// Registration failures. All are fatal: the builder refuses the system and
/// the schedule is left untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// A system with the same id is already registered.
    DuplicateSystem {
        /// The offending system's diagnostic name.
        name: String,
    },

    /// A run-after / run-before reference names a system that is not
    /// registered in the same phase.
    UnknownSystem {
        /// The system whose dependency list holds the dangling reference.
        referrer: String,
    },

    /// The dependency edges form a cycle.
    Cycle {
        /// Names of the systems left unsorted by the topological pass.
        involved: Vec<String>,
    },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::DuplicateSystem { name } => {
                write!(f, "system '{name}' is already registered")
            }
            ScheduleError::UnknownSystem { referrer } => {
                write!(
                    f,
                    "system '{referrer}' orders against a system that is not registered in its phase"
                )
            }
            ScheduleError::Cycle { involved } => {
                write!(f, "system dependencies form a cycle: {}", involved.join(" -> "))
            }
        }
    }
}

impl Error for ScheduleError {}

/// One node of the phase graph, as seen by the layering pass.
pub(crate) struct GraphNode<'a> {
    pub id: SystemId,
    pub name: &'a str,
    pub priority: i32,
    pub run_after: &'a [SystemId],
    pub run_before: &'a [SystemId],
}

/// Compute the execution layers for one phase.
///
/// Returns the layers as indices into `nodes`, each layer sorted by
/// (priority, registration order).
pub(crate) fn build_layers(nodes: &[GraphNode<'_>]) -> Result<Vec<Vec<usize>>, ScheduleError> {
    let n = nodes.len();
    if n == 0 {
        return Ok(Vec::new());
    }

    // Explicit edges: succs[i] holds every j ordered after i.
    let mut succs: Vec<FixedBitSet> = vec![FixedBitSet::with_capacity(n); n];
    let index_of = |id: SystemId| nodes.iter().position(|node| node.id == id);
    for (i, node) in nodes.iter().enumerate() {
        for after in node.run_after {
            let Some(pred) = index_of(*after) else {
                return Err(ScheduleError::UnknownSystem {
                    referrer: node.name.to_string(),
                });
            };
            succs[pred].insert(i);
        }
        for before in node.run_before {
            let Some(succ) = index_of(*before) else {
                return Err(ScheduleError::UnknownSystem {
                    referrer: node.name.to_string(),
                });
            };
            succs[i].insert(succ);
        }
    }

    // Cycle check on the explicit edges alone: an explicit cycle is a caller
    // bug regardless of priorities.
    detect_cycle(&succs, nodes)?;

    // Transitive reachability, maintained incrementally as implicit edges
    // are added below.
    let mut reach = transitive_closure(&succs);

    // Implicit priority edges between explicitly-unrelated pairs. Visiting
    // pairs in priority order and consulting up-to-date reachability keeps
    // the graph acyclic: an edge is only added when no path exists either way.
    let mut by_priority: Vec<usize> = (0..n).collect();
    by_priority.sort_by_key(|&i| (nodes[i].priority, i));
    for a in 0..n {
        for b in (a + 1)..n {
            let (lo, hi) = (by_priority[a], by_priority[b]);
            if nodes[lo].priority == nodes[hi].priority {
                continue;
            }
            if reach[lo].contains(hi) || reach[hi].contains(lo) {
                continue;
            }
            succs[lo].insert(hi);
            // Everything reaching lo now reaches hi and its successors.
            let mut delta = reach[hi].clone();
            delta.insert(hi);
            reach[lo].union_with(&delta);
            for k in 0..n {
                if reach[k].contains(lo) {
                    let patched = {
                        let mut set = reach[k].clone();
                        set.union_with(&delta);
                        set
                    };
                    reach[k] = patched;
                }
            }
        }
    }

    // Longest-path layering over the combined DAG.
    let mut indegree = vec![0usize; n];
    for succ_set in &succs {
        for j in succ_set.ones() {
            indegree[j] += 1;
        }
    }
    let mut level = vec![0usize; n];
    let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut sorted = 0usize;
    while let Some(i) = ready.pop() {
        sorted += 1;
        for j in succs[i].ones() {
            level[j] = level[j].max(level[i] + 1);
            indegree[j] -= 1;
            if indegree[j] == 0 {
                ready.push(j);
            }
        }
    }
    assert_eq!(sorted, n, "implicit edges must never introduce a cycle");

    let depth = level.iter().copied().max().unwrap_or(0) + 1;
    let mut layers: Vec<Vec<usize>> = vec![Vec::new(); depth];
    for (i, &lvl) in level.iter().enumerate() {
        layers[lvl].push(i);
    }
    for layer in &mut layers {
        layer.sort_by_key(|&i| (nodes[i].priority, i));
    }
    Ok(layers)
}

/// Kahn's algorithm purely for cycle detection; reports the unsortable set.
fn detect_cycle(succs: &[FixedBitSet], nodes: &[GraphNode<'_>]) -> Result<(), ScheduleError> {
    let n = nodes.len();
    let mut indegree = vec![0usize; n];
    for succ_set in succs {
        for j in succ_set.ones() {
            indegree[j] += 1;
        }
    }
    let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut removed = vec![false; n];
    while let Some(i) = ready.pop() {
        removed[i] = true;
        for j in succs[i].ones() {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                ready.push(j);
            }
        }
    }
    if removed.iter().all(|&done| done) {
        return Ok(());
    }
    Err(ScheduleError::Cycle {
        involved: (0..n)
            .filter(|&i| !removed[i])
            .map(|i| nodes[i].name.to_string())
            .collect(),
    })
}

/// Full transitive closure of the explicit edges.
fn transitive_closure(succs: &[FixedBitSet]) -> Vec<FixedBitSet> {
    let n = succs.len();
    let mut reach = succs.to_vec();
    // Propagate until fixpoint; phase graphs are small.
    let mut changed = true;
    while changed {
        changed = false;
        for i in 0..n {
            let mut merged = reach[i].clone();
            for j in reach[i].ones() {
                merged.union_with(&reach[j]);
            }
            if merged != reach[i] {
                reach[i] = merged;
                changed = true;
            }
        }
    }
    reach
}
