//! Component access sets for scheduler conflict analysis.
//!
//! Every system and query declares which component types it reads and which it
//! writes. Two declarations conflict exactly when they cannot be active at
//! the same time under Rust's aliasing rules: any number of readers may share
//! a component, but a writer excludes every other reader and writer of that
//! component. The scheduler uses [`Access::conflicts_with`] to decide which
//! systems inside one layer may run in parallel.
//!
//! Sets are bitsets keyed by the component [`TypeId`] index, so the conflict
//! check on the scheduling hot path is a handful of word operations.

use core::fmt;

use fixedbitset::FixedBitSet;

use crate::ecs::component::TypeId;

/// A declaration of component access: the set read and the set written.
///
/// `In` access contributes to the read set; `Out` and `InOut` access
/// contribute to the write set (a write excludes concurrent readers whether or
/// not the writer also reads).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Access {
    /// Components read (shared access).
    reads: FixedBitSet,

    /// Components written (exclusive access).
    writes: FixedBitSet,
}

impl Access {
    /// An access declaration touching nothing.
    pub const NONE: Self = Self {
        reads: FixedBitSet::new(),
        writes: FixedBitSet::new(),
    };

    /// Create an empty access declaration.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare shared (read-only) access to a component.
    pub fn add_read(&mut self, id: TypeId) {
        let index = id.index();
        self.reads.grow(index + 1);
        self.reads.insert(index);
    }

    /// Declare exclusive (write) access to a component.
    pub fn add_write(&mut self, id: TypeId) {
        let index = id.index();
        self.writes.grow(index + 1);
        self.writes.insert(index);
    }

    /// Merge another declaration into this one.
    pub fn merge(&mut self, other: &Access) {
        self.reads.union_with(&other.reads);
        self.writes.union_with(&other.writes);
    }

    /// Whether this declaration touches no components.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.reads.is_clear() && self.writes.is_clear()
    }

    /// Whether the component is read (including write access, which may read).
    #[inline]
    pub fn reads(&self, id: TypeId) -> bool {
        self.reads.contains(id.index()) || self.writes.contains(id.index())
    }

    /// Whether the component is written.
    #[inline]
    pub fn writes(&self, id: TypeId) -> bool {
        self.writes.contains(id.index())
    }

    /// The number of distinct components written.
    #[inline]
    pub fn write_count(&self) -> usize {
        self.writes.count_ones(..)
    }

    /// The number of distinct components read.
    #[inline]
    pub fn read_count(&self) -> usize {
        self.reads.count_ones(..)
    }

    /// Two declarations conflict when some component they both touch is
    /// written by at least one of them. Conflict-free declarations may be
    /// active concurrently.
    pub fn conflicts_with(&self, other: &Access) -> bool {
        !self.writes.is_disjoint(&other.writes)
            || !self.writes.is_disjoint(&other.reads)
            || !other.writes.is_disjoint(&self.reads)
    }

    /// Whether this declaration covers everything `other` needs: every read
    /// in `other` is readable here, every write in `other` is writable here.
    /// Used to validate that a query run inside a system stays within the
    /// system's declared access.
    pub fn grants(&self, other: &Access) -> bool {
        if !other.writes.is_subset(&self.writes) {
            return false;
        }
        // A declared write also grants the read.
        other
            .reads
            .ones()
            .all(|index| self.reads.contains(index) || self.writes.contains(index))
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reads[{}] writes[{}]",
            self.reads
                .ones()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(","),
            self.writes
                .ones()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}
