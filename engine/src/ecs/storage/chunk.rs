//! Fixed-size chunk blocks and their pool.
//!
//! Every archetype stores its entities in chunks: single contiguous
//! allocations of one fixed size (16 KiB by default, overridable once per
//! world). The pool hands blocks to archetypes on demand and recycles freed
//! ones instead of returning them to the allocator. No locking: structural
//! edits, and therefore all pool traffic, happen only on the frame driver
//! thread during reconciliation.

use std::{alloc, alloc::Layout, ptr::NonNull};

use crate::ecs::storage::StorageError;

/// The default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Alignment of every chunk block. Caps the alignment a component type may
/// require, since component arrays are placed at offsets from the block base.
pub(crate) const CHUNK_ALIGN: usize = 64;

/// An owned chunk allocation. Deallocates itself when dropped, so blocks that
/// never return to the pool (archetype teardown) are still reclaimed.
pub struct ChunkBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl ChunkBlock {
    /// The base pointer of the block.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }
}

impl Drop for ChunkBlock {
    fn drop(&mut self) {
        // SAFETY: allocated with this layout by the pool.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: the block is a uniquely-owned raw allocation; access to its contents
// is synchronized by the storage layer (quiescent outside system execution,
// chunk-disjoint within it).
unsafe impl Send for ChunkBlock {}
unsafe impl Sync for ChunkBlock {}

/// Allocates and recycles fixed-size chunk blocks.
pub struct ChunkPool {
    /// The layout shared by every block this pool hands out.
    layout: Layout,

    /// Freed blocks awaiting reuse.
    free: Vec<ChunkBlock>,

    /// Blocks handed out and not yet released, for diagnostics.
    outstanding: usize,
}

impl ChunkPool {
    /// Create a pool producing blocks of `chunk_size` bytes.
    ///
    /// # Panics
    /// Panics if `chunk_size` is smaller than 1 KiB; a chunk must at least fit
    /// a useful number of identity entries.
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size >= 1024, "chunk size must be at least 1 KiB");
        let layout = Layout::from_size_align(chunk_size, CHUNK_ALIGN)
            .expect("chunk size does not form a valid layout");
        Self {
            layout,
            free: Vec::new(),
            outstanding: 0,
        }
    }

    /// The size in bytes of every block this pool produces.
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.layout.size()
    }

    /// Acquire a block. The whole block, identity region included, reads as
    /// zeroes. Component payload bytes are meaningless until a slot is counted
    /// in.
    pub fn acquire(&mut self) -> Result<ChunkBlock, StorageError> {
        let block = match self.free.pop() {
            Some(block) => {
                // Recycled blocks still hold the previous tenant's bytes.
                // SAFETY: the block spans `layout.size()` writable bytes.
                unsafe {
                    std::ptr::write_bytes(block.ptr.as_ptr(), 0, self.layout.size());
                }
                block
            }
            None => {
                // SAFETY: layout has non-zero size.
                let raw = unsafe { alloc::alloc_zeroed(self.layout) };
                let Some(ptr) = NonNull::new(raw) else {
                    // Allocation failure propagates to the frame driver rather
                    // than aborting; storage stays consistent.
                    return Err(StorageError::OutOfMemory);
                };
                ChunkBlock {
                    ptr,
                    layout: self.layout,
                }
            }
        };
        self.outstanding += 1;
        Ok(block)
    }

    /// Return a block to the free list without deallocating it.
    pub fn release(&mut self, block: ChunkBlock) {
        debug_assert_eq!(block.layout, self.layout, "block returned to wrong pool");
        self.outstanding = self.outstanding.saturating_sub(1);
        self.free.push(block);
    }

    /// The number of blocks currently handed out.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// The number of blocks waiting on the free list.
    #[inline]
    pub fn pooled(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_zeroed_blocks() {
        // Given
        let mut pool = ChunkPool::new(DEFAULT_CHUNK_SIZE);

        // When
        let block = pool.acquire().unwrap();

        // Then
        let bytes = unsafe {
            std::slice::from_raw_parts(block.as_ptr().as_ptr(), DEFAULT_CHUNK_SIZE)
        };
        assert!(bytes.iter().all(|&b| b == 0));
        pool.release(block);
    }

    #[test]
    fn released_blocks_are_recycled_and_rezeroed() {
        // Given
        let mut pool = ChunkPool::new(DEFAULT_CHUNK_SIZE);
        let block = pool.acquire().unwrap();
        let original = block.as_ptr().as_ptr();

        // When - dirty the block and return it
        unsafe { std::ptr::write_bytes(original, 0xAB, DEFAULT_CHUNK_SIZE) };
        pool.release(block);
        assert_eq!(pool.pooled(), 1);
        let reused = pool.acquire().unwrap();

        // Then - same allocation, scrubbed contents
        assert_eq!(reused.as_ptr().as_ptr(), original);
        let bytes =
            unsafe { std::slice::from_raw_parts(reused.as_ptr().as_ptr(), DEFAULT_CHUNK_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
        pool.release(reused);
    }

    #[test]
    fn outstanding_tracks_handouts() {
        let mut pool = ChunkPool::new(DEFAULT_CHUNK_SIZE);
        assert_eq!(pool.outstanding(), 0);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.outstanding(), 2);

        pool.release(a);
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.pooled(), 1);
        pool.release(b);
    }

    #[test]
    fn custom_chunk_size() {
        let mut pool = ChunkPool::new(4096);
        assert_eq!(pool.chunk_size(), 4096);
        let block = pool.acquire().unwrap();
        pool.release(block);
    }

    #[test]
    #[should_panic(expected = "at least 1 KiB")]
    fn tiny_chunk_size_rejected() {
        let _ = ChunkPool::new(64);
    }
}
