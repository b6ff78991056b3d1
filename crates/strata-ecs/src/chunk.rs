//! The fixed chunk arena.
//!
//! A [`ChunkPool`] allocates every chunk it will ever own at construction:
//! one slab of `max_chunks` blocks, each `chunk_bytes` long and 64-byte
//! aligned. Archetypes acquire and release blocks by index; the pool never
//! grows, so exhaustion is an explicit error rather than an allocation.
//!
//! # Safety
//!
//! This module contains `unsafe` code for the slab allocation and raw block
//! pointers. The archetype layer guarantees that every access through
//! [`ChunkPool::block_ptr`] stays inside one acquired block and follows the
//! column layout computed for that block's archetype.

use std::alloc::{self, Layout};

use crate::StoreError;

/// Alignment of every chunk's base address.
pub const CHUNK_ALIGN: usize = 64;

/// Fixed arena of equally sized storage blocks.
pub struct ChunkPool {
    data: *mut u8,
    layout: Layout,
    /// Distance between consecutive blocks; `chunk_bytes` rounded up so every
    /// block base keeps the slab alignment.
    stride: usize,
    chunk_bytes: usize,
    max_chunks: u32,
    /// Free block indices, used as a stack.
    free: Vec<u32>,
}

// The slab is only reached through &self/&mut self on the owning store; the
// archetype layer upholds the aliasing discipline for block contents.
unsafe impl Send for ChunkPool {}
unsafe impl Sync for ChunkPool {}

impl ChunkPool {
    /// Allocate the whole arena up front.
    ///
    /// Panics if the allocator cannot satisfy the slab request; a store that
    /// cannot hold its configured arena cannot run at all.
    pub fn new(max_chunks: u32, chunk_bytes: usize) -> Self {
        assert!(chunk_bytes > 0, "chunk_bytes must be non-zero");
        let stride = chunk_bytes.div_ceil(CHUNK_ALIGN) * CHUNK_ALIGN;
        let total = stride
            .checked_mul(max_chunks as usize)
            .expect("chunk arena size overflows usize");
        let layout = Layout::from_size_align(total.max(CHUNK_ALIGN), CHUNK_ALIGN)
            .expect("invalid chunk arena layout");
        // Safety: layout has non-zero size.
        let data = unsafe { alloc::alloc(layout) };
        if data.is_null() {
            alloc::handle_alloc_error(layout);
        }
        // All blocks start free; pop from the back so low indices go out first.
        let free: Vec<u32> = (0..max_chunks).rev().collect();
        Self {
            data,
            layout,
            stride,
            chunk_bytes,
            max_chunks,
            free,
        }
    }

    /// Take a free block out of the pool.
    pub fn acquire(&mut self) -> Result<u32, StoreError> {
        match self.free.pop() {
            Some(idx) => Ok(idx),
            None => Err(StoreError::ChunkOverflow {
                max: self.max_chunks,
            }),
        }
    }

    /// Return a block to the pool. The caller must not keep pointers into it.
    pub fn release(&mut self, idx: u32) {
        debug_assert!(idx < self.max_chunks);
        debug_assert!(!self.free.contains(&idx), "double release of chunk {idx}");
        self.free.push(idx);
    }

    /// Base pointer of an acquired block.
    #[inline]
    pub(crate) fn block_ptr(&self, idx: u32) -> *mut u8 {
        debug_assert!(idx < self.max_chunks);
        // Safety: idx is in bounds, so the offset stays inside the slab.
        unsafe { self.data.add(idx as usize * self.stride) }
    }

    /// Usable bytes per block.
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    /// Blocks currently in the pool.
    pub fn free_count(&self) -> u32 {
        self.free.len() as u32
    }

    /// Total blocks, free or acquired.
    pub fn capacity(&self) -> u32 {
        self.max_chunks
    }
}

impl Drop for ChunkPool {
    fn drop(&mut self) {
        // Safety: data was allocated with this layout in `new`.
        unsafe { alloc::dealloc(self.data, self.layout) };
    }
}

impl std::fmt::Debug for ChunkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkPool")
            .field("chunk_bytes", &self.chunk_bytes)
            .field("max_chunks", &self.max_chunks)
            .field("free", &self.free.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_roundtrip() {
        let mut pool = ChunkPool::new(4, 1024);
        assert_eq!(pool.free_count(), 4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.free_count(), 2);
        pool.release(a);
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let mut pool = ChunkPool::new(2, 256);
        pool.acquire().unwrap();
        pool.acquire().unwrap();
        assert!(matches!(
            pool.acquire(),
            Err(StoreError::ChunkOverflow { max: 2 })
        ));
        // Releasing makes a block available again.
        pool.release(0);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn blocks_are_aligned_and_disjoint() {
        let mut pool = ChunkPool::new(3, 1000);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let pa = pool.block_ptr(a) as usize;
        let pb = pool.block_ptr(b) as usize;
        assert_eq!(pa % CHUNK_ALIGN, 0);
        assert_eq!(pb % CHUNK_ALIGN, 0);
        assert!(pa.abs_diff(pb) >= 1000);
    }

    #[test]
    fn block_bytes_are_writable() {
        let mut pool = ChunkPool::new(1, 128);
        let idx = pool.acquire().unwrap();
        let ptr = pool.block_ptr(idx);
        unsafe {
            std::ptr::write_bytes(ptr, 0xAB, 128);
            assert_eq!(*ptr, 0xAB);
            assert_eq!(*ptr.add(127), 0xAB);
        }
    }
}
