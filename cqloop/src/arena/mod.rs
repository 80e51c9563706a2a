//! Size-class pooled memory for operation records.
//!
//! Every thread running an engine loop owns one [`PoolResource`]. Records
//! allocated from inside the loop are carved out of power-of-two size
//! classes, between [`SMALLEST_BLOCK_SIZE`] and [`LARGEST_BLOCK_SIZE`]
//! bytes. Freed blocks go back on their class's free list and are reused
//! by the next request of the same class, so a steady stream of
//! schedule/dispatch cycles stops touching the global allocator once the
//! pools have warmed up.
//!
//! Requests above [`LARGEST_BLOCK_SIZE`] are served directly by the global
//! allocator. The resource tracks them until they are deallocated, and
//! frees the ones still outstanding when it is released or dropped.

mod pool;

use pool::Pool;

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::mem;
use std::ptr::NonNull;

/// Strictest fundamental alignment on this platform.
pub const MAX_ALIGN: usize = mem::align_of::<libc::max_align_t>();

/// Size of the smallest size class.
pub const SMALLEST_BLOCK_SIZE: usize = if MAX_ALIGN > 2 * mem::size_of::<usize>() {
    MAX_ALIGN
} else {
    2 * mem::size_of::<usize>()
};

/// Size of the largest size class. Larger requests are not pooled.
pub const LARGEST_BLOCK_SIZE: usize = 4096;

/// Number of size classes between the smallest and the largest block.
pub const POOL_COUNT: usize =
    (LARGEST_BLOCK_SIZE.ilog2() - SMALLEST_BLOCK_SIZE.ilog2()) as usize + 1;

/// Returns the size class serving requests of `size` bytes.
///
/// `size` must not exceed [`LARGEST_BLOCK_SIZE`].
pub fn pool_index(size: usize) -> usize {
    let size = size.max(SMALLEST_BLOCK_SIZE);
    let ceil_log2 = size.next_power_of_two().ilog2();

    (ceil_log2 - SMALLEST_BLOCK_SIZE.ilog2()) as usize
}

/// Returns the block size of the size class at `index`.
pub fn block_size_of(index: usize) -> usize {
    SMALLEST_BLOCK_SIZE << index
}

/// Returns `true` if a record with `layout` can live in a pooled block.
pub(crate) fn is_poolable(layout: Layout) -> bool {
    layout.align() <= MAX_ALIGN && layout.size() <= LARGEST_BLOCK_SIZE
}

/// Snapshot of a [`PoolResource`]'s bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Free blocks per size class.
    pub free_blocks: [usize; POOL_COUNT],

    /// Chunks allocated per size class.
    pub chunks: [usize; POOL_COUNT],

    /// Oversized allocations not yet returned.
    pub oversized_outstanding: usize,
}

impl PoolStats {
    /// Total chunks across all size classes.
    pub fn total_chunks(&self) -> usize {
        self.chunks.iter().sum()
    }
}

/// A per-thread arena of size-class pools.
///
/// Not thread-safe: a resource is used by one thread at a time and handed
/// between threads only as a whole.
///
/// # Example
///
/// ```rust
/// use cqloop::arena::PoolResource;
///
/// let mut resource = PoolResource::new();
///
/// let block = resource.allocate(48);
/// unsafe { resource.deallocate(block, 48) };
///
/// // The same block is reused for the next request of its class.
/// assert_eq!(resource.allocate(40), block);
/// # unsafe { resource.deallocate(block, 40) };
/// ```
pub struct PoolResource {
    pools: [Pool; POOL_COUNT],
    oversized: HashMap<NonNull<u8>, Layout>,
}

// Blocks are plain memory; the resource never shares them across threads
// while it is in use.
unsafe impl Send for PoolResource {}

impl PoolResource {
    pub fn new() -> Self {
        Self {
            pools: [const { Pool::new() }; POOL_COUNT],
            oversized: HashMap::new(),
        }
    }

    /// Allocates a block of at least `size` bytes, aligned to
    /// [`MAX_ALIGN`].
    pub fn allocate(&mut self, size: usize) -> NonNull<u8> {
        if size > LARGEST_BLOCK_SIZE {
            return self.allocate_oversized(size);
        }

        let index = pool_index(size);
        let pool = &mut self.pools[index];

        if let Some(block) = pool.allocate_block() {
            return block;
        }

        pool.replenish(block_size_of(index));

        match pool.allocate_block() {
            Some(block) => block,
            None => unreachable!("a replenished pool has at least one free block"),
        }
    }

    /// Returns a block obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this resource with the same
    /// `size`, and must not be used afterwards.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        if size > LARGEST_BLOCK_SIZE {
            if let Some(layout) = self.oversized.remove(&ptr) {
                debug_assert_eq!(layout.size(), size);
                unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
            }
            return;
        }

        unsafe { self.pools[pool_index(size)].deallocate_block(ptr) };
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            free_blocks: std::array::from_fn(|i| self.pools[i].free_len()),
            chunks: std::array::from_fn(|i| self.pools[i].chunk_count()),
            oversized_outstanding: self.oversized.len(),
        }
    }

    /// Frees every chunk of every pool and every oversized block.
    ///
    /// Blocks still handed out become dangling.
    pub fn release(&mut self) {
        for pool in &mut self.pools {
            pool.release();
        }

        for (ptr, layout) in self.oversized.drain() {
            unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }

    fn allocate_oversized(&mut self, size: usize) -> NonNull<u8> {
        let layout = oversized_layout(size);

        let ptr = match NonNull::new(unsafe { alloc::alloc(layout) }) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };

        self.oversized.insert(ptr, layout);
        ptr
    }

    #[cfg(test)]
    fn next_blocks_per_chunk(&self, index: usize) -> usize {
        self.pools[index].next_blocks_per_chunk()
    }
}

impl Drop for PoolResource {
    fn drop(&mut self) {
        self.release();
    }
}

impl Default for PoolResource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PoolResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolResource")
            .field("stats", &self.stats())
            .finish()
    }
}

fn oversized_layout(size: usize) -> Layout {
    match Layout::from_size_align(size, MAX_ALIGN) {
        Ok(layout) => layout,
        Err(_) => panic!("oversized allocation of {size} bytes overflows"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn size_class_bounds() {
        assert!(SMALLEST_BLOCK_SIZE.is_power_of_two());
        assert!(SMALLEST_BLOCK_SIZE >= MAX_ALIGN);
        assert!(SMALLEST_BLOCK_SIZE >= 2 * mem::size_of::<usize>());

        assert_eq!(pool_index(0), 0);
        assert_eq!(pool_index(1), 0);
        assert_eq!(pool_index(SMALLEST_BLOCK_SIZE), 0);
        assert_eq!(pool_index(SMALLEST_BLOCK_SIZE + 1), 1);
        assert_eq!(pool_index(LARGEST_BLOCK_SIZE), POOL_COUNT - 1);
        assert_eq!(block_size_of(POOL_COUNT - 1), LARGEST_BLOCK_SIZE);
    }

    #[test]
    fn poolable_layouts() {
        assert!(is_poolable(Layout::new::<[u64; 4]>()));
        assert!(!is_poolable(
            Layout::from_size_align(LARGEST_BLOCK_SIZE + 1, 8).unwrap()
        ));
        assert!(!is_poolable(
            Layout::from_size_align(64, MAX_ALIGN * 2).unwrap()
        ));
    }

    #[test]
    fn blocks_are_reused() {
        let mut resource = PoolResource::new();

        let a = resource.allocate(24);
        unsafe { resource.deallocate(a, 24) };
        let b = resource.allocate(24);

        assert_eq!(a, b);
        unsafe { resource.deallocate(b, 24) };
    }

    /// One request per size class plus one oversized request.
    fn every_class() -> Vec<usize> {
        (0..POOL_COUNT)
            .map(block_size_of)
            .chain([LARGEST_BLOCK_SIZE + 1])
            .collect()
    }

    fn cycle(resource: &mut PoolResource, sizes: &[usize]) {
        let blocks: Vec<_> = sizes.iter().map(|&size| resource.allocate(size)).collect();

        for (block, &size) in blocks.into_iter().zip(sizes) {
            unsafe { resource.deallocate(block, size) };
        }
    }

    #[test]
    fn steady_cycles_stop_allocating_chunks() {
        let mut resource = PoolResource::new();
        let sizes = every_class();

        cycle(&mut resource, &sizes);
        let baseline = resource.stats();
        assert_eq!(baseline.oversized_outstanding, 0);
        assert!(baseline.chunks.iter().all(|&chunks| chunks == 1));

        for _ in 0..10_000 {
            cycle(&mut resource, &sizes);
        }

        assert_eq!(resource.stats(), baseline);
    }

    #[test]
    fn chunk_growth_doubles_up_to_cap() {
        let mut resource = PoolResource::new();
        let index = pool_index(64);
        let mut held = Vec::new();

        let mut expected = 1;
        for _ in 0..8 {
            assert_eq!(resource.next_blocks_per_chunk(index), expected);

            // Exhaust the current free list so the next request replenishes.
            let chunks = resource.stats().chunks[index];
            loop {
                held.push(resource.allocate(64));
                if resource.stats().chunks[index] > chunks {
                    break;
                }
            }

            expected = (expected * 2).min(32);
        }

        assert_eq!(resource.next_blocks_per_chunk(index), 32);

        for block in held {
            unsafe { resource.deallocate(block, 64) };
        }
    }

    #[test]
    fn oversized_requests_bypass_pools() {
        let mut resource = PoolResource::new();

        let big = resource.allocate(LARGEST_BLOCK_SIZE + 1);
        assert_eq!(big.as_ptr() as usize % MAX_ALIGN, 0);

        let stats = resource.stats();
        assert_eq!(stats.oversized_outstanding, 1);
        assert_eq!(stats.total_chunks(), 0);

        unsafe { resource.deallocate(big, LARGEST_BLOCK_SIZE + 1) };
        assert_eq!(resource.stats().oversized_outstanding, 0);
    }

    #[test]
    fn release_frees_outstanding_oversized_blocks() {
        let mut resource = PoolResource::new();

        resource.allocate(LARGEST_BLOCK_SIZE + 1);
        resource.allocate(3 * LARGEST_BLOCK_SIZE);
        resource.allocate(64);
        assert_eq!(resource.stats().oversized_outstanding, 2);

        resource.release();

        let stats = resource.stats();
        assert_eq!(stats.oversized_outstanding, 0);
        assert_eq!(stats.total_chunks(), 0);

        // Dropping a resource with oversized blocks out frees them too.
        let mut dropped = PoolResource::new();
        dropped.allocate(2 * LARGEST_BLOCK_SIZE);
        drop(dropped);
    }

    proptest! {
        #[test]
        fn blocks_fit_and_are_aligned(size in 1usize..=LARGEST_BLOCK_SIZE) {
            let index = pool_index(size);

            prop_assert!(block_size_of(index) >= size);
            if index > 0 {
                prop_assert!(block_size_of(index - 1) < size);
            }

            let mut resource = PoolResource::new();
            let block = resource.allocate(size);

            prop_assert_eq!(block.as_ptr() as usize % MAX_ALIGN, 0);

            // The whole block is writable.
            unsafe { block.as_ptr().write_bytes(0xA5, block_size_of(index)) };
            unsafe { resource.deallocate(block, size) };

            prop_assert_eq!(resource.stats().free_blocks[index], 1);
        }
    }
}
