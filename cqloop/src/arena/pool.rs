use super::MAX_ALIGN;

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Blocks carved out of the first chunk of a pool.
const MIN_BLOCKS_PER_CHUNK: usize = 1;

/// Upper bound for the doubling chunk growth.
const MAX_BLOCKS_PER_CHUNK: usize = 32;

/// A free block, reusing the block's own storage as the list link.
struct FreeEntry {
    next: Option<NonNull<FreeEntry>>,
}

/// A single size class: a free list plus the chunks backing it.
///
/// Chunks are only returned to the global allocator when the pool is
/// released. Blocks handed out by [`allocate_block`](Self::allocate_block)
/// must come back through [`deallocate_block`](Self::deallocate_block) of
/// the same size class.
pub(crate) struct Pool {
    /// Head of the free list.
    free: Option<NonNull<FreeEntry>>,

    /// Number of entries on the free list.
    free_len: usize,

    /// Every chunk allocated by this pool, with its layout.
    chunks: Vec<(NonNull<u8>, Layout)>,

    /// Block count of the next chunk.
    next_blocks_per_chunk: usize,
}

impl Pool {
    pub(crate) const fn new() -> Self {
        Self {
            free: None,
            free_len: 0,
            chunks: Vec::new(),
            next_blocks_per_chunk: MIN_BLOCKS_PER_CHUNK,
        }
    }

    /// Pops a block from the free list, if any.
    pub(crate) fn allocate_block(&mut self) -> Option<NonNull<u8>> {
        let entry = self.free?;

        self.free = unsafe { (*entry.as_ptr()).next };
        self.free_len -= 1;

        Some(entry.cast())
    }

    /// Pushes a block back onto the free list.
    ///
    /// # Safety
    ///
    /// `block` must have been handed out by this pool and not be in use.
    pub(crate) unsafe fn deallocate_block(&mut self, block: NonNull<u8>) {
        let entry = block.cast::<FreeEntry>();

        unsafe { entry.as_ptr().write(FreeEntry { next: self.free }) };
        self.free = Some(entry);
        self.free_len += 1;
    }

    /// Allocates a new chunk and threads its blocks onto the free list.
    ///
    /// `block_size` is a multiple of [`MAX_ALIGN`], so every block in the
    /// chunk is suitably aligned.
    pub(crate) fn replenish(&mut self, block_size: usize) {
        let blocks = self.next_blocks_per_chunk;

        let layout = match Layout::from_size_align(blocks * block_size, MAX_ALIGN) {
            Ok(layout) => layout,
            Err(_) => panic!("pool chunk layout overflow"),
        };

        let chunk = match NonNull::new(unsafe { alloc::alloc(layout) }) {
            Some(chunk) => chunk,
            None => alloc::handle_alloc_error(layout),
        };

        for i in 0..blocks {
            let block = unsafe { NonNull::new_unchecked(chunk.as_ptr().add(i * block_size)) };
            unsafe { self.deallocate_block(block) };
        }

        self.chunks.push((chunk, layout));
        self.next_blocks_per_chunk = if blocks > MAX_BLOCKS_PER_CHUNK / 2 {
            MAX_BLOCKS_PER_CHUNK
        } else {
            blocks * 2
        };

        tracing::trace!(block_size, blocks, "pool replenished");
    }

    /// Frees every chunk and resets the growth schedule.
    pub(crate) fn release(&mut self) {
        self.free = None;
        self.free_len = 0;

        for (chunk, layout) in self.chunks.drain(..) {
            unsafe { alloc::dealloc(chunk.as_ptr(), layout) };
        }

        self.next_blocks_per_chunk = MIN_BLOCKS_PER_CHUNK;
    }

    pub(crate) fn free_len(&self) -> usize {
        self.free_len
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub(crate) fn next_blocks_per_chunk(&self) -> usize {
        self.next_blocks_per_chunk
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.release();
    }
}
