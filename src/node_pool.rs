//! Fixed-size-node sub-allocator drawing its backing storage from a
//! [`BuddyAllocator`](crate::buddy::BuddyAllocator).
//!
//! Grounded on the teacher's slab cache (`mm::kernel_heap::SlabCache`):
//! one block header per backing block, a singly-linked in-block free
//! list, and a bump cursor used to carve fresh nodes out of a block
//! before anything is ever freed back into it. Each block keeps its own
//! free list and live-node count, same as the teacher's per-slab free
//! list, and a circular doubly-linked list of blocks lets both `delete`
//! walk every block exactly once and `free` find and release a block
//! that has gone entirely empty back to the buddy allocator (unless it
//! is the pool's last remaining block).

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::buddy::BuddyAllocator;
use crate::error::PoolError;

#[repr(C)]
struct BlockHeader {
    next: *mut BlockHeader,
    prev: *mut BlockHeader,
    free_list: *mut u8,
    live_count: usize,
}

#[inline]
unsafe fn block_header_of(ptr: *mut u8, block_size: usize) -> *mut BlockHeader {
    let mask = !(block_size - 1);
    ((ptr as usize) & mask) as *mut BlockHeader
}

/// Read-only snapshot for diagnostics, analogous to the teacher's
/// `print_heap_stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub live_nodes: usize,
    pub block_count: usize,
    pub fresh_remaining: usize,
}

/// A fixed-size-node allocator for `T`, backed by a shared buddy
/// allocator. One `Pool` owns zero or more power-of-two blocks, each
/// subdivided into same-sized node slots.
pub struct Pool<T> {
    buddy: Arc<BuddyAllocator>,
    node_size: usize,
    block_size: usize,
    blocks: *mut BlockHeader,      // circular doubly-linked list, this is "the" anchor
    fresh_block: *mut BlockHeader, // block the bump cursor below is carving from
    fresh_ptr: *mut u8,
    fresh_end: *mut u8,
    live_nodes: usize,
    _marker: PhantomData<T>,
}

// SAFETY: all raw-pointer state is only ever touched through `&mut self`
// methods; the pool itself carries no interior mutability.
unsafe impl<T: Send> Send for Pool<T> {}

impl<T> Pool<T> {
    /// `block_size` must be a power of two the backing buddy allocator
    /// can supply and must fit at least one node plus the block header.
    pub fn new(buddy: Arc<BuddyAllocator>, block_size: usize) -> Result<Self, PoolError> {
        let node_size = std::mem::size_of::<T>().max(std::mem::size_of::<*mut u8>());
        if !block_size.is_power_of_two()
            || block_size <= std::mem::size_of::<BlockHeader>() + node_size
        {
            return Err(PoolError::InvalidConfig);
        }
        Ok(Self {
            buddy,
            node_size,
            block_size,
            blocks: std::ptr::null_mut(),
            fresh_block: std::ptr::null_mut(),
            fresh_ptr: std::ptr::null_mut(),
            fresh_end: std::ptr::null_mut(),
            live_nodes: 0,
            _marker: PhantomData,
        })
    }

    pub fn live_nodes(&self) -> usize {
        self.live_nodes
    }

    pub fn stats(&self) -> PoolStats {
        let mut block_count = 0;
        if !self.blocks.is_null() {
            let start = self.blocks;
            let mut cur = start;
            loop {
                block_count += 1;
                let next = unsafe { (*cur).next };
                if next == start {
                    break;
                }
                cur = next;
            }
        }
        let fresh_remaining = if self.fresh_ptr.is_null() {
            0
        } else {
            (self.fresh_end as usize - self.fresh_ptr as usize) / self.node_size
        };
        PoolStats {
            live_nodes: self.live_nodes,
            block_count,
            fresh_remaining,
        }
    }

    pub fn alloc(&mut self) -> Result<NonNull<T>, PoolError> {
        if let Some(ptr) = self.pop_any_free_list() {
            self.live_nodes += 1;
            return Ok(ptr.cast());
        }
        if self.fresh_ptr.is_null() || self.fresh_ptr >= self.fresh_end {
            self.acquire_block()?;
        }
        let ptr = self.fresh_ptr;
        self.fresh_ptr = unsafe { self.fresh_ptr.add(self.node_size) };
        unsafe { (*self.fresh_block).live_count += 1 };
        self.live_nodes += 1;
        Ok(unsafe { NonNull::new_unchecked(ptr as *mut T) })
    }

    pub fn free(&mut self, ptr: NonNull<T>) {
        let raw = ptr.as_ptr() as *mut u8;
        let header = unsafe { block_header_of(raw, self.block_size) };
        #[cfg(debug_assertions)]
        unsafe {
            debug_assert!(!(*header).next.is_null(), "free of node outside any owned block");
        }
        unsafe {
            *(raw as *mut *mut u8) = (*header).free_list;
            (*header).free_list = raw;
            (*header).live_count -= 1;
        }
        self.live_nodes -= 1;

        let sole_block = unsafe { (*header).next == header };
        if unsafe { (*header).live_count == 0 } && !sole_block {
            self.release_block(header);
        }
    }

    /// Detaches `header` from the block list and hands it back to the
    /// buddy allocator. Per spec: a block that has gone entirely free is
    /// released unless it is the pool's sole remaining block.
    fn release_block(&mut self, header: *mut BlockHeader) {
        unsafe {
            let (prev, next) = ((*header).prev, (*header).next);
            (*prev).next = next;
            (*next).prev = prev;
            if self.blocks == header {
                self.blocks = next;
            }
            if self.fresh_block == header {
                self.fresh_block = std::ptr::null_mut();
                self.fresh_ptr = std::ptr::null_mut();
                self.fresh_end = std::ptr::null_mut();
            }
            let owned = NonNull::new_unchecked(header as *mut u8);
            self.buddy.free(owned, self.block_size);
        }
    }

    /// Releases every free node and resets the bump cursor, but keeps the
    /// backing blocks — analogous to the radix tree's `MemoryMode::Compact`
    /// clear, which wants to reuse block storage without returning it to
    /// the buddy allocator.
    pub fn clear(&mut self) {
        self.fresh_ptr = std::ptr::null_mut();
        self.fresh_end = std::ptr::null_mut();
        self.fresh_block = std::ptr::null_mut();
        self.live_nodes = 0;
        if !self.blocks.is_null() {
            let start = self.blocks;
            let mut cur = start;
            loop {
                unsafe {
                    (*cur).free_list = std::ptr::null_mut();
                    (*cur).live_count = 0;
                }
                let next = unsafe { (*cur).next };
                if next == start {
                    break;
                }
                cur = next;
            }
            let data_start = self.data_start();
            unsafe {
                self.fresh_ptr = (self.blocks as *mut u8).add(data_start);
                self.fresh_end = (self.blocks as *mut u8).add(self.block_size);
            }
            self.fresh_block = self.blocks;
        }
    }

    /// Releases every backing block to the buddy allocator. The pool is
    /// empty and ready to reuse afterward.
    pub fn delete(&mut self) {
        if self.blocks.is_null() {
            self.fresh_ptr = std::ptr::null_mut();
            self.fresh_end = std::ptr::null_mut();
            self.live_nodes = 0;
            return;
        }
        let start = self.blocks;
        let mut cur = start;
        loop {
            let next = unsafe { (*cur).next };
            let ptr = unsafe { NonNull::new_unchecked(cur as *mut u8) };
            self.buddy.free(ptr, self.block_size);
            if next == start {
                break;
            }
            cur = next;
        }
        self.blocks = std::ptr::null_mut();
        self.fresh_block = std::ptr::null_mut();
        self.fresh_ptr = std::ptr::null_mut();
        self.fresh_end = std::ptr::null_mut();
        self.live_nodes = 0;
    }

    /// Pops a free slot from whichever block currently has one, starting
    /// the search at the most recently acquired block since that is the
    /// block most likely to have just had a node freed back into it.
    fn pop_any_free_list(&mut self) -> Option<NonNull<u8>> {
        let start = self.fresh_block;
        if start.is_null() {
            return None;
        }
        let mut cur = start;
        loop {
            let head = unsafe { (*cur).free_list };
            if !head.is_null() {
                unsafe { (*cur).free_list = *(head as *mut *mut u8) };
                return NonNull::new(head);
            }
            cur = unsafe { (*cur).prev };
            if cur == start {
                return None;
            }
        }
    }

    fn acquire_block(&mut self) -> Result<(), PoolError> {
        let raw = self.buddy.alloc(self.block_size).ok_or_else(|| {
            log::warn!(
                "node pool: buddy allocator refused a {}-byte block (node_size={})",
                self.block_size,
                self.node_size
            );
            PoolError::OutOfMemory
        })?;
        let header = raw.as_ptr() as *mut BlockHeader;
        unsafe {
            (*header).free_list = std::ptr::null_mut();
            (*header).live_count = 0;
        }

        if self.blocks.is_null() {
            unsafe {
                (*header).next = header;
                (*header).prev = header;
            }
            self.blocks = header;
        } else {
            unsafe {
                let head = self.blocks;
                let tail = (*head).prev;
                (*tail).next = header;
                (*header).prev = tail;
                (*header).next = head;
                (*head).prev = header;
            }
        }

        unsafe {
            self.fresh_ptr = raw.as_ptr().add(self.data_start());
            self.fresh_end = raw.as_ptr().add(self.block_size);
        }
        self.fresh_block = header;
        Ok(())
    }

    /// Offset of the first node slot within a block. Rounded up to
    /// `node_size` when it is a power of two, so that every slot in a
    /// block lands on a `node_size`-aligned absolute address relative to
    /// the block's own `block_size` alignment — callers such as
    /// [`crate::mini_buddy::MiniBuddy`] rely on this to find a slot's
    /// base by masking a pointer inside it.
    fn data_start(&self) -> usize {
        let header = std::mem::size_of::<BlockHeader>();
        if self.node_size.is_power_of_two() {
            (header + self.node_size - 1) & !(self.node_size - 1)
        } else {
            header
        }
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        self.delete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buddy::{BuddyAllocator, BuddyConfig};

    fn test_pool<T>(block_size: usize) -> Pool<T> {
        let buddy = Arc::new(BuddyAllocator::new(BuddyConfig::default()));
        Pool::new(buddy, block_size).unwrap()
    }

    #[test]
    fn alloc_then_free_reuses_slot_lifo() {
        let mut pool: Pool<u64> = test_pool(4096);
        let a = pool.alloc().unwrap();
        pool.free(a);
        let b = pool.alloc().unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn many_allocations_span_multiple_blocks() {
        let mut pool: Pool<[u8; 64]> = test_pool(4096);
        let mut nodes = Vec::new();
        for _ in 0..500 {
            nodes.push(pool.alloc().unwrap());
        }
        assert_eq!(pool.live_nodes(), 500);
        for n in nodes {
            pool.free(n);
        }
        assert_eq!(pool.live_nodes(), 0);
    }

    #[test]
    fn delete_returns_blocks_to_buddy() {
        let buddy = Arc::new(BuddyAllocator::new(BuddyConfig::default()));
        let mut pool: Pool<u64> = Pool::new(Arc::clone(&buddy), 4096).unwrap();
        for _ in 0..200 {
            pool.alloc().unwrap();
        }
        pool.delete();
        assert_eq!(buddy.stats().live_bytes, 0);
    }

    #[test]
    fn stats_reports_blocks_and_live_nodes() {
        let mut pool: Pool<[u8; 64]> = test_pool(4096);
        for _ in 0..10 {
            pool.alloc().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.live_nodes, 10);
        assert_eq!(stats.block_count, 1);
    }

    #[test]
    fn emptied_non_sole_block_returns_to_buddy() {
        // header (32 bytes) rounds up to a 64-byte node-aligned data start,
        // leaving (4096 - 64) / 64 == 63 slots in the first block.
        let buddy = Arc::new(BuddyAllocator::new(BuddyConfig::default()));
        let mut pool: Pool<[u8; 64]> = Pool::new(Arc::clone(&buddy), 4096).unwrap();
        let mut first_block: Vec<_> = (0..63).map(|_| pool.alloc().unwrap()).collect();
        let second_block_node = pool.alloc().unwrap();
        assert_eq!(pool.stats().block_count, 2);

        for n in first_block.drain(..) {
            pool.free(n);
        }
        assert_eq!(pool.stats().block_count, 1);
        assert_eq!(buddy.stats().live_bytes, 4096);

        pool.free(second_block_node);
    }

    #[test]
    fn sole_block_is_kept_even_when_fully_emptied() {
        let buddy = Arc::new(BuddyAllocator::new(BuddyConfig::default()));
        let mut pool: Pool<u64> = Pool::new(Arc::clone(&buddy), 4096).unwrap();
        let a = pool.alloc().unwrap();
        pool.free(a);
        assert_eq!(pool.stats().block_count, 1);
        assert_eq!(buddy.stats().live_bytes, 4096);
    }

    #[test]
    fn invalid_config_rejected() {
        let buddy = Arc::new(BuddyAllocator::new(BuddyConfig::default()));
        let result: Result<Pool<u64>, _> = Pool::new(buddy, 100);
        assert!(matches!(result, Err(PoolError::InvalidConfig)));
    }
}
