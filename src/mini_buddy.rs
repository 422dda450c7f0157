//! Single-threaded buddy allocator that subdivides one radix-tree node
//! slot (128 bytes) into 8/16/32/64/128-byte sub-blocks.
//!
//! Every [`crate::radix::RadixTree`] owns exactly one of these. It never
//! takes a lock — radix tree mutation is already serialized by the
//! caller — and draws its 128-byte superblocks from a dedicated
//! [`crate::node_pool::Pool`] rather than straight from the shared
//! buddy allocator, so small per-tree metadata churn never contends with
//! unrelated trees. The split/merge shape mirrors
//! [`crate::buddy::BuddyAllocator`] one level down in granularity, with
//! the locking stripped out, matching the teacher's distinction between
//! the globally locked `page_alloc` and the lock-free `pcp` per-CPU
//! pages that still use the same split/merge arithmetic.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::buddy::BuddyAllocator;
use crate::error::PoolError;
use crate::node_pool::Pool;

pub const NODE_SIZE: usize = 128;
const MIN_SZ: usize = 8; // smallest sub-block
const NUM_CLASSES: usize = 5; // 8, 16, 32, 64, 128

#[repr(C)]
struct SuperblockSlot([u8; NODE_SIZE]);

#[inline]
fn size_to_class(size: usize) -> usize {
    let size = size.max(MIN_SZ).next_power_of_two();
    (usize::BITS - (size - 1).leading_zeros()) as usize - 3 // log2(8) == 3
}

#[inline]
fn class_size(class: usize) -> usize {
    MIN_SZ << class
}

#[repr(C)]
struct FreeNode {
    first_word: usize, // bit 3 is the free bit; low 3 bits (mask below) hold the size class
    next: *mut u8,
    prev: *mut u8,
}

// spec calls for the free bit in bit 2 with the low 2 bits holding the class,
// but this allocator has 5 size classes (8..=128) and 2 bits only cover 4;
// the free bit is pushed up to bit 3 and the class occupies bits 0..=2 instead.
const FREE_BIT: usize = 1 << 3;
const CLASS_MASK: usize = 0b111;

#[inline]
unsafe fn node_of(ptr: *mut u8) -> *mut FreeNode {
    ptr as *mut FreeNode
}

/// Per-radix-tree mini allocator for 8..=128 byte node slots.
pub struct MiniBuddy {
    pool: Pool<SuperblockSlot>,
    free_lists: [*mut u8; NUM_CLASSES],
    live_bytes: usize,
}

impl MiniBuddy {
    pub fn new(buddy: Arc<BuddyAllocator>, pool_block_size: usize) -> Result<Self, PoolError> {
        Ok(Self {
            pool: Pool::new(buddy, pool_block_size)?,
            free_lists: [std::ptr::null_mut(); NUM_CLASSES],
            live_bytes: 0,
        })
    }

    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        assert!(size <= NODE_SIZE, "mini_buddy: request exceeds node size");
        let class = size_to_class(size);

        let mut found = None;
        for c in class..NUM_CLASSES {
            if !self.free_lists[c].is_null() {
                found = Some(c);
                break;
            }
        }

        let (mut block, mut cur_class) = match found {
            Some(c) => (self.pop_free(c), c),
            None => {
                let slot = self.pool.alloc().ok()?;
                let block = slot.as_ptr() as *mut u8;
                unsafe { (*node_of(block)).first_word = 0 };
                (block, NUM_CLASSES - 1)
            }
        };

        while cur_class > class {
            cur_class -= 1;
            let block_size = class_size(cur_class);
            let buddy_ptr = unsafe { block.add(block_size) };
            self.push_free(cur_class, buddy_ptr);
        }

        self.live_bytes += class_size(class);
        NonNull::new(block)
    }

    pub fn free(&mut self, ptr: NonNull<u8>, size: usize) {
        let class = size_to_class(size);
        self.live_bytes -= class_size(class);

        let mut cur_ptr = ptr.as_ptr();
        let mut cur_class = class;

        while cur_class < NUM_CLASSES - 1 {
            let block_size = class_size(cur_class);
            // The enclosing 128-byte slot is the merge domain; compute
            // the buddy's offset within it exactly as the shared buddy
            // allocator does within a superblock.
            let slot_base = (cur_ptr as usize) & !(NODE_SIZE - 1);
            let offset = (cur_ptr as usize) - slot_base;
            let buddy_offset = offset ^ block_size;
            let buddy_ptr = (slot_base + buddy_offset) as *mut u8;

            let mergeable = unsafe { self.is_free_at(buddy_ptr, cur_class) };
            if !mergeable {
                break;
            }

            self.unlink_free(cur_class, buddy_ptr);
            cur_ptr = cur_ptr.min(buddy_ptr);
            cur_class += 1;
        }

        if cur_class == NUM_CLASSES - 1 {
            // Whole slot reassembled; hand it back to the node pool so
            // the pool's own free-list/bump bookkeeping takes over.
            let slot = unsafe { NonNull::new_unchecked(cur_ptr as *mut SuperblockSlot) };
            self.pool.free(slot);
            return;
        }

        self.push_free(cur_class, cur_ptr);
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// Forgets every free list and live block, keeping backing
    /// superblocks cached in the node pool for reuse.
    pub fn clear(&mut self) {
        self.free_lists = [std::ptr::null_mut(); NUM_CLASSES];
        self.live_bytes = 0;
        self.pool.clear();
    }

    /// Releases every backing superblock to the shared buddy allocator.
    pub fn delete(&mut self) {
        self.free_lists = [std::ptr::null_mut(); NUM_CLASSES];
        self.live_bytes = 0;
        self.pool.delete();
    }

    unsafe fn is_free_at(&self, ptr: *mut u8, class: usize) -> bool {
        let node = node_of(ptr);
        let word = unsafe { (*node).first_word };
        word & FREE_BIT != 0 && word & CLASS_MASK == class
    }

    /// O(1) header read; the size class is stamped into the node's own
    /// first word when it is freed rather than discovered by scanning lists.
    fn node_class(&self, ptr: *mut u8) -> usize {
        let word = unsafe { (*node_of(ptr)).first_word };
        if word & FREE_BIT == 0 {
            return usize::MAX;
        }
        word & CLASS_MASK
    }

    fn push_free(&mut self, class: usize, ptr: *mut u8) {
        let node = unsafe { node_of(ptr) };
        unsafe {
            (*node).first_word = FREE_BIT | class;
            (*node).prev = std::ptr::null_mut();
            (*node).next = self.free_lists[class];
            if !self.free_lists[class].is_null() {
                (*node_of(self.free_lists[class])).prev = ptr;
            }
        }
        self.free_lists[class] = ptr;
    }

    fn pop_free(&mut self, class: usize) -> *mut u8 {
        let head = self.free_lists[class];
        self.unlink_free(class, head);
        unsafe { (*node_of(head)).first_word = 0 };
        head
    }

    fn unlink_free(&mut self, class: usize, ptr: *mut u8) {
        let node = unsafe { node_of(ptr) };
        let (prev, next) = unsafe { ((*node).prev, (*node).next) };
        if prev.is_null() {
            self.free_lists[class] = next;
        } else {
            unsafe { (*node_of(prev)).next = next };
        }
        if !next.is_null() {
            unsafe { (*node_of(next)).prev = prev };
        }
    }
}

impl Drop for MiniBuddy {
    fn drop(&mut self) {
        self.pool.delete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buddy::{BuddyAllocator, BuddyConfig};

    fn test_mini() -> MiniBuddy {
        let buddy = Arc::new(BuddyAllocator::new(BuddyConfig::default()));
        MiniBuddy::new(buddy, 1 << 15).unwrap()
    }

    #[test]
    fn alloc_free_roundtrip_reuses_block() {
        let mut m = test_mini();
        let p = m.alloc(16).unwrap();
        m.free(p, 16);
        let q = m.alloc(16).unwrap();
        assert_eq!(p.as_ptr(), q.as_ptr());
    }

    #[test]
    fn mixed_sizes_do_not_overlap() {
        let mut m = test_mini();
        let a = m.alloc(8).unwrap();
        let b = m.alloc(32).unwrap();
        let c = m.alloc(64).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_ne!(b.as_ptr(), c.as_ptr());
        m.free(a, 8);
        m.free(b, 32);
        m.free(c, 64);
        assert_eq!(m.live_bytes(), 0);
    }

    #[test]
    fn full_merge_returns_slot_to_pool() {
        let mut m = test_mini();
        let mut nodes = Vec::new();
        for _ in 0..NUM_CLASSES {
            nodes.push(m.alloc(MIN_SZ).unwrap());
        }
        // Fill one whole 128-byte slot's worth at the smallest class,
        // then free them all and confirm the merge chain completes.
        let mut all = Vec::new();
        for _ in 0..(NODE_SIZE / MIN_SZ) {
            all.push(m.alloc(MIN_SZ).unwrap());
        }
        for p in all {
            m.free(p, MIN_SZ);
        }
        for p in nodes.drain(..) {
            m.free(p, MIN_SZ);
        }
        assert_eq!(m.live_bytes(), 0);
    }
}
