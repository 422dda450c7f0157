//! Free-list node layouts stored headerlessly in the first bytes of a
//! free block.
//!
//! Two layouts share field positions so a block can migrate between the
//! locked, doubly-linked list and the lock-free, singly-linked list
//! without rewriting: `first_word` at offset 0, a pointer-sized field at
//! offset 8 (`next` / `atomic_next`), a pointer-sized field at offset 16
//! (`prev` / padding), and `p2` at offset 24.
//!
//! The free bit lives in the LSB of `first_word`. On the locked list it
//! is `1` (free). On the lock-free list it is deliberately `0`, so that
//! the normal-path merge scan — which only ever inspects `first_word`'s
//! LSB — never tries to absorb a block that a contending thread is
//! still holding onto.

use std::ptr::NonNull;
use std::sync::atomic::AtomicPtr;

#[repr(C)]
pub struct LockedFreeNode {
    pub first_word: usize,
    pub next: *mut u8,
    pub prev: *mut u8,
    pub p2: u32,
}

#[repr(C)]
pub struct LockFreeNode {
    pub first_word: usize,
    pub atomic_next: AtomicPtr<u8>,
    pub _pad: usize,
    pub p2: u32,
}

const _: () = assert!(std::mem::size_of::<LockedFreeNode>() <= 32);
const _: () = assert!(std::mem::size_of::<LockFreeNode>() <= 32);
const _: () = assert!(std::mem::offset_of!(LockedFreeNode, next) == std::mem::offset_of!(LockFreeNode, atomic_next));
const _: () = assert!(std::mem::offset_of!(LockedFreeNode, p2) == std::mem::offset_of!(LockFreeNode, p2));

/// Read the free bit (LSB of the first machine word) at `ptr`.
#[inline]
pub unsafe fn read_free_bit(ptr: NonNull<u8>) -> bool {
    unsafe { (*(ptr.as_ptr() as *const usize) & 1) != 0 }
}

/// Read the `p2` field, valid only while the block sits on a free list.
#[inline]
pub unsafe fn read_p2(ptr: NonNull<u8>) -> u32 {
    unsafe { (*(ptr.as_ptr() as *const LockedFreeNode)).p2 }
}

#[inline]
pub unsafe fn locked_node(ptr: NonNull<u8>) -> *mut LockedFreeNode {
    ptr.as_ptr() as *mut LockedFreeNode
}

#[inline]
pub unsafe fn lockfree_node(ptr: NonNull<u8>) -> *mut LockFreeNode {
    ptr.as_ptr() as *mut LockFreeNode
}
