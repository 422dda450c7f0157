//! Power-of-two, naturally-aligned, headerless buddy allocator.
//!
//! Grounded on the teacher's physical page-frame allocator
//! (`mm::page_alloc::PageAllocator`): an array of per-order free lists, a
//! bitmap-style scan for the smallest sufficient order, iterative
//! splitting on alloc, and iterative buddy-merge on free. The teacher
//! indexes free lists by page-frame number under a single `IrqMutex`;
//! this allocator instead stores free-list nodes headerlessly inside the
//! blocks themselves (addresses instead of frame numbers) and adds the
//! lock-elision fallback path from spec.md §4.2 — grounded on the
//! teacher's per-CPU page cache (`pcp_try_alloc`/`pcp_try_free`), whose
//! CAS-loop shape is reused here for the lock-free free lists.

mod freelist;
mod os;

pub use os::{AlignedMallocSource, MmapSource, OsRegionSource};

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use bitflags::bitflags;

use freelist::{locked_node, lockfree_node, read_free_bit, read_p2};

pub const MIN_P2: u32 = 5; // 32 B
pub const MAX_P2: u32 = 22; // 4 MiB
pub const NUM_CLASSES: usize = (MAX_P2 - MIN_P2 + 1) as usize;
pub const SUPERBLOCK_SIZE: usize = 1 << MAX_P2;

bitflags! {
    /// Per-allocation behavior flags, analogous to the teacher's
    /// `PageFlags` bitset passed alongside a page-frame request.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct AllocFlags: u32 {
        /// Zero the block before returning it. Off by default since most
        /// callers (the node pool, radix tree nodes) initialize every
        /// byte they care about themselves.
        const ZERO_ON_ALLOC = 1 << 0;
    }
}

#[inline]
fn class_of_p2(p2: u32) -> usize {
    (p2 - MIN_P2) as usize
}

#[inline]
fn size_to_p2(size: usize) -> u32 {
    let size = size.max(1 << MIN_P2);
    let p2 = (usize::BITS - (size - 1).leading_zeros()).max(MIN_P2);
    p2
}

/// Read-only snapshot for diagnostics, analogous to the teacher's
/// `HeapStats`/`get_page_allocator_stats`. Not part of the allocator's
/// correctness contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuddyStats {
    pub live_bytes: usize,
    pub free_bytes: usize,
    pub has_cached_spare: bool,
}

struct ClassList {
    head: *mut u8,
}

// SAFETY: access to `head` is always made while holding `lock`, or via
// the lock-free list which is not this type.
unsafe impl Send for ClassList {}

/// Configuration for [`BuddyAllocator::new`].
pub struct BuddyConfig {
    pub abort_on_oom: bool,
    pub os_source: Box<dyn OsRegionSource>,
    pub default_flags: AllocFlags,
}

impl Default for BuddyConfig {
    fn default() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                let os_source: Box<dyn OsRegionSource> = Box::new(MmapSource::new());
            } else {
                let os_source: Box<dyn OsRegionSource> = Box::new(AlignedMallocSource::new());
            }
        }
        Self {
            abort_on_oom: false,
            os_source,
            default_flags: AllocFlags::empty(),
        }
    }
}

pub struct BuddyAllocator {
    lock: AtomicBool,
    locked_lists: [ClassList; NUM_CLASSES],
    lockfree_lists: [AtomicPtr<u8>; NUM_CLASSES],
    cached_spare: AtomicPtr<u8>,
    os: Box<dyn OsRegionSource>,
    abort_on_oom: bool,
    default_flags: AllocFlags,
    live_bytes: AtomicUsize,
    free_bytes: AtomicUsize,
    #[cfg(feature = "debug-tracker")]
    tracker: std::sync::Mutex<std::collections::HashMap<usize, usize>>,
}

// SAFETY: every mutable field is either behind `lock` or a lock-free
// atomic primitive designed for concurrent use.
unsafe impl Send for BuddyAllocator {}
unsafe impl Sync for BuddyAllocator {}

impl BuddyAllocator {
    pub fn new(config: BuddyConfig) -> Self {
        Self {
            lock: AtomicBool::new(false),
            locked_lists: std::array::from_fn(|_| ClassList {
                head: std::ptr::null_mut(),
            }),
            lockfree_lists: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
            cached_spare: AtomicPtr::new(std::ptr::null_mut()),
            os: config.os_source,
            abort_on_oom: config.abort_on_oom,
            default_flags: config.default_flags,
            live_bytes: AtomicUsize::new(0),
            free_bytes: AtomicUsize::new(0),
            #[cfg(feature = "debug-tracker")]
            tracker: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Round `size` up to a power of two in `[32, 4 MiB]` and hand back a
    /// naturally aligned block, or `None` for `size == 0`.
    ///
    /// # Panics
    ///
    /// Panics if `size` rounds to an exponent above [`MAX_P2`] — spec.md
    /// §4.2 treats this as a programmer error, not a recoverable one.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.alloc_with_flags(size, self.default_flags)
    }

    /// Like [`Self::alloc`] but overrides the allocator's default
    /// [`AllocFlags`] for this single request.
    pub fn alloc_with_flags(&self, size: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let p2 = size_to_p2(size);
        assert!(
            p2 <= MAX_P2,
            "buddy alloc: {size} bytes rounds to 2^{p2}, exceeds MAX_P2={MAX_P2}"
        );

        let class = class_of_p2(p2);
        let result = if self.try_lock() {
            let r = self.alloc_normal(class);
            self.unlock();
            r
        } else {
            self.alloc_contended(class)
        };

        match result {
            Some(ptr) => {
                self.live_bytes.fetch_add(1usize << p2, Ordering::Relaxed);
                if flags.contains(AllocFlags::ZERO_ON_ALLOC) {
                    // SAFETY: `ptr` is a freshly obtained block of at least
                    // `1 << p2` bytes that no one else holds a reference to.
                    unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, 1usize << p2) };
                }
                #[cfg(feature = "debug-tracker")]
                {
                    let mut tracker = self.tracker.lock().unwrap();
                    tracker.insert(ptr.as_ptr() as usize, 1usize << p2);
                }
                Some(ptr)
            }
            None => {
                log::warn!(
                    "buddy allocator: out of memory requesting {size} bytes (class {class})"
                );
                if self.abort_on_oom {
                    panic!("buddy allocator: out of memory and abort_on_oom is set");
                }
                None
            }
        }
    }

    /// `size` must be the exact size the block was allocated with
    /// (rounded up to its power of two). A null-equivalent free is a
    /// no-op; double-free/wrong-size free is undefined behavior (spec.md
    /// §7) unless the `debug-tracker` feature is enabled.
    pub fn free(&self, ptr: NonNull<u8>, size: usize) {
        let p2 = size_to_p2(size);
        let class = class_of_p2(p2);

        #[cfg(feature = "debug-tracker")]
        {
            let mut tracker = self.tracker.lock().unwrap();
            match tracker.remove(&(ptr.as_ptr() as usize)) {
                Some(tracked_size) if tracked_size == 1usize << p2 => {}
                Some(tracked_size) => panic!(
                    "buddy allocator: free of {:p} with size {size} (class {class}) but it was \
                     allocated with {tracked_size} bytes",
                    ptr.as_ptr()
                ),
                None => panic!(
                    "buddy allocator: double free or free of unallocated block at {:p}",
                    ptr.as_ptr()
                ),
            }
        }

        self.live_bytes
            .fetch_sub(1usize << p2, Ordering::Relaxed);

        if self.try_lock() {
            self.free_normal(ptr, class);
            self.drain_lockfree_migrations();
            self.unlock();
        } else {
            self.free_contended(ptr, class);
        }
    }

    pub fn stats(&self) -> BuddyStats {
        BuddyStats {
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            free_bytes: self.free_bytes.load(Ordering::Relaxed),
            has_cached_spare: !self.cached_spare.load(Ordering::Relaxed).is_null(),
        }
    }

    /// Releases only the cached spare superblock. The caller must have
    /// already freed every live allocation.
    pub fn free_buffers(&self) {
        let spare = self.cached_spare.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if let Some(p) = NonNull::new(spare) {
            unsafe { self.os.unmap(p, SUPERBLOCK_SIZE) };
        }
    }

    // ---- locking -----------------------------------------------------

    fn try_lock(&self) -> bool {
        self.lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }

    // ---- normal (locked) path -----------------------------------------

    fn list_push_locked(&self, class: usize, ptr: NonNull<u8>) {
        let list = &self.locked_lists[class];
        let node = unsafe { locked_node(ptr) };
        unsafe {
            (*node).first_word = 1; // free bit set
            (*node).prev = std::ptr::null_mut();
            (*node).next = list.head;
            (*node).p2 = (class as u32) + MIN_P2;
            if !list.head.is_null() {
                (*locked_node(NonNull::new_unchecked(list.head))).prev = ptr.as_ptr();
            }
        }
        // SAFETY: sole mutator while holding `lock`.
        unsafe {
            let list_mut = &self.locked_lists[class] as *const ClassList as *mut ClassList;
            (*list_mut).head = ptr.as_ptr();
        }
        self.free_bytes
            .fetch_add(1usize << ((class as u32) + MIN_P2), Ordering::Relaxed);
    }

    fn list_pop_front_locked(&self, class: usize) -> Option<NonNull<u8>> {
        let head = self.locked_lists[class].head;
        let ptr = NonNull::new(head)?;
        self.list_unlink_locked(class, ptr);
        Some(ptr)
    }

    fn list_unlink_locked(&self, class: usize, ptr: NonNull<u8>) {
        let node = unsafe { locked_node(ptr) };
        let (prev, next) = unsafe { ((*node).prev, (*node).next) };
        if let Some(prev_ptr) = NonNull::new(prev) {
            unsafe { (*locked_node(prev_ptr)).next = next };
        } else {
            let list_mut = &self.locked_lists[class] as *const ClassList as *mut ClassList;
            unsafe { (*list_mut).head = next };
        }
        if let Some(next_ptr) = NonNull::new(next) {
            unsafe { (*locked_node(next_ptr)).prev = prev };
        }
        self.free_bytes
            .fetch_sub(1usize << ((class as u32) + MIN_P2), Ordering::Relaxed);
    }

    fn alloc_normal(&self, class: usize) -> Option<NonNull<u8>> {
        let mut found_class = None;
        for c in class..NUM_CLASSES {
            if !self.locked_lists[c].head.is_null() {
                found_class = Some(c);
                break;
            }
        }

        let (mut block, mut cur_class) = match found_class {
            Some(c) => (self.list_pop_front_locked(c)?, c),
            None => (self.obtain_superblock()?, NUM_CLASSES - 1),
        };

        while cur_class > class {
            cur_class -= 1;
            let block_size = 1usize << ((cur_class as u32) + MIN_P2);
            let buddy = unsafe { NonNull::new_unchecked(block.as_ptr().add(block_size)) };
            self.list_push_locked(cur_class, buddy);
            // prefetch hint before continuing the split loop.
            #[cfg(target_arch = "x86_64")]
            unsafe {
                std::arch::x86_64::_mm_prefetch(
                    block.as_ptr() as *const i8,
                    std::arch::x86_64::_MM_HINT_T0,
                );
            }
            let _ = &mut block;
        }

        Some(block)
    }

    fn obtain_superblock(&self) -> Option<NonNull<u8>> {
        let spare = self.cached_spare.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if let Some(p) = NonNull::new(spare) {
            log::debug!("buddy: reusing cached spare superblock");
            return Some(p);
        }
        log::debug!("buddy: mapping a fresh {SUPERBLOCK_SIZE}-byte superblock from the OS");
        self.os.map(SUPERBLOCK_SIZE)
    }

    fn free_normal(&self, ptr: NonNull<u8>, class: usize) {
        let mut cur_ptr = ptr;
        let mut cur_class = class;

        while cur_class < NUM_CLASSES - 1 {
            let block_size = 1usize << ((cur_class as u32) + MIN_P2);
            let base = cur_ptr.as_ptr() as usize;
            let superblock_base = base & !(SUPERBLOCK_SIZE - 1);
            let offset = base - superblock_base;
            let buddy_offset = offset ^ block_size;
            let buddy_addr = (superblock_base + buddy_offset) as *mut u8;
            let buddy = unsafe { NonNull::new_unchecked(buddy_addr) };

            let mergeable = unsafe { read_free_bit(buddy) && read_p2(buddy) == (cur_class as u32) + MIN_P2 };
            if !mergeable {
                break;
            }

            self.list_unlink_locked(cur_class, buddy);
            cur_ptr = if buddy_addr < cur_ptr.as_ptr() {
                buddy
            } else {
                cur_ptr
            };
            cur_class += 1;
        }

        if cur_class == NUM_CLASSES - 1 {
            let displaced = self
                .cached_spare
                .swap(cur_ptr.as_ptr(), Ordering::AcqRel);
            if let Some(old) = NonNull::new(displaced) {
                unsafe { self.os.unmap(old, SUPERBLOCK_SIZE) };
            }
            return;
        }

        self.list_push_locked(cur_class, cur_ptr);
    }

    // ---- lock-free (contended) path ------------------------------------

    fn alloc_contended(&self, class: usize) -> Option<NonNull<u8>> {
        if let Some(ptr) = self.lockfree_pop(class) {
            return Some(ptr);
        }

        // Cut a fresh superblock without touching the locked state,
        // splitting down to `class` and pushing the complementary
        // buddies onto the lock-free lists (never merged back until a
        // holder of `lock` migrates them in `drain_lockfree_migrations`).
        let block = self.os.map(SUPERBLOCK_SIZE)?;
        let mut cur_class = NUM_CLASSES - 1;
        let mut cur_block = block;
        while cur_class > class {
            cur_class -= 1;
            let block_size = 1usize << ((cur_class as u32) + MIN_P2);
            let buddy = unsafe { NonNull::new_unchecked(cur_block.as_ptr().add(block_size)) };
            self.lockfree_push(cur_class, buddy);
        }
        Some(cur_block)
    }

    fn free_contended(&self, ptr: NonNull<u8>, class: usize) {
        self.lockfree_push(class, ptr);
    }

    fn lockfree_push(&self, class: usize, ptr: NonNull<u8>) {
        let node = unsafe { lockfree_node(ptr) };
        unsafe {
            (*node).first_word = 0; // free bit deliberately 0
            (*node).p2 = (class as u32) + MIN_P2;
        }
        let list = &self.lockfree_lists[class];
        let mut head = list.load(Ordering::Acquire);
        loop {
            unsafe { (*node).atomic_next.store(head, Ordering::Relaxed) };
            match list.compare_exchange_weak(
                head,
                ptr.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        self.free_bytes
            .fetch_add(1usize << ((class as u32) + MIN_P2), Ordering::Relaxed);
    }

    fn lockfree_pop(&self, class: usize) -> Option<NonNull<u8>> {
        let list = &self.lockfree_lists[class];
        loop {
            let head = list.load(Ordering::Acquire);
            let head_ptr = NonNull::new(head)?;
            let next = unsafe { (*lockfree_node(head_ptr)).atomic_next.load(Ordering::Relaxed) };
            if list
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.free_bytes
                    .fetch_sub(1usize << ((class as u32) + MIN_P2), Ordering::Relaxed);
                return Some(head_ptr);
            }
        }
    }

    /// Move any blocks sitting on the lock-free lists back onto the
    /// locked lists, re-marking their free bit so the locked merge scan
    /// can see them. Runs opportunistically at the end of every
    /// lock-holding free, per spec.md §4.2's "naturally migrate" note.
    fn drain_lockfree_migrations(&self) {
        for class in 0..NUM_CLASSES {
            while let Some(ptr) = self.lockfree_pop(class) {
                self.list_push_locked(class, ptr);
            }
        }
    }
}

impl Drop for BuddyAllocator {
    fn drop(&mut self) {
        self.free_buffers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_allocator() -> BuddyAllocator {
        BuddyAllocator::new(BuddyConfig {
            abort_on_oom: false,
            os_source: Box::new(MmapSource::new()),
            default_flags: AllocFlags::empty(),
        })
    }

    #[test]
    fn alloc_rounds_to_pow2_and_aligns() {
        let a = test_allocator();
        let p = a.alloc(40).expect("alloc should succeed");
        assert_eq!(p.as_ptr() as usize % 64, 0);
        a.free(p, 40);
    }

    #[test]
    fn zero_size_returns_none() {
        let a = test_allocator();
        assert!(a.alloc(0).is_none());
    }

    #[test]
    #[should_panic]
    fn oversize_request_aborts() {
        let a = test_allocator();
        a.alloc((1usize << MAX_P2) + 1);
    }

    #[test]
    fn zero_on_alloc_flag_zeroes_the_block() {
        let a = test_allocator();
        let p = a.alloc_with_flags(64, AllocFlags::ZERO_ON_ALLOC).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
        a.free(p, 64);
    }

    #[test]
    #[cfg(feature = "debug-tracker")]
    #[should_panic(expected = "double free")]
    fn debug_tracker_catches_double_free() {
        let a = test_allocator();
        let p = a.alloc(64).unwrap();
        a.free(p, 64);
        a.free(p, 64);
    }

    #[test]
    #[cfg(feature = "debug-tracker")]
    #[should_panic(expected = "allocated with")]
    fn debug_tracker_catches_wrong_size_free() {
        let a = test_allocator();
        let p = a.alloc(64).unwrap();
        a.free(p, 128);
    }

    #[test]
    fn alloc_free_then_new_alloc_reuses_merged_block() {
        let a = test_allocator();
        let p1 = a.alloc(64).unwrap();
        a.free(p1, 64);
        let p2 = a.alloc(64).unwrap();
        assert_eq!(p1.as_ptr(), p2.as_ptr());
        a.free(p2, 64);
    }

    #[test]
    fn buddy_sanity_end_to_end() {
        let a = test_allocator();
        let p = a.alloc(40).unwrap();
        assert_eq!(p.as_ptr() as usize % 64, 0);
        a.free(p, 40);
        assert_eq!(a.stats().live_bytes, 0);
        a.free_buffers();
        assert!(!a.stats().has_cached_spare);
    }

    #[test]
    fn many_allocations_of_varied_sizes_round_trip() {
        let a = test_allocator();
        let sizes = [32usize, 48, 64, 100, 200, 1000, 5000, 1 << 16];
        let mut blocks = Vec::new();
        for &s in &sizes {
            blocks.push((a.alloc(s).unwrap(), s));
        }
        for (p, s) in blocks {
            a.free(p, s);
        }
        assert_eq!(a.stats().live_bytes, 0);
    }

    #[test]
    fn multithreaded_stress_preserves_integrity() {
        use std::sync::Arc;
        use std::thread;

        let a = Arc::new(test_allocator());
        let mut handles = Vec::new();
        for _ in 0..5 {
            let a = Arc::clone(&a);
            handles.push(thread::spawn(move || {
                let mut rng_state: u64 = 0x2545F4914F6CDD1D ^ (&a as *const _ as u64);
                let mut live = Vec::new();
                for _ in 0..1000 {
                    rng_state ^= rng_state << 13;
                    rng_state ^= rng_state >> 7;
                    rng_state ^= rng_state << 17;
                    let do_alloc = live.is_empty() || rng_state % 2 == 0;
                    if do_alloc {
                        let size = 32 + (rng_state as usize % ((2 << 20) - 32));
                        if let Some(p) = a.alloc(size) {
                            live.push((p, crate::align::next_pow2_usize(size.max(32))));
                        }
                    } else {
                        let idx = rng_state as usize % live.len();
                        let (p, s) = live.swap_remove(idx);
                        a.free(p, s);
                    }
                }
                for (p, s) in live {
                    a.free(p, s);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(a.stats().live_bytes, 0);
    }
}
